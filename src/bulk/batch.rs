//! Splitting a sequence of writes into size-bounded commands.

use super::operation::CommandKind;
use crate::transport::ServerLimits;

/// Room a write command needs on top of its largest document.
pub const COMMAND_OVERHEAD: usize = 16 * 1024;

/// Largest encoded payload for one write command: a maximum-size document
/// plus command overhead, but never more than one wire message.
pub fn batch_byte_limit(limits: &ServerLimits) -> usize {
    (limits.max_bson_object_size + COMMAND_OVERHEAD).min(limits.max_message_size_bytes)
}

/// A run of same-kind operations sent as one command.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    /// Command carrying the batch.
    pub kind: CommandKind,
    /// Operations in submission order.
    pub items: Vec<T>,
    /// Position of each item in the originally submitted sequence.
    pub indexes: Vec<usize>,
    /// Sum of the items' encoded sizes.
    pub bytes: usize,
}

impl<T> Batch<T> {
    fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            items: Vec::new(),
            indexes: Vec::new(),
            bytes: 0,
        }
    }

    /// Number of operations in the batch.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Global index of the item at `local` within this batch.
    pub fn global_index(&self, local: usize) -> usize {
        self.indexes.get(local).copied().unwrap_or(local)
    }

    fn accepts(&self, kind: CommandKind, size: usize, max_count: usize, max_bytes: usize) -> bool {
        self.kind == kind
            && self.items.len() < max_count
            && (self.items.is_empty() || self.bytes + size <= max_bytes)
    }
}

/// Greedily split `ops` (global index, operation) into batches.
///
/// A batch ends when the command kind changes, when it holds `max_count`
/// operations, or when the next operation would push it past `max_bytes`.
/// An operation larger than `max_bytes` on its own still forms a batch.
pub fn split_batches<T, K, S>(
    ops: impl IntoIterator<Item = (usize, T)>,
    kind_of: K,
    size_of: S,
    max_count: usize,
    max_bytes: usize,
) -> Vec<Batch<T>>
where
    K: Fn(&T) -> CommandKind,
    S: Fn(&T) -> usize,
{
    let max_count = max_count.max(1);
    let mut batches: Vec<Batch<T>> = Vec::new();

    for (index, op) in ops {
        let kind = kind_of(&op);
        let size = size_of(&op);
        let fits = batches
            .last()
            .map_or(false, |batch| batch.accepts(kind, size, max_count, max_bytes));
        if !fits {
            batches.push(Batch::new(kind));
        }
        if let Some(batch) = batches.last_mut() {
            batch.items.push(op);
            batch.indexes.push(index);
            batch.bytes += size;
        }
    }
    batches
}

/// Stable reorder putting inserts first, then updates, then deletes.
pub fn group_by_kind<T, K>(mut ops: Vec<(usize, T)>, kind_of: K) -> Vec<(usize, T)>
where
    K: Fn(&T) -> CommandKind,
{
    ops.sort_by_key(|(_, op)| kind_of(op));
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use CommandKind::*;

    fn split(
        ops: &[(CommandKind, usize)],
        max_count: usize,
        max_bytes: usize,
    ) -> Vec<Batch<(CommandKind, usize)>> {
        split_batches(
            ops.iter().copied().enumerate(),
            |op| op.0,
            |op| op.1,
            max_count,
            max_bytes,
        )
    }

    #[test]
    fn test_breaks_on_kind_change() {
        let batches = split(&[(Insert, 1), (Insert, 1), (Update, 1), (Insert, 1)], 10, 100);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].indexes, vec![0, 1]);
        assert_eq!(batches[1].kind, Update);
        assert_eq!(batches[2].indexes, vec![3]);
    }

    #[test]
    fn test_count_limit() {
        let ops: Vec<_> = (0..2100).map(|_| (Insert, 10)).collect();
        let batches = split(&ops, 1000, usize::MAX);
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 100]);
        assert_eq!(batches[2].global_index(0), 2000);
    }

    #[test]
    fn test_byte_limit() {
        let batches = split(&[(Insert, 40), (Insert, 40), (Insert, 40)], 10, 100);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].bytes, 80);
        assert_eq!(batches[1].indexes, vec![2]);
    }

    #[test]
    fn test_oversized_operation_stands_alone() {
        let batches = split(&[(Insert, 10), (Insert, 500), (Insert, 10)], 10, 100);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].indexes, vec![1]);
        assert_eq!(batches[1].bytes, 500);
    }

    #[test]
    fn test_byte_limit_respects_message_size() {
        let limits = ServerLimits::default();
        assert_eq!(
            batch_byte_limit(&limits),
            limits.max_bson_object_size + COMMAND_OVERHEAD
        );

        let small_messages = ServerLimits {
            max_bson_object_size: 1024 * 1024,
            max_message_size_bytes: 64 * 1024,
            ..ServerLimits::default()
        };
        assert_eq!(batch_byte_limit(&small_messages), 64 * 1024);
    }

    #[test]
    fn test_empty_input() {
        assert!(split(&[], 10, 100).is_empty());
    }

    #[test]
    fn test_group_by_kind_is_stable() {
        let ops = vec![
            (0, Insert),
            (1, Update),
            (2, Update),
            (3, Delete),
            (4, Insert),
            (5, Update),
        ];
        let grouped = group_by_kind(ops, |kind| *kind);
        let order: Vec<usize> = grouped.iter().map(|(index, _)| *index).collect();
        assert_eq!(order, vec![0, 4, 1, 2, 5, 3]);
    }
}
