//! Key layout for descriptors, table data and the event log.
//!
//! ```text
//! /desc/{id}/meta                  descriptor kind and name
//! /desc/{id}/state                 descriptor status
//! /desc/{t}/col/{c}/{attr}         column state, name, type, default, comment
//! /desc/{t}/idx/{i}/{attr}         index state, definition, name
//! /desc/{t}/cst/{k}/{attr}         constraint state, definition
//! /desc/{type}/backref/{t}         type back-reference from a table
//! /data/{t}/{i}/{shard}{row}       index entries, sharded by a leading byte
//! /event/{element}/{status}        event log
//! ```

use serde::Serialize;

use super::spanset::Span;
use crate::element::{ColumnId, ConstraintId, DescId, IndexId};

/// Index id of every table's primary index.
pub const PRIMARY_INDEX_ID: IndexId = 1;

/// Number of shards an index keyspace is divided into.
pub const SHARD_COUNT: u16 = 256;

/// A contiguous range of shards `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ShardRange {
    /// First shard (inclusive).
    pub start: u16,
    /// Last shard (exclusive), at most [`SHARD_COUNT`].
    pub end: u16,
}

impl ShardRange {
    /// Every shard.
    pub const FULL: ShardRange = ShardRange {
        start: 0,
        end: SHARD_COUNT,
    };

    /// Create a range, clamped to the shard space.
    pub fn new(start: u16, end: u16) -> Self {
        let end = end.min(SHARD_COUNT);
        Self {
            start: start.min(end),
            end,
        }
    }

    /// Number of shards covered.
    pub fn len(&self) -> u16 {
        self.end - self.start
    }

    /// Check if the range covers no shards.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Whether `shard` falls in the range.
    pub fn contains(&self, shard: u16) -> bool {
        shard >= self.start && shard < self.end
    }

    /// Split into at most `parts` disjoint, contiguous, non-empty ranges.
    pub fn split(&self, parts: usize) -> Vec<ShardRange> {
        let len = self.len() as usize;
        if len == 0 {
            return Vec::new();
        }
        let parts = parts.clamp(1, len);
        (0..parts)
            .map(|i| {
                let lo = self.start as usize + len * i / parts;
                let hi = self.start as usize + len * (i + 1) / parts;
                ShardRange::new(lo as u16, hi as u16)
            })
            .collect()
    }
}

impl std::fmt::Display for ShardRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Prefix of everything stored for a descriptor.
pub fn descriptor_prefix(id: DescId) -> Vec<u8> {
    format!("/desc/{id}/").into_bytes()
}

/// Span of everything stored for a descriptor.
pub fn descriptor_span(id: DescId) -> Span {
    Span::prefix(descriptor_prefix(id))
}

/// `/desc/{id}/meta`.
pub fn descriptor_meta(id: DescId) -> Vec<u8> {
    format!("/desc/{id}/meta").into_bytes()
}

/// `/desc/{id}/state`.
pub fn descriptor_state(id: DescId) -> Vec<u8> {
    format!("/desc/{id}/state").into_bytes()
}

/// One attribute of a column, e.g. `state` or `name`.
pub fn column_key(table_id: DescId, column_id: ColumnId, attr: &str) -> Vec<u8> {
    format!("/desc/{table_id}/col/{column_id}/{attr}").into_bytes()
}

/// One attribute of an index.
pub fn index_key(table_id: DescId, index_id: IndexId, attr: &str) -> Vec<u8> {
    format!("/desc/{table_id}/idx/{index_id}/{attr}").into_bytes()
}

/// One attribute of a constraint.
pub fn constraint_key(table_id: DescId, constraint_id: ConstraintId, attr: &str) -> Vec<u8> {
    format!("/desc/{table_id}/cst/{constraint_id}/{attr}").into_bytes()
}

/// Marks `table_id` as using type `type_id`. Stored under the type.
pub fn back_reference(type_id: DescId, table_id: DescId) -> Vec<u8> {
    format!("/desc/{type_id}/backref/{table_id}").into_bytes()
}

/// Prefix of all index data of a table.
pub fn table_data_prefix(table_id: DescId) -> Vec<u8> {
    format!("/data/{table_id}/").into_bytes()
}

/// Span of all index data of a table.
pub fn table_data_span(table_id: DescId) -> Span {
    Span::prefix(table_data_prefix(table_id))
}

/// Prefix of one index's entries.
pub fn index_prefix(table_id: DescId, index_id: IndexId) -> Vec<u8> {
    format!("/data/{table_id}/{index_id}/").into_bytes()
}

/// Span of an index's entries restricted to a shard range.
pub fn index_span(table_id: DescId, index_id: IndexId, range: ShardRange) -> Span {
    let prefix = index_prefix(table_id, index_id);
    let bound = |shard: u16| {
        if shard >= SHARD_COUNT {
            Span::prefix_end(&prefix)
        } else {
            let mut key = prefix.clone();
            key.push(shard as u8);
            key
        }
    };
    Span::new(bound(range.start), bound(range.end))
}

/// Key of one index entry.
pub fn row_key(table_id: DescId, index_id: IndexId, shard: u8, row: u64) -> Vec<u8> {
    let mut key = index_prefix(table_id, index_id);
    key.push(shard);
    key.extend_from_slice(&row.to_be_bytes());
    key
}

/// Span of the whole event log.
pub fn event_span() -> Span {
    Span::prefix(b"/event/".to_vec())
}

/// Event recorded when `element` reached `status`.
pub fn event_key(element: &str, status: &str) -> Vec<u8> {
    format!("/event/{element}/{status}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_covers_range() {
        let parts = ShardRange::FULL.split(3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].start, 0);
        assert_eq!(parts[2].end, SHARD_COUNT);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_split_never_yields_empty_ranges() {
        let parts = ShardRange::new(10, 12).split(8);
        assert_eq!(parts, vec![ShardRange::new(10, 11), ShardRange::new(11, 12)]);
        assert!(ShardRange::new(5, 5).split(4).is_empty());
    }

    #[test]
    fn test_descriptor_prefixes_do_not_nest() {
        let short = descriptor_span(5);
        assert!(!short.contains_key(&descriptor_meta(52)));
        assert!(short.contains_key(&descriptor_meta(5)));
    }

    #[test]
    fn test_index_span_contains_rows_in_range() {
        let span = index_span(52, 2, ShardRange::new(0, 128));
        assert!(span.contains_key(&row_key(52, 2, 0, 7)));
        assert!(span.contains_key(&row_key(52, 2, 127, u64::MAX)));
        assert!(!span.contains_key(&row_key(52, 2, 128, 0)));
        assert!(!span.contains_key(&row_key(52, 3, 0, 0)));

        let full = index_span(52, 2, ShardRange::FULL);
        assert!(full.contains_key(&row_key(52, 2, 255, u64::MAX)));
    }
}
