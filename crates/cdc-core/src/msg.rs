//! The neutral row-mutation record and the upstream position token it carries.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

/// `(schema, table)` identity of a source or destination table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// The `schema:table` key used by the Rule Table and by the batcher's bucket map.
    pub fn key(&self) -> String {
        format!("{}:{}", self.schema, self.name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// The kind of row mutation a [`Msg`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

/// A row mapped by column name. Values are kept as `serde_json::Value` so a
/// single in-memory representation covers every upstream's native type
/// system without the core crate needing to know about any of them.
pub type Row = HashMap<String, Value>;

/// The neutral mutation record produced by every [`crate::SourceDriver`] decoder
/// and consumed by the Filter Chain, the Batcher, and ultimately a [`crate::SinkAdapter`].
#[derive(Debug, Clone)]
pub struct Msg {
    pub table_ref: TableRef,
    pub action: Action,
    /// New row for insert/update, the row being removed for delete.
    pub data: Row,
    /// Pre-image row for update; empty for insert/delete.
    pub old: Row,
    pub event_cursor: Cursor,
}

impl Msg {
    pub fn insert(table_ref: TableRef, data: Row, event_cursor: Cursor) -> Self {
        Self {
            table_ref,
            action: Action::Insert,
            data,
            old: Row::new(),
            event_cursor,
        }
    }

    pub fn update(table_ref: TableRef, old: Row, data: Row, event_cursor: Cursor) -> Self {
        Self {
            table_ref,
            action: Action::Update,
            data,
            old,
            event_cursor,
        }
    }

    pub fn delete(table_ref: TableRef, data: Row, event_cursor: Cursor) -> Self {
        Self {
            table_ref,
            action: Action::Delete,
            data,
            old: Row::new(),
            event_cursor,
        }
    }
}

/// Opaque, totally-ordered token identifying a point in one upstream's change
/// stream. The two variants correspond to the two supported sources; cursors
/// from different sources are never compared against each other.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Cursor {
    /// GTID-set string plus a monotonic epoch. The GTID-set itself is an
    /// append-only union of transaction IDs reported by the upstream; the
    /// epoch lets us order two cursors without re-parsing GTID-set algebra,
    /// since the upstream already guarantees its events arrive in order.
    Binlog { gtid_set: String, epoch: u64 },
    /// Opaque resume-token bytes from a document store's change stream,
    /// alongside the same epoch-ordering device.
    Stream { resume_token: Vec<u8>, epoch: u64 },
}

impl Cursor {
    pub fn epoch(&self) -> u64 {
        match self {
            Cursor::Binlog { epoch, .. } => *epoch,
            Cursor::Stream { epoch, .. } => *epoch,
        }
    }

    /// The kind tag persisted alongside a cursor in the Position Store.
    pub fn source_kind(&self) -> SourceKind {
        match self {
            Cursor::Binlog { .. } => SourceKind::Binlog,
            Cursor::Stream { .. } => SourceKind::Stream,
        }
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Cursor::Binlog { epoch: a, .. }, Cursor::Binlog { epoch: b, .. }) => {
                Some(a.cmp(b))
            }
            (Cursor::Stream { epoch: a, .. }, Cursor::Stream { epoch: b, .. }) => {
                Some(a.cmp(b))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Binlog,
    Stream,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ref_key_matches_schema_colon_table() {
        let t = TableRef::new("s1", "t1");
        assert_eq!(t.key(), "s1:t1");
        assert_eq!(t.to_string(), "s1.t1");
    }

    #[test]
    fn binlog_cursors_order_by_epoch() {
        let a = Cursor::Binlog {
            gtid_set: "a".into(),
            epoch: 1,
        };
        let b = Cursor::Binlog {
            gtid_set: "a:b".into(),
            epoch: 2,
        };
        assert!(a < b);
    }

    #[test]
    fn cursors_from_different_sources_are_incomparable() {
        let a = Cursor::Binlog {
            gtid_set: "a".into(),
            epoch: 1,
        };
        let b = Cursor::Stream {
            resume_token: vec![1],
            epoch: 1,
        };
        assert_eq!(a.partial_cmp(&b), None);
    }
}
