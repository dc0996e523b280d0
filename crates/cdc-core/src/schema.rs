//! Read-only view onto destination-table schema, owned by the Source
//! Driver and consulted by the Batcher only through this trait (spec.md
//! §5: "Schema cache: owned by T1's upstream driver, read-only from T2
//! via a thread-safe lookup"). Keeping this a trait rather than a
//! concrete type is what lets the Batcher never reach into the Source
//! Driver's internals (spec.md §9's cyclic-handler redesign note).

use crate::msg::TableRef;

/// The slice of a destination table's schema the Sink Adapter needs:
/// which columns form the primary key, for last-writer-wins coalescing
/// within a flush (spec.md §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new(primary_key: Vec<String>) -> Self {
        Self { primary_key }
    }
}

/// Thread-safe, read-only schema lookup shared between T1 and T2.
pub trait SchemaLookup: Send + Sync {
    fn lookup(&self, dest: &TableRef) -> Option<TableSchema>;
}
