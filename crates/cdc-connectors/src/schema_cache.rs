//! Thread-safe schema cache owned by a Source Driver, read-only from the
//! Batcher via `cdc_core::SchemaLookup` (spec.md §5). Populated once per
//! configured rule at startup — there is no DDL-replication path (a
//! Non-goal), so primary-key columns never change for the lifetime of a
//! running pipeline.

use std::collections::HashMap;
use std::sync::RwLock;

use cdc_core::schema::{SchemaLookup, TableSchema};
use cdc_core::msg::TableRef;

#[derive(Default)]
pub struct SharedSchemaCache {
    by_dest: RwLock<HashMap<String, TableSchema>>,
}

impl SharedSchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, dest: &TableRef, schema: TableSchema) {
        self.by_dest.write().unwrap().insert(dest.key(), schema);
    }
}

impl SchemaLookup for SharedSchemaCache {
    fn lookup(&self, dest: &TableRef) -> Option<TableSchema> {
        self.by_dest.read().unwrap().get(&dest.key()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_lookup_round_trips() {
        let cache = SharedSchemaCache::new();
        let dest = TableRef::new("d", "t1");
        cache.set(&dest, TableSchema::new(vec!["id".into()]));
        let schema = cache.lookup(&dest).expect("schema present");
        assert_eq!(schema.primary_key, vec!["id".to_string()]);
    }

    #[test]
    fn lookup_misses_unset_table() {
        let cache = SharedSchemaCache::new();
        assert!(cache.lookup(&TableRef::new("d", "other")).is_none());
    }
}
