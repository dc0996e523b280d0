//! Static mapping from source `(schema, table)` to destination `(schema, table)`.

use std::collections::HashMap;

use crate::config::RuleConfig;
use crate::error::CdcError;
use crate::msg::TableRef;

/// A single routing entry. `rule_type` starts as `"init"` and is never
/// mutated by the core (kept for forward-compatibility with future rule
/// lifecycles, mirrored from the upstream config format).
#[derive(Debug, Clone)]
pub struct Rule {
    pub source_schema: String,
    pub source_table: String,
    pub dest_schema: String,
    pub dest_table: String,
    pub rule_type: String,
}

impl Rule {
    pub fn source_ref(&self) -> TableRef {
        TableRef::new(self.source_schema.clone(), self.source_table.clone())
    }

    pub fn dest_ref(&self) -> TableRef {
        TableRef::new(self.dest_schema.clone(), self.dest_table.clone())
    }

    fn source_key(&self) -> String {
        format!("{}:{}", self.source_schema, self.source_table)
    }
}

/// Built once at startup; exposes `lookup` in O(1).
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    by_source: HashMap<String, Rule>,
}

impl RuleTable {
    pub fn build(configs: &[RuleConfig]) -> Result<Self, CdcError> {
        let mut by_source = HashMap::with_capacity(configs.len());
        for c in configs {
            let rule = Rule {
                source_schema: c.source_schema.clone(),
                source_table: c.source_table.clone(),
                dest_schema: c.target_schema.clone(),
                dest_table: c.target_table.clone(),
                rule_type: "init".to_string(),
            };
            let key = rule.source_key();
            if by_source.insert(key.clone(), rule).is_some() {
                return Err(CdcError::Config(format!(
                    "duplicate rule for source table {key}"
                )));
            }
        }
        Ok(Self { by_source })
    }

    pub fn lookup(&self, schema: &str, table: &str) -> Option<&Rule> {
        self.by_source.get(&format!("{schema}:{table}"))
    }

    /// The full set of source tables this table is configured to watch, for
    /// installing an upstream inclusion filter (see `SourceDriver`).
    pub fn source_tables(&self) -> impl Iterator<Item = TableRef> + '_ {
        self.by_source.values().map(Rule::source_ref)
    }

    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_config(schema: &str, table: &str) -> RuleConfig {
        RuleConfig {
            source_schema: schema.to_string(),
            source_table: table.to_string(),
            target_schema: "d".to_string(),
            target_table: format!("{table}_dst"),
        }
    }

    #[test]
    fn lookup_finds_configured_rule() {
        let table = RuleTable::build(&[rule_config("s1", "t1")]).unwrap();
        let rule = table.lookup("s1", "t1").expect("rule present");
        assert_eq!(rule.dest_schema, "d");
        assert_eq!(rule.dest_table, "t1_dst");
        assert_eq!(rule.rule_type, "init");
    }

    #[test]
    fn lookup_misses_unconfigured_table() {
        let table = RuleTable::build(&[rule_config("s1", "t1")]).unwrap();
        assert!(table.lookup("s1", "other").is_none());
    }

    #[test]
    fn duplicate_source_key_is_a_config_error() {
        let err = RuleTable::build(&[rule_config("s1", "t1"), rule_config("s1", "t1")])
            .expect_err("duplicate must be rejected");
        assert!(matches!(err, CdcError::Config(_)));
    }
}
