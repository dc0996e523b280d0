//! Ordered predicates/transforms applied to each decoded [`Msg`] before it
//! reaches the Channel. Filters never fail at runtime — an illegal
//! configuration is rejected at construction (see [`Filter::from_config`]).

use crate::config::FilterConfig;
use crate::error::CdcError;
use crate::msg::Msg;

/// Outcome of running one filter over one message.
pub enum FilterOutcome {
    Keep(Msg),
    Drop,
}

/// A single filter stage. `apply` takes ownership of the message so a
/// keep-modified filter can rewrite it without cloning.
pub trait Filter: Send + Sync {
    fn apply(&self, msg: Msg) -> FilterOutcome;
}

/// Removes one or more named columns from `data` and `old`. A no-op if the
/// message's table doesn't match `match_schema`/`match_table`.
pub struct DeleteDmlColumnFilter {
    match_schema: String,
    match_table: String,
    columns: Vec<String>,
}

impl DeleteDmlColumnFilter {
    pub fn new(
        match_schema: String,
        match_table: String,
        columns: Vec<String>,
    ) -> Result<Self, CdcError> {
        if columns.is_empty() {
            return Err(CdcError::Config(
                "delete-dml-column filter requires at least one column".to_string(),
            ));
        }
        Ok(Self {
            match_schema,
            match_table,
            columns,
        })
    }
}

impl Filter for DeleteDmlColumnFilter {
    fn apply(&self, mut msg: Msg) -> FilterOutcome {
        if msg.table_ref.schema != self.match_schema || msg.table_ref.name != self.match_table {
            return FilterOutcome::Keep(msg);
        }
        for col in &self.columns {
            msg.data.remove(col);
            msg.old.remove(col);
        }
        FilterOutcome::Keep(msg)
    }
}

/// Ordered list of filters; short-circuits on the first `Drop`.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn build(configs: &[FilterConfig]) -> Result<Self, CdcError> {
        let mut filters: Vec<Box<dyn Filter>> = Vec::with_capacity(configs.len());
        for c in configs {
            match c.filter_type.as_str() {
                "delete-dml-column" => {
                    let match_schema = c.config.get_str("match-schema")?;
                    let match_table = c.config.get_str("match-table")?;
                    let columns = c.config.get_str_list("columns")?;
                    filters.push(Box::new(DeleteDmlColumnFilter::new(
                        match_schema,
                        match_table,
                        columns,
                    )?));
                }
                other => {
                    return Err(CdcError::Config(format!("unrecognized filter type {other}")))
                }
            }
        }
        Ok(Self { filters })
    }

    /// Returns `None` if the message was dropped by some filter in the chain.
    pub fn apply(&self, mut msg: Msg) -> Option<Msg> {
        for filter in &self.filters {
            match filter.apply(msg) {
                FilterOutcome::Keep(next) => msg = next,
                FilterOutcome::Drop => return None,
            }
        }
        Some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterArgs;
    use crate::msg::{Cursor, TableRef};
    use serde_json::json;

    fn sample_msg() -> Msg {
        let cursor = Cursor::Binlog {
            gtid_set: "x".into(),
            epoch: 1,
        };
        Msg::update(
            TableRef::new("s1", "t1"),
            [("id".to_string(), json!(1)), ("secret".to_string(), json!("old"))]
                .into_iter()
                .collect(),
            [("id".to_string(), json!(1)), ("secret".to_string(), json!("new"))]
                .into_iter()
                .collect(),
            cursor,
        )
    }

    #[test]
    fn removes_configured_columns_from_both_data_and_old() {
        let f = DeleteDmlColumnFilter::new(
            "s1".into(),
            "t1".into(),
            vec!["secret".into()],
        )
        .unwrap();
        let out = f.apply(sample_msg());
        let FilterOutcome::Keep(msg) = out else {
            panic!("expected keep")
        };
        assert!(!msg.data.contains_key("secret"));
        assert!(!msg.old.contains_key("secret"));
        assert!(msg.data.contains_key("id"));
    }

    #[test]
    fn is_a_no_op_on_non_matching_table() {
        let f = DeleteDmlColumnFilter::new(
            "other".into(),
            "t1".into(),
            vec!["secret".into()],
        )
        .unwrap();
        let out = f.apply(sample_msg());
        let FilterOutcome::Keep(msg) = out else {
            panic!("expected keep")
        };
        assert!(msg.data.contains_key("secret"));
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let f = DeleteDmlColumnFilter::new(
            "s1".into(),
            "t1".into(),
            vec!["secret".into()],
        )
        .unwrap();
        let FilterOutcome::Keep(once) = f.apply(sample_msg()) else {
            panic!()
        };
        let FilterOutcome::Keep(twice) = f.apply(once.clone()) else {
            panic!()
        };
        assert_eq!(once.data, twice.data);
        assert_eq!(once.old, twice.old);
    }

    #[test]
    fn construction_rejects_empty_column_list() {
        let err = DeleteDmlColumnFilter::new("s1".into(), "t1".into(), vec![])
            .expect_err("empty columns must be rejected");
        assert!(matches!(err, CdcError::Config(_)));
    }

    #[test]
    fn unrecognized_filter_type_is_a_config_error() {
        let configs = vec![FilterConfig {
            filter_type: "made-up".to_string(),
            config: FilterArgs::default(),
        }];
        let err = FilterChain::build(&configs).expect_err("must reject unknown filter type");
        assert!(matches!(err, CdcError::Config(_)));
    }
}
