//! StarRocks Stream Load sink (C7): bulk-applies one flush's worth of
//! buckets with a `PUT .../_stream_load` per destination table, NDJSON
//! body, the `__op` hidden column carrying the upsert/delete sign
//! (spec.md §4.6; grounded on `RisingwaveLabs-risingwave`'s
//! `doris_starrocks_connector`, specifically its `STARROCKS_DELETE_SIGN`
//! convention and `HeaderBuilder`).

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use cdc_core::error::CdcError;
use cdc_core::msg::{Action, Row};
use cdc_core::traits::{Bucket, SinkAdapter};
use reqwest::{redirect, Client};
use serde_json::Value as JsonValue;
use tracing::debug;

/// StarRocks' primary-key-model hidden column: `0` is upsert, `1` is
/// delete-by-key. See `STARROCKS_DELETE_SIGN` in the grounding example.
const STARROCKS_OP_COLUMN: &str = "__op";
const OP_UPSERT: i32 = 0;
const OP_DELETE: i32 = 1;

pub struct StarrocksSink {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl StarrocksSink {
    pub fn new(host: &str, http_port: u16, username: &str, password: &str) -> Self {
        let client = Client::builder()
            .redirect(redirect::Policy::limited(3))
            .build()
            .expect("reqwest client builds with default TLS backend");
        Self {
            client,
            base_url: format!("http://{host}:{http_port}"),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn auth_header(&self) -> String {
        format!(
            "Basic {}",
            general_purpose::STANDARD.encode(format!("{}:{}", self.username, self.password))
        )
    }

    async fn load_one(&self, bucket: &Bucket<'_>) -> Result<(), CdcError> {
        if bucket.rows.is_empty() {
            return Ok(());
        }
        let primary_key = bucket
            .schema
            .map(|s| s.primary_key.as_slice())
            .unwrap_or(&[]);
        let rows = coalesce(bucket, primary_key);
        if rows.is_empty() {
            return Ok(());
        }

        let mut body = Vec::with_capacity(rows.len() * 64);
        for row in &rows {
            serde_json::to_writer(&mut body, row).map_err(|e| CdcError::Sink {
                cursor: None,
                source: anyhow::anyhow!("encoding stream-load row: {e}"),
            })?;
            body.push(b'\n');
        }

        let url = format!(
            "{}/api/{}/{}/_stream_load",
            self.base_url, bucket.dest.schema, bucket.dest.name
        );
        debug!(url = %url, rows = rows.len(), "stream-loading batch to starrocks");

        let resp = self
            .client
            .put(&url)
            .header("Authorization", self.auth_header())
            .header("Expect", "100-continue")
            .header("format", "json")
            .header("strip_outer_array", "true")
            .header("hidden_columns", STARROCKS_OP_COLUMN)
            .body(body)
            .send()
            .await
            .map_err(|e| CdcError::Sink {
                cursor: None,
                source: anyhow::anyhow!("stream-load request to {url}: {e}"),
            })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(CdcError::Sink {
                cursor: None,
                source: anyhow::anyhow!("stream-load to {url} returned {status}: {text}"),
            });
        }
        let parsed: JsonValue = serde_json::from_str(&text).unwrap_or(JsonValue::Null);
        let status_field = parsed.get("Status").and_then(JsonValue::as_str);
        match status_field {
            Some("Success") | Some("Publish Timeout") | None => Ok(()),
            Some(other) => Err(CdcError::Sink {
                cursor: None,
                source: anyhow::anyhow!("stream-load to {url} reported status {other}: {text}"),
            }),
        }
    }
}

#[async_trait]
impl SinkAdapter for StarrocksSink {
    fn name(&self) -> &'static str {
        "starrocks"
    }

    async fn write(&self, buckets: &[Bucket<'_>]) -> Result<(), CdcError> {
        for bucket in buckets {
            self.load_one(bucket).await?;
        }
        Ok(())
    }
}

/// Merges multiple mutations to the same primary key within a bucket into
/// the last-writer-wins net effect, then stamps each surviving row with
/// the `__op` hidden column. Insert/update collapse to the same upsert
/// shape; a later delete for the same key wins over an earlier upsert and
/// vice versa, matching spec.md §4.6. Rows with no resolvable key (empty
/// `primary_key`) are never coalesced, since no two of them are known to
/// collide.
fn coalesce(bucket: &Bucket<'_>, primary_key: &[String]) -> Vec<Row> {
    if primary_key.is_empty() {
        return bucket.rows.iter().map(stamp_row).collect();
    }

    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, Row> = HashMap::new();
    for msg in bucket.rows {
        let key = key_for(msg_key_source(msg), primary_key);
        if !by_key.contains_key(&key) {
            order.push(key.clone());
        }
        by_key.insert(key, stamp_msg(msg));
    }
    order.into_iter().filter_map(|k| by_key.remove(&k)).collect()
}

fn msg_key_source(msg: &cdc_core::msg::Msg) -> &Row {
    &msg.data
}

fn key_for(row: &Row, primary_key: &[String]) -> String {
    primary_key
        .iter()
        .map(|col| row.get(col).map(|v| v.to_string()).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\u{1}")
}

fn stamp_msg(msg: &cdc_core::msg::Msg) -> Row {
    let mut row = msg.data.clone();
    let op = match msg.action {
        Action::Insert | Action::Update => OP_UPSERT,
        Action::Delete => OP_DELETE,
    };
    row.insert(STARROCKS_OP_COLUMN.to_string(), JsonValue::from(op));
    row
}

fn stamp_row(msg: &cdc_core::msg::Msg) -> Row {
    stamp_msg(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_core::msg::{Cursor, Msg, TableRef};
    use serde_json::json;

    fn cursor(n: u64) -> Cursor {
        Cursor::Binlog {
            gtid_set: format!("uuid:1-{n}"),
            epoch: n,
        }
    }

    #[test]
    fn coalesces_insert_then_update_to_the_latest_values() {
        let dest = TableRef::new("d", "t");
        let rows = vec![
            Msg::insert(
                dest.clone(),
                [("id".to_string(), json!(1)), ("name".to_string(), json!("a"))]
                    .into_iter()
                    .collect(),
                cursor(1),
            ),
            Msg::update(
                dest.clone(),
                Row::new(),
                [("id".to_string(), json!(1)), ("name".to_string(), json!("b"))]
                    .into_iter()
                    .collect(),
                cursor(2),
            ),
        ];
        let bucket = Bucket {
            dest: &dest,
            rows: &rows,
            schema: None,
        };
        let merged = coalesce(&bucket, &["id".to_string()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["name"], json!("b"));
        assert_eq!(merged[0][STARROCKS_OP_COLUMN], json!(OP_UPSERT));
    }

    #[test]
    fn a_later_delete_wins_over_an_earlier_upsert() {
        let dest = TableRef::new("d", "t");
        let rows = vec![
            Msg::insert(
                dest.clone(),
                [("id".to_string(), json!(7))].into_iter().collect(),
                cursor(1),
            ),
            Msg::delete(
                dest.clone(),
                [("id".to_string(), json!(7))].into_iter().collect(),
                cursor(2),
            ),
        ];
        let bucket = Bucket {
            dest: &dest,
            rows: &rows,
            schema: None,
        };
        let merged = coalesce(&bucket, &["id".to_string()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0][STARROCKS_OP_COLUMN], json!(OP_DELETE));
    }

    #[test]
    fn distinct_keys_are_preserved_independently() {
        let dest = TableRef::new("d", "t");
        let rows = vec![
            Msg::insert(
                dest.clone(),
                [("id".to_string(), json!(1))].into_iter().collect(),
                cursor(1),
            ),
            Msg::insert(
                dest.clone(),
                [("id".to_string(), json!(2))].into_iter().collect(),
                cursor(2),
            ),
        ];
        let bucket = Bucket {
            dest: &dest,
            rows: &rows,
            schema: None,
        };
        let merged = coalesce(&bucket, &["id".to_string()]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn without_a_primary_key_every_row_is_kept() {
        let dest = TableRef::new("d", "t");
        let rows = vec![
            Msg::insert(
                dest.clone(),
                [("id".to_string(), json!(1))].into_iter().collect(),
                cursor(1),
            ),
            Msg::insert(
                dest.clone(),
                [("id".to_string(), json!(1))].into_iter().collect(),
                cursor(2),
            ),
        ];
        let bucket = Bucket {
            dest: &dest,
            rows: &rows,
            schema: None,
        };
        let merged = coalesce(&bucket, &[]);
        assert_eq!(merged.len(), 2);
    }
}
