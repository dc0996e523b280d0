//! Change-stream tailing source driver (T1 half) backed by the official
//! `mongodb` async driver. Mirrors the shape of `source_mysql`'s decoder
//! but maps Mongo's `{insert, update, replace, delete}` operation types
//! onto the same three-action [`cdc_core::Action`] the sink understands
//! (`replace` is treated as an update with no pre-image, matching the
//! driver prototype's `ChangeStreamDocument::full_document` semantics).

use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document};
use cdc_core::channel::{ChannelItem, Sender};
use cdc_core::error::CdcError;
use cdc_core::filter::FilterChain;
use cdc_core::logger::LoggerHandle;
use cdc_core::msg::{Cursor, Msg, Row, TableRef};
use cdc_core::rule::RuleTable;
use cdc_core::schema::TableSchema;
use cdc_core::traits::SourceDriver;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::Client;
use serde_json::Value as JsonValue;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::schema_cache::SharedSchemaCache;

/// Delay before re-opening a change stream after a transient read error, so
/// a flapping connection doesn't spin the reconnect loop hot.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub struct MongoSourceDriver {
    client: Client,
    filters: FilterChain,
    logger: LoggerHandle,
}

impl MongoSourceDriver {
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        filters: FilterChain,
    ) -> Result<Self, CdcError> {
        let uri = format!("mongodb://{username}:{password}@{host}:{port}/?authSource=admin");
        let client = Client::with_uri_str(&uri)
            .await
            .map_err(|e| CdcError::UpstreamFatal(anyhow::anyhow!("connecting to mongo: {e}")))?;
        Ok(Self {
            client,
            filters,
            logger: LoggerHandle::new("source-mongo"),
        })
    }

    /// A resume token representing "now", used to bootstrap a fresh
    /// position file on first run.
    pub async fn current_resume_token(&self) -> Result<Cursor, CdcError> {
        let options = ChangeStreamOptions::builder().build();
        let stream = self
            .client
            .watch()
            .with_options(options)
            .await
            .map_err(|e| CdcError::UpstreamFatal(anyhow::anyhow!("opening bootstrap change stream: {e}")))?;
        let token = stream
            .resume_token()
            .map(|t| bson::to_vec(&t).unwrap_or_default())
            .unwrap_or_default();
        Ok(Cursor::Stream {
            resume_token: token,
            epoch: 0,
        })
    }

    /// Mongo collections are always keyed by `_id`; seed the shared schema
    /// cache with that for every configured destination table so the
    /// Batcher has the same read-only seam MySQL gets from its
    /// `INFORMATION_SCHEMA` lookup.
    pub fn populate_schema_cache(&self, rules: &RuleTable, cache: &SharedSchemaCache) {
        for source in rules.source_tables() {
            let Some(rule) = rules.lookup(&source.schema, &source.name) else {
                continue;
            };
            cache.set(&rule.dest_ref(), TableSchema::new(vec!["_id".to_string()]));
        }
    }
}

#[async_trait]
impl SourceDriver for MongoSourceDriver {
    fn name(&self) -> &'static str {
        "mongo"
    }

    async fn run(
        &mut self,
        tx: Sender,
        rules: &RuleTable,
        resume_from: Cursor,
        cancel: CancellationToken,
    ) -> Result<(), CdcError> {
        let Cursor::Stream { resume_token, mut epoch } = resume_from else {
            return Err(self.logger.fatal(CdcError::Config(
                "mongo source driver requires a Stream cursor".to_string(),
            )));
        };

        // Most recently acknowledged resume token; every (re)connection
        // resumes from here.
        let mut resume_token = resume_token;

        'reconnect: loop {
            let mut options_builder = ChangeStreamOptions::builder()
                .full_document(Some(FullDocumentType::UpdateLookup));
            if !resume_token.is_empty() {
                if let Ok(token) = bson::from_slice::<Document>(&resume_token) {
                    options_builder = options_builder.resume_after(Some(token));
                }
            }

            let mut stream = self
                .client
                .watch()
                .with_options(options_builder.build())
                .await
                .map_err(|e| self.logger.fatal(CdcError::UpstreamFatal(anyhow::anyhow!(e))))?;

            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!("mongo source driver cancelled");
                        return Ok(());
                    }
                    next = stream.next() => next,
                };

                let Some(event) = event else {
                    info!("mongo change stream ended");
                    return Ok(());
                };

                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        let err = CdcError::UpstreamTransient(anyhow::anyhow!(e));
                        warn!(
                            component = "source-mongo",
                            kind = err.kind(),
                            "change stream read error, reconnecting from last resume token: {err}"
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                info!("mongo source driver cancelled during reconnect backoff");
                                return Ok(());
                            }
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                        continue 'reconnect;
                    }
                };

                match decode_event(event, rules) {
                    Some((dest, msg)) => {
                        let routed = Msg {
                            table_ref: dest,
                            ..msg
                        };
                        let Some(filtered) = self.filters.apply(routed) else {
                            continue;
                        };
                        if tx.send(ChannelItem::Message(filtered)).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => {}
                }

                if let Some(token) = stream.resume_token() {
                    epoch += 1;
                    let bytes = bson::to_vec(&token).unwrap_or_default();
                    resume_token = bytes.clone();
                    if tx
                        .send(ChannelItem::Cursor(Cursor::Stream {
                            resume_token: bytes,
                            epoch,
                        }))
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn decode_event(event: ChangeStreamEvent<Document>, rules: &RuleTable) -> Option<(TableRef, Msg)> {
    let ns = event.ns?;
    let rule = rules.lookup(&ns.db, ns.coll.as_deref().unwrap_or(""))?;
    let placeholder_cursor = Cursor::Stream {
        resume_token: Vec::new(),
        epoch: 0,
    };

    let msg = match event.operation_type {
        OperationType::Insert => {
            let doc = event.full_document?;
            Msg::insert(rule.source_ref(), doc_to_row(doc), placeholder_cursor)
        }
        OperationType::Update | OperationType::Replace => {
            let doc = event.full_document?;
            Msg::update(rule.source_ref(), Row::new(), doc_to_row(doc), placeholder_cursor)
        }
        OperationType::Delete => {
            let key = event.document_key?;
            Msg::delete(rule.source_ref(), doc_to_row(key), placeholder_cursor)
        }
        other => {
            warn!(?other, "ignoring unsupported mongo change-stream operation type");
            return None;
        }
    };
    Some((rule.dest_ref(), msg))
}

fn doc_to_row(doc: Document) -> Row {
    let mut row = Row::new();
    for (key, value) in doc {
        row.insert(key, bson_to_json(&value));
    }
    row
}

fn bson_to_json(value: &Bson) -> JsonValue {
    match value {
        Bson::Null => JsonValue::Null,
        Bson::Boolean(b) => JsonValue::Bool(*b),
        Bson::Int32(i) => JsonValue::from(*i),
        Bson::Int64(i) => JsonValue::from(*i),
        Bson::Double(d) => serde_json::Number::from_f64(*d)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Bson::String(s) => JsonValue::String(s.clone()),
        Bson::ObjectId(id) => JsonValue::String(id.to_hex()),
        Bson::DateTime(dt) => JsonValue::String(dt.try_to_rfc3339_string().unwrap_or_default()),
        other => JsonValue::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_core::config::RuleConfig;

    fn rules() -> RuleTable {
        RuleTable::build(&[RuleConfig {
            source_schema: "app".to_string(),
            source_table: "users".to_string(),
            target_schema: "d".to_string(),
            target_table: "users".to_string(),
        }])
        .unwrap()
    }

    #[test]
    fn doc_to_row_preserves_scalar_fields() {
        let mut doc = Document::new();
        doc.insert("id", Bson::Int32(7));
        doc.insert("name", Bson::String("ada".to_string()));
        let row = doc_to_row(doc);
        assert_eq!(row.get("id"), Some(&JsonValue::from(7)));
        assert_eq!(row.get("name"), Some(&JsonValue::String("ada".to_string())));
    }

    #[test]
    fn unconfigured_namespace_has_no_rule() {
        let table = rules();
        assert!(table.lookup("app", "orders").is_none());
        assert!(table.lookup("app", "users").is_some());
    }
}
