//! T2: the single-threaded consumer that buffers decoded messages into
//! per-destination-table buckets and flushes them to the Sink Adapter on
//! whichever of two triggers fires first — a hard size limit or a flush
//! timer (spec.md §4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelItem, Receiver};
use crate::error::CdcError;
use crate::msg::{Cursor, Msg};
use crate::position::PositionStore;
use crate::schema::SchemaLookup;
use crate::traits::{Bucket, SinkAdapter};

/// Hard cap on buffered messages regardless of the flush timer; exceeding it
/// forces an immediate flush so memory stays bounded under a burst.
pub const BATCH_LIMIT: usize = 10_240;

/// Owns everything mutated between flushes: the per-table buckets, the
/// count used against `BATCH_LIMIT`, and the two cursor bookmarks the
/// spec's checkpointing protocol depends on.
pub struct Batcher {
    sink: Box<dyn SinkAdapter>,
    position: PositionStore,
    schema_lookup: Arc<dyn SchemaLookup>,
    flush_delay: Duration,
    buckets: HashMap<String, (crate::msg::TableRef, Vec<Msg>)>,
    pending_count: usize,
    /// Cursor of the most recent `ChannelItem::Cursor` marker taken off the
    /// channel. Never derived from a buffered `Msg`'s own cursor, since a
    /// Source Driver may emit messages carrying a placeholder cursor ahead
    /// of the marker that actually covers them (spec.md §4.5).
    last_seen_cursor: Option<Cursor>,
    /// Cursor as of the last successful flush; this is what's on disk.
    last_acked_cursor: Option<Cursor>,
    last_checkpoint_at: Instant,
}

impl Batcher {
    pub fn new(
        sink: Box<dyn SinkAdapter>,
        position: PositionStore,
        schema_lookup: Arc<dyn SchemaLookup>,
        flush_delay: Duration,
    ) -> Self {
        Self {
            sink,
            position,
            schema_lookup,
            flush_delay,
            buckets: HashMap::new(),
            pending_count: 0,
            last_seen_cursor: None,
            last_acked_cursor: None,
            last_checkpoint_at: Instant::now(),
        }
    }

    /// Runs until the channel closes or `cancel` fires, flushing on the way
    /// out either way so no acknowledged-but-unflushed data is lost.
    pub async fn run(&mut self, mut rx: Receiver, cancel: CancellationToken) -> Result<(), CdcError> {
        let mut timer = tokio::time::interval(self.flush_delay);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.reset();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("batcher received cancellation, flushing remaining buckets");
                    self.flush().await?;
                    return Ok(());
                }

                item = rx.recv() => {
                    match item {
                        Some(item) => {
                            self.ingest(item);
                            if self.pending_count >= BATCH_LIMIT {
                                debug!(pending = self.pending_count, "batch limit reached, flushing early");
                                self.flush().await?;
                                timer.reset();
                            }
                        }
                        None => {
                            info!("producer channel closed, flushing remaining buckets");
                            self.flush().await?;
                            return Ok(());
                        }
                    }
                }

                _ = timer.tick() => {
                    if self.pending_count > 0 {
                        self.flush().await?;
                    } else if let Some(cursor) = self.last_seen_cursor.clone() {
                        // No rows buffered, but the source has advanced (e.g. a
                        // heartbeat-only binlog window); persist the checkpoint
                        // anyway so a restart doesn't replay an idle stretch.
                        if self.last_acked_cursor.as_ref() != Some(&cursor) {
                            self.checkpoint(cursor)?;
                        }
                    }
                }
            }
        }
    }

    fn ingest(&mut self, item: ChannelItem) {
        match item {
            ChannelItem::Message(msg) => {
                let key = msg.table_ref.key();
                let entry = self
                    .buckets
                    .entry(key)
                    .or_insert_with(|| (msg.table_ref.clone(), Vec::new()));
                entry.1.push(msg);
                self.pending_count += 1;
                counter!("cdc_messages_produced_total").increment(1);
                gauge!("cdc_pending_messages").set(self.pending_count as f64);
            }
            ChannelItem::Cursor(cursor) => {
                self.last_seen_cursor = Some(cursor);
            }
        }
    }

    /// Applies every non-empty bucket in one call to the sink, then advances
    /// the durable checkpoint to `last_seen_cursor`. The sink call covers all
    /// tables so a partial per-table failure still halts the whole flush
    /// rather than silently advancing past lost rows.
    async fn flush(&mut self) -> Result<(), CdcError> {
        gauge!("cdc_seconds_since_checkpoint")
            .set(self.last_checkpoint_at.elapsed().as_secs_f64());

        if self.buckets.is_empty() {
            if let Some(cursor) = self.last_seen_cursor.clone() {
                if self.last_acked_cursor.as_ref() != Some(&cursor) {
                    self.checkpoint(cursor)?;
                }
            }
            return Ok(());
        }

        let owned: Vec<(crate::msg::TableRef, Vec<Msg>)> = self.buckets.drain().map(|(_, v)| v).collect();
        let flushed: usize = owned.iter().map(|(_, rows)| rows.len()).sum();
        let schemas: Vec<Option<crate::schema::TableSchema>> = owned
            .iter()
            .map(|(dest, _)| self.schema_lookup.lookup(dest))
            .collect();
        let buckets: Vec<Bucket<'_>> = owned
            .iter()
            .zip(schemas.iter())
            .map(|((dest, rows), schema)| Bucket {
                dest,
                rows,
                schema: schema.as_ref(),
            })
            .collect();

        self.sink.write(&buckets).await.map_err(|e| {
            warn!(error = %e, "sink write failed, halting pipeline without advancing checkpoint");
            e
        })?;

        counter!("cdc_messages_flushed_total").increment(flushed as u64);
        self.pending_count = 0;
        gauge!("cdc_pending_messages").set(0.0);
        if let Some(cursor) = self.last_seen_cursor.clone() {
            self.checkpoint(cursor)?;
        }
        Ok(())
    }

    fn checkpoint(&mut self, cursor: Cursor) -> Result<(), CdcError> {
        self.position.save(cursor.clone())?;
        self.last_acked_cursor = Some(cursor);
        self.last_checkpoint_at = Instant::now();
        gauge!("cdc_seconds_since_checkpoint").set(0.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::TableRef;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingSink {
        writes: Arc<AtomicUsize>,
        rows_seen: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl SinkAdapter for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }
        async fn write(&self, buckets: &[Bucket<'_>]) -> Result<(), CdcError> {
            if self.fail {
                return Err(CdcError::Sink {
                    cursor: None,
                    source: anyhow::anyhow!("boom"),
                });
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            let total: usize = buckets.iter().map(|b| b.rows.len()).sum();
            self.rows_seen.fetch_add(total, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NoSchema;
    impl crate::schema::SchemaLookup for NoSchema {
        fn lookup(&self, _dest: &crate::msg::TableRef) -> Option<crate::schema::TableSchema> {
            None
        }
    }

    fn temp_position(tag: &str) -> PositionStore {
        let path = std::env::temp_dir().join(format!("cdc-core-batcher-{tag}-{}.info", std::process::id()));
        let _ = std::fs::remove_file(&path);
        PositionStore::load(path, crate::msg::SourceKind::Binlog, || {
            Ok(Cursor::Binlog {
                gtid_set: "".into(),
                epoch: 0,
            })
        })
        .unwrap()
    }

    fn msg(n: u64) -> Msg {
        Msg::insert(
            TableRef::new("d", "t"),
            [("id".to_string(), json!(n))].into_iter().collect(),
            Cursor::Binlog {
                gtid_set: format!("uuid:1-{n}"),
                epoch: n,
            },
        )
    }

    #[tokio::test]
    async fn flushes_on_hard_batch_limit() {
        let writes = Arc::new(AtomicUsize::new(0));
        let rows_seen = Arc::new(AtomicUsize::new(0));
        let sink = Box::new(RecordingSink {
            writes: writes.clone(),
            rows_seen: rows_seen.clone(),
            fail: false,
        });
        let mut batcher = Batcher::new(sink, temp_position("limit"), Arc::new(NoSchema), Duration::from_secs(3600));

        let (tx, rx) = mpsc::channel(BATCH_LIMIT + 10);
        for i in 0..BATCH_LIMIT {
            tx.send(ChannelItem::Message(msg(i as u64))).await.unwrap();
        }
        drop(tx);

        let cancel = CancellationToken::new();
        batcher.run(rx, cancel).await.unwrap();

        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(rows_seen.load(Ordering::SeqCst), BATCH_LIMIT);
    }

    #[tokio::test]
    async fn flushes_remaining_buckets_on_cancellation() {
        let writes = Arc::new(AtomicUsize::new(0));
        let rows_seen = Arc::new(AtomicUsize::new(0));
        let sink = Box::new(RecordingSink {
            writes: writes.clone(),
            rows_seen: rows_seen.clone(),
            fail: false,
        });
        let mut batcher = Batcher::new(sink, temp_position("cancel"), Arc::new(NoSchema), Duration::from_secs(3600));

        let (tx, rx) = mpsc::channel(10);
        tx.send(ChannelItem::Message(msg(1))).await.unwrap();
        tx.send(ChannelItem::Message(msg(2))).await.unwrap();

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move { batcher.run(rx, cancel_clone).await });

        tokio::task::yield_now().await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(rows_seen.load(Ordering::SeqCst), 2);
        drop(tx);
    }

    #[tokio::test]
    async fn does_not_advance_checkpoint_on_sink_failure() {
        let writes = Arc::new(AtomicUsize::new(0));
        let rows_seen = Arc::new(AtomicUsize::new(0));
        let sink = Box::new(RecordingSink {
            writes: writes.clone(),
            rows_seen: rows_seen.clone(),
            fail: true,
        });
        let mut batcher = Batcher::new(sink, temp_position("fail"), Arc::new(NoSchema), Duration::from_secs(3600));

        let (tx, rx) = mpsc::channel(10);
        tx.send(ChannelItem::Message(msg(1))).await.unwrap();
        drop(tx);

        let cancel = CancellationToken::new();
        let err = batcher.run(rx, cancel).await.expect_err("sink failure must propagate");
        assert!(matches!(err, CdcError::Sink { .. }));
        assert_eq!(batcher.last_acked_cursor, None);
    }
}
