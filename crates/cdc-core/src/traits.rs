//! The two pluggable seams of the pipeline: where rows come from, and where
//! batches go. `cdc-connectors` provides the concrete implementations;
//! `cdc-core` only depends on these trait objects, so the Batcher never
//! needs to know whether it's talking to MySQL/Mongo or to StarRocks.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::channel::Sender;
use crate::error::CdcError;
use crate::msg::{Cursor, Msg, TableRef};
use crate::rule::RuleTable;
use crate::schema::TableSchema;

/// Produces [`Msg`]s and periodic [`Cursor`] checkpoints onto the channel
/// until cancelled or it hits a fatal error. Implementors own reconnection
/// for transient errors internally; only `CdcError::UpstreamFatal` and
/// decode errors should ever escape `run`.
#[async_trait]
pub trait SourceDriver: Send {
    /// Human-readable name used in logs and metrics labels (`"mysql"`/`"mongo"`).
    fn name(&self) -> &'static str;

    /// Streams decoded, filtered, rule-routed messages onto `tx` starting
    /// just after `resume_from`, until `cancel` fires or an error occurs.
    async fn run(
        &mut self,
        tx: Sender,
        rules: &RuleTable,
        resume_from: Cursor,
        cancel: CancellationToken,
    ) -> Result<(), CdcError>;
}

/// One destination table's pending write, as accumulated by the Batcher.
/// `rows` is ordered; later entries for the same primary key win on flush
/// (last-writer-wins coalescing is the Sink Adapter's responsibility, since
/// only it knows the destination's primary key columns).
pub struct Bucket<'a> {
    pub dest: &'a TableRef,
    pub rows: &'a [Msg],
    /// The destination table's schema as of flush time, resolved from the
    /// Source Driver's schema cache. `None` if the cache has nothing for
    /// this table yet (the adapter then applies rows in arrival order with
    /// no primary-key coalescing).
    pub schema: Option<&'a TableSchema>,
}

/// Durably applies one destination table's pending rows to the external
/// store. Implementations should treat repeated delivery of the same
/// message as a no-op (upsert-by-key), since the pipeline is at-least-once.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Applies every bucket produced by one flush cycle. Implementations
    /// may batch multiple buckets into one network round trip internally;
    /// from the Batcher's point of view this is a single atomic unit: either
    /// every bucket lands, or the whole flush is retried/aborted.
    async fn write(&self, buckets: &[Bucket<'_>]) -> Result<(), CdcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exercises that `Bucket` borrows rather than clones; a compile-time
    /// check more than a runtime one.
    #[test]
    fn bucket_borrows_its_rows() {
        let dest = TableRef::new("d", "t");
        let rows: Vec<Msg> = Vec::new();
        let bucket = Bucket {
            dest: &dest,
            rows: &rows,
            schema: None,
        };
        assert_eq!(bucket.dest.name, "t");
        assert!(bucket.rows.is_empty());
    }
}
