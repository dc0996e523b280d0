//! Data model, batching engine, and pluggable traits for a change-data-capture
//! replication pipeline: decoded row mutations flow from a [`traits::SourceDriver`]
//! through a bounded [`channel`], are buffered per destination table by the
//! [`batcher::Batcher`], and flushed to a [`traits::SinkAdapter`] on a size-or-time
//! trigger, with the in-flight cursor checkpointed to a [`position::PositionStore`]
//! after every successful flush.

pub mod batcher;
pub mod channel;
pub mod config;
pub mod error;
pub mod filter;
pub mod logger;
pub mod msg;
pub mod position;
pub mod rule;
pub mod schema;
pub mod traits;

pub use batcher::{Batcher, BATCH_LIMIT};
pub use channel::{bounded, ChannelItem, Receiver, Sender};
pub use config::{
    FilterArgs, FilterConfig, MongoConfig, MysqlConfig, PipelineConfig, RuleConfig,
    StarrocksConfig, SyncParamConfig,
};
pub use error::CdcError;
pub use filter::{DeleteDmlColumnFilter, Filter, FilterChain, FilterOutcome};
pub use logger::LoggerHandle;
pub use msg::{Action, Cursor, Msg, Row, SourceKind, TableRef};
pub use position::PositionStore;
pub use rule::{Rule, RuleTable};
pub use schema::{SchemaLookup, TableSchema};
pub use traits::{Bucket, SinkAdapter, SourceDriver};
