//! Concrete pluggable-boundary implementations for the CDC pipeline: the
//! MySQL binlog and MongoDB change-stream `SourceDriver`s, the StarRocks
//! `SinkAdapter`, and the shared schema cache that bridges them.

pub mod schema_cache;
pub mod sink_starrocks;
pub mod source_mongo;
pub mod source_mysql;

pub use schema_cache::SharedSchemaCache;
pub use sink_starrocks::StarrocksSink;
pub use source_mongo::MongoSourceDriver;
pub use source_mysql::MysqlSourceDriver;
