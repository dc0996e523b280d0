//! The fatal/non-fatal error taxonomy from spec.md §7.

use crate::msg::Cursor;

/// Errors the core pipeline can raise. Every variant that is fatal to a run
/// carries enough context (and, where known, the cursor in flight) for the
/// single structured log line spec.md requires before cancellation fires.
#[derive(Debug, thiserror::Error)]
pub enum CdcError {
    /// Missing `name`, missing `[sync-param]`, or an unparseable config file.
    /// Fatal at startup; the pipeline refuses to start.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection drop, read timeout. Recovered locally by the Source
    /// Driver, which reconnects from the last cursor it knows was fully
    /// forwarded; never propagated past the driver as a fatal error.
    #[error("upstream transient error: {0}")]
    UpstreamTransient(#[source] anyhow::Error),

    /// Authentication failure, unparseable event. Fatal; cancels the
    /// pipeline.
    #[error("upstream fatal error: {0}")]
    UpstreamFatal(#[source] anyhow::Error),

    /// A filter or decoder raised at runtime despite config-time validation.
    /// Should not happen; treated as fatal if it does.
    #[error("decode error at cursor {cursor:?}: {source}")]
    Decode {
        cursor: Option<Cursor>,
        #[source]
        source: anyhow::Error,
    },

    /// Any failure from the Sink Adapter. Fatal to this run; the cursor is
    /// not advanced.
    #[error("sink error flushing up to cursor {cursor:?}: {source}")]
    Sink {
        cursor: Option<Cursor>,
        #[source]
        source: anyhow::Error,
    },

    /// I/O error from `PositionStore::save`. Fatal; the previous on-disk
    /// cursor remains valid.
    #[error("position save error for cursor {cursor:?}: {source}")]
    PositionSave {
        cursor: Cursor,
        #[source]
        source: anyhow::Error,
    },
}

impl CdcError {
    /// The component/kind pair named in the single structured log line
    /// spec.md §7 requires for every fatal event.
    pub fn kind(&self) -> &'static str {
        match self {
            CdcError::Config(_) => "config",
            CdcError::UpstreamTransient(_) => "upstream-transient",
            CdcError::UpstreamFatal(_) => "upstream-fatal",
            CdcError::Decode { .. } => "decode",
            CdcError::Sink { .. } => "sink",
            CdcError::PositionSave { .. } => "position-save",
        }
    }

    /// Whether this error halts the pipeline. Only `UpstreamTransient` is
    /// recoverable in place by the Source Driver.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CdcError::UpstreamTransient(_))
    }
}
