//! Error taxonomy for the ingest pipeline.
//!
//! Every variant knows whether it is terminal for the feed that raised it.
//! Terminal errors halt that feed's loop; everything else skips the current
//! cycle and leaves the checkpoint where it was.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication rejected by upstream (HTTP {status})")]
    Authentication { status: u16 },

    #[error("transient fetch failure after {attempts} attempt(s): {reason}")]
    TransientFetch { attempts: u32, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("event sink error: {0}")]
    Sink(String),
}

impl IngestError {
    /// Terminal errors stop the feed; the operator has to intervene.
    pub fn is_terminal(&self) -> bool {
        match self {
            IngestError::Configuration(_) | IngestError::Authentication { .. } => true,
            IngestError::Checkpoint(e) => e.is_terminal(),
            IngestError::TransientFetch { .. } | IngestError::Protocol(_) | IngestError::Sink(_) => {
                false
            }
        }
    }

    /// Short label used for metrics and the status API.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Configuration(_) => "configuration",
            IngestError::Authentication { .. } => "authentication",
            IngestError::TransientFetch { .. } => "transient_fetch",
            IngestError::Protocol(_) => "protocol",
            IngestError::Checkpoint(_) => "checkpoint",
            IngestError::Sink(_) => "sink",
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt checkpoint {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

impl CheckpointError {
    /// A corrupt file needs a human; a failed write may succeed next cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckpointError::Corrupt { .. })
    }
}
