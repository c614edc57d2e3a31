use std::time::Duration;

use thiserror::Error;

/// Failure reported by a backend RPC.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("backend returned status {0}")]
    Status(u16),

    #[error("failed to decode backend response: {0}")]
    Decode(String),

    #[error("malformed backend response: {0}")]
    Malformed(String),
}

/// Outcome of a fetch-then-translate round trip that did not produce lines.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HydrationError {
    #[error("fetching lines failed: {0}")]
    FetchFailed(#[source] BackendError),

    #[error("translating lines failed: {0}")]
    TranslateFailed(#[source] BackendError),

    #[error("hydration timed out after {0:?}")]
    TimedOut(Duration),

    /// Superseded by a newer request or a context change.  Never surfaced.
    #[error("hydration canceled")]
    Canceled,
}

impl HydrationError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, HydrationError::Canceled)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("player not found after {attempts} attempts")]
    AttachFailed { attempts: u32 },

    #[error("engine event channel closed")]
    ChannelClosed,
}
