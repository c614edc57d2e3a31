//! Seams to the outside world.  The engine only ever talks to these traits.

use async_trait::async_trait;
use dubline_proto::protocol::Line;

use crate::error::BackendError;

/// Transcript and translation RPCs.
///
/// Implementations are stateless; cancellation happens by dropping the
/// returned future.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Original lines overlapping `[t - window/2, t + window/2]`.
    async fn fetch_lines(
        &self,
        media_id: &str,
        t: f64,
        window: f64,
    ) -> Result<Vec<Line>, BackendError>;

    /// Same cardinality and order as `lines`, with `text` translated.
    async fn translate(
        &self,
        lines: Vec<Line>,
        target: &str,
        hint: &str,
    ) -> Result<Vec<Line>, BackendError>;
}

/// Finds the player the captions are drawn over.
#[async_trait]
pub trait PlayerProbe: Send + Sync {
    /// One attempt; `true` once the player is reachable.
    async fn probe(&self) -> bool;
}

/// Receives caption text.  An empty string blanks the caption.
///
/// Called from the engine task, so implementations must not block.
pub trait Renderer: Send + Sync {
    fn render(&self, text: &str);
}
