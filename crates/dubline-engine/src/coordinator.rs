//! At most one fetch-then-translate task at a time.
//!
//! Each start bumps the generation and cancels the previous task.  The task
//! reports back through the engine channel; [`RequestCoordinator::settle`]
//! only hands out a result whose generation is still current, so the order in
//! which superseded tasks complete never matters.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use dubline_proto::protocol::{InFlightInfo, Line, Stage};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::cache::bucket_of;
use crate::core::EngineEvent;
use crate::error::{BackendError, HydrationError};

#[derive(Debug, Clone, PartialEq)]
pub struct HydrationRequest {
    pub media_id: String,
    pub language: String,
    pub hint: String,
    pub t: f64,
}

/// Result of one generation, as delivered back to the engine.
#[derive(Debug)]
pub struct HydrationOutcome {
    pub generation: u64,
    pub result: Result<Vec<Line>, HydrationError>,
}

/// Window geometry around the playback position.
///
/// A window is stored under the whole buckets `floor(t) - back` up to
/// `floor(t) + forward`.  The fetched range starts at the lowest stored bucket
/// and reaches `lookahead` past the end of the highest one, so every stored
/// bucket sees both the line under the position and the upcoming one.
#[derive(Debug, Clone, Copy)]
pub struct WindowSpan {
    pub back: u32,
    pub forward: u32,
    pub lookahead: f64,
}

impl WindowSpan {
    /// Playback range `[lo, hi]` fetched for a request at `t`.
    pub fn range(&self, t: f64) -> (f64, f64) {
        let b = bucket_of(t) as f64;
        (
            b - f64::from(self.back),
            b + f64::from(self.forward.max(1)) + self.lookahead.max(0.0),
        )
    }

    pub fn total(&self) -> f64 {
        f64::from(self.back + self.forward.max(1)) + self.lookahead.max(0.0)
    }

    /// Centre for a symmetric `FetchLines` call covering [`WindowSpan::range`].
    pub fn centre(&self, t: f64) -> f64 {
        let (lo, hi) = self.range(t);
        (lo + hi) / 2.0
    }

    /// Buckets a window fetched at `t` is stored under.
    pub fn buckets(&self, t: f64) -> Range<i64> {
        let b = bucket_of(t);
        (b - i64::from(self.back))..(b + i64::from(self.forward.max(1)))
    }
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
    request: HydrationRequest,
    stage: watch::Receiver<Stage>,
}

pub struct RequestCoordinator {
    span: WindowSpan,
    timeout: Duration,
    generation: u64,
    in_flight: Option<InFlight>,
}

impl RequestCoordinator {
    pub fn new(span: WindowSpan, timeout: Duration) -> Self {
        Self {
            span,
            timeout,
            generation: 0,
            in_flight: None,
        }
    }

    pub fn span(&self) -> WindowSpan {
        self.span
    }

    pub fn info(&self) -> Option<InFlightInfo> {
        self.in_flight.as_ref().map(|f| InFlightInfo {
            generation: f.generation,
            stage: *f.stage.borrow(),
        })
    }

    /// True when the running request will produce a window that includes `t`
    /// for the same media, language and hint.
    pub fn covers(&self, media_id: &str, language: &str, hint: &str, t: f64) -> bool {
        self.in_flight.as_ref().is_some_and(|f| {
            f.request.media_id == media_id
                && f.request.language == language
                && f.request.hint == hint
                && self.span.buckets(f.request.t).contains(&bucket_of(t))
        })
    }

    /// Cancel the running request, if any.  Its result will be discarded.
    pub fn cancel(&mut self) {
        if let Some(prev) = self.in_flight.take() {
            debug!("coordinator: canceling generation {}", prev.generation);
            prev.token.cancel();
        }
    }

    /// Supersede whatever is running and start a new two-stage request.
    pub fn start(
        &mut self,
        request: HydrationRequest,
        backend: Arc<dyn Backend>,
        event_tx: mpsc::Sender<EngineEvent>,
    ) -> u64 {
        self.cancel();

        self.generation += 1;
        let generation = self.generation;
        let token = CancellationToken::new();
        let (stage_tx, stage_rx) = watch::channel(Stage::FetchingLines);

        debug!(
            "coordinator: generation {} for {} [{}] at {:.2}s",
            generation, request.media_id, request.language, request.t
        );

        let task_token = token.clone();
        let task_request = request.clone();
        let span = self.span;
        let timeout = self.timeout;
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = task_token.cancelled() => Err(HydrationError::Canceled),
                res = tokio::time::timeout(
                    timeout,
                    run_stages(backend.as_ref(), &task_request, span, &stage_tx),
                ) => res.unwrap_or(Err(HydrationError::TimedOut(timeout))),
            };

            if task_token.is_cancelled() {
                debug!("coordinator: generation {} canceled", generation);
                return;
            }
            let _ = event_tx
                .send(EngineEvent::Hydrated(HydrationOutcome { generation, result }))
                .await;
        });

        self.in_flight = Some(InFlight {
            generation,
            token,
            request,
            stage: stage_rx,
        });
        generation
    }

    /// Claim the outcome of `generation`.  Returns the request it belonged to
    /// only if it is still the live one; stale generations yield `None`.
    pub fn settle(&mut self, generation: u64) -> Option<HydrationRequest> {
        match &self.in_flight {
            Some(f) if f.generation == generation => self.in_flight.take().map(|f| f.request),
            _ => {
                debug!(
                    "coordinator: discarding generation {} (current {})",
                    generation, self.generation
                );
                None
            }
        }
    }
}

async fn run_stages(
    backend: &dyn Backend,
    request: &HydrationRequest,
    span: WindowSpan,
    stage: &watch::Sender<Stage>,
) -> Result<Vec<Line>, HydrationError> {
    let original = backend
        .fetch_lines(&request.media_id, span.centre(request.t), span.total())
        .await
        .map_err(HydrationError::FetchFailed)?;

    if original.is_empty() {
        return Ok(original);
    }

    let _ = stage.send(Stage::Translating);
    let expected = original.len();
    let translated = backend
        .translate(original, &request.language, &request.hint)
        .await
        .map_err(HydrationError::TranslateFailed)?;

    if translated.len() != expected {
        warn!(
            "coordinator: translate returned {} lines for {}",
            translated.len(),
            expected
        );
        return Err(HydrationError::TranslateFailed(BackendError::Malformed(
            format!("expected {} lines, got {}", expected, translated.len()),
        )));
    }
    Ok(translated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowBackend {
        delay: Duration,
        fetches: AtomicUsize,
        drop_one: bool,
    }

    #[async_trait]
    impl Backend for SlowBackend {
        async fn fetch_lines(
            &self,
            _media_id: &str,
            t: f64,
            window: f64,
        ) -> Result<Vec<Line>, BackendError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(vec![
                Line::new(t - window / 2.0, t, "one"),
                Line::new(t, t + window / 2.0, "two"),
            ])
        }

        async fn translate(
            &self,
            mut lines: Vec<Line>,
            target: &str,
            _hint: &str,
        ) -> Result<Vec<Line>, BackendError> {
            if self.drop_one {
                lines.pop();
            }
            for l in &mut lines {
                l.text = format!("{}:{}", target, l.text);
            }
            Ok(lines)
        }
    }

    fn backend(delay_ms: u64, drop_one: bool) -> Arc<SlowBackend> {
        Arc::new(SlowBackend {
            delay: Duration::from_millis(delay_ms),
            fetches: AtomicUsize::new(0),
            drop_one,
        })
    }

    fn request(t: f64) -> HydrationRequest {
        HydrationRequest {
            media_id: "vid1".to_string(),
            language: "fr".to_string(),
            hint: String::new(),
            t,
        }
    }

    fn span() -> WindowSpan {
        WindowSpan {
            back: 2,
            forward: 4,
            lookahead: 2.0,
        }
    }

    #[test]
    fn test_span_geometry() {
        let s = span();
        assert_eq!(s.total(), 8.0);
        assert_eq!(s.range(10.4), (8.0, 16.0));
        assert_eq!(s.centre(10.4), 12.0);
        assert_eq!(s.buckets(10.4), 8..14);
    }

    #[test]
    fn test_range_covers_every_stored_bucket() {
        let s = span();
        for t in [10.0, 10.4, 10.9, 10.999] {
            let (lo, hi) = s.range(t);
            assert_eq!(hi - lo, s.total());
            for b in s.buckets(t) {
                let b = b as f64;
                assert!(b >= lo, "bucket {} starts before {} (t={})", b, lo, t);
                assert!(b + 1.0 + s.lookahead <= hi, "bucket {} lookahead past {}", b, hi);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_translated_window() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut coord = RequestCoordinator::new(span(), Duration::from_secs(10));
        let gen = coord.start(request(10.0), backend(100, false), tx);

        let Some(EngineEvent::Hydrated(outcome)) = rx.recv().await else {
            panic!("expected hydration outcome");
        };
        assert_eq!(outcome.generation, gen);
        let lines = outcome.result.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "fr:one");
        assert_eq!(coord.settle(gen), Some(request(10.0)));
        assert!(coord.info().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_start_cancels_previous() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut coord = RequestCoordinator::new(span(), Duration::from_secs(10));
        let b = backend(100, false);
        let first = coord.start(request(10.0), b.clone(), tx.clone());
        let second = coord.start(request(30.0), b.clone(), tx);
        assert!(second > first);
        assert_eq!(coord.info().map(|i| i.generation), Some(second));

        let Some(EngineEvent::Hydrated(outcome)) = rx.recv().await else {
            panic!("expected hydration outcome");
        };
        // The canceled task never reports.
        assert_eq!(outcome.generation, second);
        assert!(coord.settle(first).is_none());
        assert!(coord.settle(second).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_discarded() {
        let (tx, _rx) = mpsc::channel(8);
        let mut coord = RequestCoordinator::new(span(), Duration::from_secs(10));
        let gen = coord.start(request(10.0), backend(100, false), tx);
        assert!(coord.settle(gen + 1).is_none());
        coord.cancel();
        assert!(coord.settle(gen).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut coord = RequestCoordinator::new(span(), Duration::from_millis(500));
        coord.start(request(10.0), backend(5_000, false), tx);

        let Some(EngineEvent::Hydrated(outcome)) = rx.recv().await else {
            panic!("expected hydration outcome");
        };
        assert_eq!(
            outcome.result.unwrap_err(),
            HydrationError::TimedOut(Duration::from_millis(500))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cardinality_mismatch_fails_translate() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut coord = RequestCoordinator::new(span(), Duration::from_secs(10));
        coord.start(request(10.0), backend(10, true), tx);

        let Some(EngineEvent::Hydrated(outcome)) = rx.recv().await else {
            panic!("expected hydration outcome");
        };
        assert!(matches!(
            outcome.result,
            Err(HydrationError::TranslateFailed(BackendError::Malformed(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_covers_in_flight_span() {
        let (tx, _rx) = mpsc::channel(8);
        let mut coord = RequestCoordinator::new(span(), Duration::from_secs(10));
        coord.start(request(10.0), backend(1_000, false), tx);

        assert!(coord.covers("vid1", "fr", "", 10.9));
        assert!(coord.covers("vid1", "fr", "", 13.5));
        assert!(coord.covers("vid1", "fr", "", 8.0));
        assert!(!coord.covers("vid1", "fr", "", 14.0));
        assert!(!coord.covers("vid1", "de", "", 10.0));
        assert!(!coord.covers("vid2", "fr", "", 10.0));
        assert!(!coord.covers("vid1", "fr", "anime", 10.0));
    }
}
