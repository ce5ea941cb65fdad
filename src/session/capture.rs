//! Capture pipeline: microphone acquisition, frame accumulation and the
//! stop policy that turns frames into `last_buffer`.
//!
//! Starting a capture is split in two so a host can keep press/release
//! ordering intact:
//!
//! 1. [`request_capture`](AudioSessionManager::request_capture) runs under
//!    the lock, validates preconditions and registers a pending request id.
//! 2. [`complete_capture`](AudioSessionManager::complete_capture) awaits the
//!    microphone and applies the grant only if that request is still pending.
//!
//! A `stop_capture` that lands between the two cancels the request; the late
//! grant is then released and reported as [`SessionError::Superseded`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::{fallback_tone, AudioBuffer, CaptureSink};
use crate::config::CaptureMode;
use crate::engine::{AudioContext, MicConstraints};

use super::manager::{AudioSessionManager, SessionError, SessionInner};
use super::state::{Affordance, SessionState};

/// Ticket for one microphone request.
pub struct CaptureRequest {
    id: u64,
    generation: u64,
    ctx: Arc<dyn AudioContext>,
}

impl CaptureRequest {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for CaptureRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureRequest")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// What `stop_capture` did.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// Nothing was being captured.
    NotListening,
    /// `last_buffer` was replaced.
    Recorded {
        samples: usize,
        frames: usize,
        /// The fallback tone stood in for an empty capture.
        fallback: bool,
        held: Duration,
    },
    /// Hold mode released too early; `last_buffer` is unchanged.
    Discarded { held: Duration },
}

impl AudioSessionManager {
    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Validate preconditions and register a pending microphone request.
    pub fn request_capture(&self) -> Result<CaptureRequest, SessionError> {
        self.prepare_context()?;
        let mut inner = self.lock();
        match inner.state {
            SessionState::Playing => {
                inner.log("capture_rejected_playing");
                return Err(SessionError::CaptureWhilePlaying);
            }
            SessionState::Listening => {
                inner.log("capture_already_listening");
                return Err(SessionError::AlreadyListening);
            }
            SessionState::Idle => {}
        }
        if inner.pending_capture.is_some() {
            log::debug!("session: microphone request already in flight");
            return Err(SessionError::CaptureInFlight);
        }

        let ctx = self.context_for_use(&mut inner)?;
        inner.next_request += 1;
        let id = inner.next_request;
        inner.pending_capture = Some(id);
        let generation = inner.generation;
        drop(inner);

        self.spawn_resume(&ctx);
        Ok(CaptureRequest {
            id,
            generation,
            ctx,
        })
    }

    /// Await the microphone for `req` and start listening if the request is
    /// still wanted.
    pub async fn complete_capture(&self, req: CaptureRequest) -> Result<(), SessionError> {
        let constraints = MicConstraints::from(&self.audio);
        let result = req.ctx.open_microphone(&constraints).await;

        let mut inner = self.lock();
        let current = inner.generation == req.generation && inner.pending_capture == Some(req.id);
        if !current {
            if let Ok(mut stream) = result {
                stream.stop();
                inner.log("stale_mic_grant_discarded");
            }
            return Err(SessionError::Superseded);
        }
        inner.pending_capture = None;

        let mut stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("session: microphone request failed: {e}");
                inner.affordance = Some(Affordance::RetryMicrophone);
                inner.log("mic_access_failed");
                return Err(SessionError::MicAccess(e));
            }
        };

        let source_rate = stream.sample_rate();
        let budget = self.audio.max_recording_secs.max(0.0) * source_rate as f32;
        let max_samples = (budget as usize).max(1);
        let sink = Arc::new(CaptureSink::new(max_samples, source_rate));
        let node = match stream.connect(Arc::clone(&sink)) {
            Ok(node) => node,
            Err(e) => {
                stream.stop();
                log::warn!("session: could not connect capture node: {e}");
                inner.affordance = Some(Affordance::RetryMicrophone);
                inner.log("mic_access_failed");
                return Err(SessionError::MicAccess(e));
            }
        };
        log::debug!("session: capturing from {} at {source_rate} Hz", stream.label());

        sink.arm();
        inner.mic_stream = Some(stream);
        inner.capture_node = Some(node);
        inner.sink = Some(sink);
        inner.capture_started = Some(Instant::now());
        inner.capture_seq += 1;
        inner.affordance = None;
        inner.state = SessionState::Listening;
        inner.log("mic_start");
        Ok(())
    }

    /// Acquire the microphone and start accumulating frames.
    pub async fn start_capture(&self) -> Result<(), SessionError> {
        let req = self.request_capture()?;
        self.complete_capture(req).await
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    /// End the current capture and apply the configured stop policy.
    ///
    /// Also cancels a microphone request that has not resolved yet.
    pub fn stop_capture(&self) -> StopOutcome {
        let mut inner = self.lock();
        self.stop_capture_locked(&mut inner)
    }

    pub(super) fn stop_capture_locked(&self, inner: &mut SessionInner) -> StopOutcome {
        if inner.pending_capture.take().is_some() {
            inner.log("capture_request_cancelled");
        }
        if inner.state != SessionState::Listening {
            return StopOutcome::NotListening;
        }

        let captured = inner.release_capture().unwrap_or_default();
        let held = inner
            .capture_started
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        inner.state = SessionState::Idle;

        if self.config.capture_mode == CaptureMode::Hold && held <= self.config.min_hold() {
            log::debug!(
                "session: hold of {} ms under {} ms threshold",
                held.as_millis(),
                self.config.min_hold_ms
            );
            inner.log("capture_discarded_short");
            return StopOutcome::Discarded { held };
        }

        let target_rate = inner
            .live_context()
            .map(|ctx| ctx.sample_rate())
            .or(captured.last_rate())
            .unwrap_or(0);
        let frames = captured.frames;
        let dropped = captured.dropped;
        let fallback = captured.is_empty();
        let buffer = if fallback {
            fallback_tone(target_rate, self.config.fallback_tone_secs)
        } else {
            AudioBuffer::new(captured.into_rate(target_rate), target_rate)
        };

        if dropped > 0 {
            log::warn!("session: {dropped} frames dropped during capture");
        }
        log::info!(
            "session: recorded {:.2}s ({frames} frames, {dropped} dropped{})",
            buffer.duration_secs(),
            if fallback { ", fallback tone" } else { "" }
        );

        let samples = buffer.len();
        inner.last_buffer = Some(Arc::new(buffer));
        inner.log("buffer_recorded");
        StopOutcome::Recorded {
            samples,
            frames,
            fallback,
            held,
        }
    }

    // -----------------------------------------------------------------------
    // Push-to-talk entry points
    // -----------------------------------------------------------------------

    /// Synchronous half of a record press.
    ///
    /// Toggle mode stops a running (or pending) capture and returns `None`;
    /// otherwise a request is registered and returned for
    /// [`complete_capture`](Self::complete_capture).
    pub fn press_record(&self) -> Result<Option<CaptureRequest>, SessionError> {
        if self.config.capture_mode == CaptureMode::Toggle {
            let mut inner = self.lock();
            if inner.state == SessionState::Listening || inner.pending_capture.is_some() {
                self.stop_capture_locked(&mut inner);
                return Ok(None);
            }
        }
        self.request_capture().map(Some)
    }

    /// Record button pressed.
    pub async fn record_pressed(&self) -> Result<(), SessionError> {
        match self.press_record()? {
            Some(req) => self.complete_capture(req).await,
            None => Ok(()),
        }
    }

    /// Record button released.  Ignored in toggle mode.
    pub fn record_released(&self) -> StopOutcome {
        match self.config.capture_mode {
            CaptureMode::Toggle => StopOutcome::NotListening,
            CaptureMode::Hold => self.stop_capture(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
