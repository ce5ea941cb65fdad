//! Recovery from platform interruptions.
//!
//! Signals never change `state` directly.  Visibility and restore signals
//! only resume (or optionally suspend) the context; a device change while
//! listening swaps the microphone stream underneath the running capture.
//!
//! ```text
//! DeviceChanged (listening)
//!   └─▶ disconnect node, stop stream, reacquiring = true   [handle_signal]
//!         └─▶ open_microphone().await                      [reacquire]
//!               ├─ Ok  → connect to the same sink   → mic_reacquired
//!               └─ Err → mic_reacquire_failed → stop_capture → idle
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audio::CaptureSink;
use crate::engine::{AudioContext, MicConstraints};

use super::manager::{AudioSessionManager, SessionError};
use super::state::{Affordance, SessionState};

/// External lifecycle signal delivered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleSignal {
    /// The consumer became visible again.
    Visible,
    Hidden,
    /// The host was restored from a frozen or cached state.
    Restored,
    /// The default input device changed.
    DeviceChanged,
}

/// A re-acquisition started by a device change, to be finished with
/// [`AudioSessionManager::reacquire`].
pub struct ReacquireRequest {
    generation: u64,
    capture_seq: u64,
    ctx: Arc<dyn AudioContext>,
    sink: Arc<CaptureSink>,
}

impl std::fmt::Debug for ReacquireRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReacquireRequest")
            .field("generation", &self.generation)
            .field("capture_seq", &self.capture_seq)
            .finish_non_exhaustive()
    }
}

impl AudioSessionManager {
    /// React to a lifecycle signal.
    ///
    /// Returns a [`ReacquireRequest`] when a device change hit a running
    /// capture; the caller must pass it to [`reacquire`](Self::reacquire).
    pub fn handle_signal(&self, signal: LifecycleSignal) -> Option<ReacquireRequest> {
        match signal {
            LifecycleSignal::Visible => {
                self.log_event("visibility_visible");
                self.resume_if_suspended();
                None
            }
            LifecycleSignal::Restored => {
                self.log_event("page_restored");
                self.resume_if_suspended();
                None
            }
            LifecycleSignal::Hidden => {
                self.on_hidden();
                None
            }
            LifecycleSignal::DeviceChanged => self.begin_reacquire(),
        }
    }

    fn on_hidden(&self) {
        let ctx = {
            let mut inner = self.lock();
            inner.log("visibility_hidden");
            if !self.config.suspend_when_hidden {
                return;
            }
            inner.live_context()
        };
        let Some(ctx) = ctx else {
            return;
        };
        match ctx.suspend() {
            Ok(()) => self.log_event("context_suspended"),
            Err(e) => log::warn!("session: could not suspend context: {e}"),
        }
    }

    fn begin_reacquire(&self) -> Option<ReacquireRequest> {
        let mut inner = self.lock();
        if inner.state != SessionState::Listening {
            inner.log("devicechange_ignored");
            return None;
        }
        if inner.reacquiring {
            inner.log("reacquire_in_progress");
            return None;
        }
        let sink = inner.sink.clone()?;
        let Some(ctx) = inner.live_context() else {
            log::warn!("session: device changed while listening without a context");
            inner.affordance = Some(Affordance::RetryMicrophone);
            inner.log("mic_reacquire_failed");
            self.stop_capture_locked(&mut inner);
            return None;
        };

        if let Some(mut node) = inner.capture_node.take() {
            node.disconnect();
        }
        if let Some(mut stream) = inner.mic_stream.take() {
            stream.stop();
        }
        inner.reacquiring = true;
        inner.log("devicechange_while_listening");
        Some(ReacquireRequest {
            generation: inner.generation,
            capture_seq: inner.capture_seq,
            ctx,
            sink,
        })
    }

    /// Open a new stream for `req` and reconnect it to the running capture.
    ///
    /// On failure the capture is finished through the normal stop path.
    pub async fn reacquire(&self, req: ReacquireRequest) -> Result<(), SessionError> {
        let constraints = MicConstraints::from(&self.audio);
        let result = req.ctx.open_microphone(&constraints).await;

        let mut inner = self.lock();
        let current = inner.generation == req.generation
            && inner.capture_seq == req.capture_seq
            && inner.reacquiring
            && inner.state == SessionState::Listening;
        if !current {
            if let Ok(mut stream) = result {
                stream.stop();
                inner.log("stale_mic_grant_discarded");
            }
            return Err(SessionError::Superseded);
        }
        inner.reacquiring = false;

        let connected = result.and_then(|mut stream| {
            match stream.connect(Arc::clone(&req.sink)) {
                Ok(node) => Ok((stream, node)),
                Err(e) => {
                    stream.stop();
                    Err(e)
                }
            }
        });
        match connected {
            Ok((stream, node)) => {
                log::debug!(
                    "session: reconnected capture to {} at {} Hz",
                    stream.label(),
                    stream.sample_rate()
                );
                // Opens a new segment so earlier frames keep their rate.
                req.sink.set_source_rate(stream.sample_rate());
                inner.mic_stream = Some(stream);
                inner.capture_node = Some(node);
                inner.log("mic_reacquired");
                Ok(())
            }
            Err(e) => {
                log::warn!("session: microphone re-acquisition failed: {e}");
                inner.affordance = Some(Affordance::RetryMicrophone);
                inner.log("mic_reacquire_failed");
                self.stop_capture_locked(&mut inner);
                Err(SessionError::MicAccess(e))
            }
        }
    }

    /// Handle a device change end to end.
    pub async fn on_device_change(&self) -> Result<(), SessionError> {
        match self.handle_signal(LifecycleSignal::DeviceChanged) {
            Some(req) => self.reacquire(req).await,
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, CaptureMode};
    use crate::engine::mock::{MicOutcome, MockBackend};
    use tokio::sync::Notify;

    fn manager_with(backend: &MockBackend, config: AppConfig) -> AudioSessionManager {
        let m = AudioSessionManager::new(Arc::new(backend.clone()), &config);
        m.unlock().expect("unlock");
        m
    }

    fn toggle_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.session.capture_mode = CaptureMode::Toggle;
        config
    }

    #[tokio::test]
    async fn device_change_reconnects_the_same_sink() {
        let backend = MockBackend::new(16_000);
        let m = manager_with(&backend, toggle_config());
        m.start_capture().await.expect("start");
        backend.feed_frame(&[0.1]);

        m.on_device_change().await.expect("reacquire");

        assert_eq!(backend.mic_requests(), 2);
        assert_eq!(m.state(), SessionState::Listening);
        assert_eq!(backend.live_streams(), 1);
        assert_eq!(m.event_labels()[..2], ["mic_reacquired", "devicechange_while_listening"]);

        backend.feed_frame(&[0.2]);
        m.stop_capture();
        assert_eq!(m.last_buffer().expect("buffer").samples(), &[0.1, 0.2]);
    }

    #[tokio::test]
    async fn failed_reacquire_leaves_session_idle_and_released() {
        let backend = MockBackend::new(16_000);
        let m = manager_with(&backend, toggle_config());
        m.start_capture().await.expect("start");
        backend.feed_frame(&[0.4, 0.4]);
        backend.script_mic(MicOutcome::NoDevice);

        let err = m.on_device_change().await.unwrap_err();

        assert!(matches!(err, SessionError::MicAccess(_)));
        assert_eq!(backend.mic_requests(), 2);
        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(backend.live_streams(), 0);
        assert_eq!(backend.connected_sinks(), 0);
        assert_eq!(m.affordance(), Some(Affordance::RetryMicrophone));
        // What was captured before the failure is kept.
        assert_eq!(m.last_buffer().expect("buffer").samples(), &[0.4, 0.4]);
        let labels = m.event_labels();
        assert_eq!(labels[..2], ["buffer_recorded", "mic_reacquire_failed"]);
    }

    #[tokio::test]
    async fn device_swap_to_other_rate_keeps_recording_duration() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, toggle_config());
        m.start_capture().await.expect("start");
        // 0.5 s from the 48 kHz microphone.
        for _ in 0..50 {
            backend.feed_frame(&[0.25; 480]);
        }

        backend.set_mic_rate(24_000);
        m.on_device_change().await.expect("reacquire");
        // 0.5 s from the 24 kHz replacement.
        for _ in 0..50 {
            backend.feed_frame(&[0.25; 240]);
        }
        m.stop_capture();

        let buffer = m.last_buffer().expect("buffer");
        assert_eq!(buffer.sample_rate(), 48_000);
        assert!(
            (buffer.duration_secs() - 1.0).abs() < 1e-3,
            "got {} s",
            buffer.duration_secs()
        );
        assert!(buffer.samples().iter().all(|&s| (s - 0.25).abs() < 1e-5));
    }

    #[tokio::test]
    async fn device_change_after_external_close_reports_failure() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, toggle_config());
        m.start_capture().await.expect("start");
        backend.feed_frame(&[0.3]);
        m.lock().context.as_ref().expect("context").close();

        assert!(m.handle_signal(LifecycleSignal::DeviceChanged).is_none());

        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(backend.live_streams(), 0);
        assert_eq!(m.affordance(), Some(Affordance::RetryMicrophone));
        assert_eq!(m.event_labels()[..2], ["buffer_recorded", "mic_reacquire_failed"]);
    }

    #[tokio::test]
    async fn device_change_while_idle_is_ignored() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, toggle_config());

        assert!(m.handle_signal(LifecycleSignal::DeviceChanged).is_none());
        assert_eq!(backend.mic_requests(), 0);
        assert_eq!(m.event_labels()[0], "devicechange_ignored");
    }

    #[tokio::test]
    async fn second_device_change_during_reacquire_is_ignored() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, toggle_config());
        m.start_capture().await.expect("start");

        let gate = Arc::new(Notify::new());
        backend.script_mic(MicOutcome::GrantAfter(Arc::clone(&gate)));
        let req = m
            .handle_signal(LifecycleSignal::DeviceChanged)
            .expect("first change starts a re-acquisition");
        assert!(m.handle_signal(LifecycleSignal::DeviceChanged).is_none());
        assert_eq!(m.event_labels()[0], "reacquire_in_progress");

        gate.notify_one();
        m.reacquire(req).await.expect("reacquire");
        assert_eq!(backend.mic_requests(), 2);
        assert_eq!(m.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn stop_during_reacquire_discards_late_stream() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, toggle_config());
        m.start_capture().await.expect("start");

        let gate = Arc::new(Notify::new());
        backend.script_mic(MicOutcome::GrantAfter(Arc::clone(&gate)));
        let req = m.handle_signal(LifecycleSignal::DeviceChanged).expect("req");
        m.stop_capture();

        gate.notify_one();
        assert!(matches!(m.reacquire(req).await, Err(SessionError::Superseded)));
        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(backend.live_streams(), 0);
    }

    #[tokio::test]
    async fn visible_resumes_suspended_context() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, toggle_config());
        backend.suspend_current();

        m.handle_signal(LifecycleSignal::Visible);
        while m.context_status() != "running" {
            tokio::task::yield_now().await;
        }

        assert_eq!(backend.resume_calls(), 1);
        assert_eq!(m.state(), SessionState::Idle);
        assert!(m.event_labels().contains(&"visibility_visible".to_string()));
    }

    #[tokio::test]
    async fn restored_logs_and_resumes() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, toggle_config());
        backend.suspend_current();

        m.handle_signal(LifecycleSignal::Restored);
        while m.context_status() != "running" {
            tokio::task::yield_now().await;
        }
        assert!(m.event_labels().contains(&"page_restored".to_string()));
    }

    #[test]
    fn hidden_only_logs_by_default() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, toggle_config());

        m.handle_signal(LifecycleSignal::Hidden);
        assert_eq!(m.context_status(), "running");
        assert_eq!(m.event_labels()[0], "visibility_hidden");
    }

    #[test]
    fn hidden_suspends_when_configured() {
        let backend = MockBackend::new(48_000);
        let mut config = toggle_config();
        config.session.suspend_when_hidden = true;
        let m = manager_with(&backend, config);

        m.handle_signal(LifecycleSignal::Hidden);
        assert_eq!(m.context_status(), "suspended");
        assert_eq!(m.event_labels()[..2], ["context_suspended", "visibility_hidden"]);
    }

    #[test]
    fn signal_names_are_snake_case() {
        let json = serde_json::to_string(&LifecycleSignal::DeviceChanged).expect("json");
        assert_eq!(json, "\"device_changed\"");
    }
}
