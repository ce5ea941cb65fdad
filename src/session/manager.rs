//! The audio session manager: owner of the shared context and session record.
//!
//! [`AudioSessionManager`] holds one [`SessionInner`] behind a
//! `std::sync::Mutex`.  Every operation takes the lock for a short critical
//! section and never holds it across an `.await` or a blocking engine call.
//! The operations are split across sibling modules as separate `impl` blocks:
//!
//! | Module       | Operations                                              |
//! |--------------|---------------------------------------------------------|
//! | `manager`    | `unlock`, `ensure_context`, `resume_if_suspended`, `close_context`, `reset`, observers |
//! | `capture`    | `start_capture`, `stop_capture`, `record_pressed`, `record_released` |
//! | `playback`   | `play`                                                  |
//! | `recovery`   | `handle_signal`, device-change re-acquisition           |
//!
//! # Stale completions
//!
//! `generation` is bumped by every [`reset`](AudioSessionManager::reset).
//! Asynchronous work captures the generation (plus a request id or playback
//! token) before awaiting and re-checks it afterwards; a mismatch means the
//! result belongs to a session that no longer exists and is discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::audio::{AudioBuffer, CaptureSink, CapturedAudio};
use crate::config::{AppConfig, AudioConfig, SessionConfig, UnlockPolicy};
use crate::engine::{AudioBackend, AudioContext, CaptureNode, ContextStatus, EngineError, MicStream};

use super::events::EventLog;
use super::state::{Affordance, SessionSnapshot, SessionState};

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

/// Why a session operation did not take effect.
///
/// None of these are fatal; the session is always left in a well-defined
/// state and the event log says what happened.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("audio is locked until a user gesture unlocks it")]
    UnlockRequired,

    #[error("cannot start capture while playback is running")]
    CaptureWhilePlaying,

    #[error("capture is already running")]
    AlreadyListening,

    #[error("a microphone request is already pending")]
    CaptureInFlight,

    #[error("playback is already running")]
    AlreadyPlaying,

    #[error("microphone unavailable: {0}")]
    MicAccess(#[source] EngineError),

    /// An asynchronous result arrived after the request was cancelled or the
    /// session was reset.
    #[error("request superseded by a newer session operation")]
    Superseded,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// SessionInner
// ---------------------------------------------------------------------------

/// The mutable session record.  Only the manager touches it.
pub(super) struct SessionInner {
    pub(super) context: Option<Arc<dyn AudioContext>>,
    pub(super) context_id: u64,
    pub(super) state: SessionState,
    pub(super) mic_stream: Option<Box<dyn MicStream>>,
    pub(super) capture_node: Option<Box<dyn CaptureNode>>,
    /// Accumulates the frames of the current capture.
    pub(super) sink: Option<Arc<CaptureSink>>,
    pub(super) last_buffer: Option<Arc<AudioBuffer>>,
    pub(super) capture_started: Option<Instant>,
    pub(super) events: EventLog,
    pub(super) affordance: Option<Affordance>,

    /// Bumped on every reset.
    pub(super) generation: u64,
    /// Id of the microphone request whose grant is still wanted.
    pub(super) pending_capture: Option<u64>,
    pub(super) next_request: u64,
    /// Bumped on every capture start; identifies the capture a
    /// re-acquisition belongs to.
    pub(super) capture_seq: u64,
    pub(super) reacquiring: bool,
    /// Identifies the playback whose completion may end `Playing`.
    pub(super) playback_token: u64,
}

impl SessionInner {
    fn new(event_capacity: usize) -> Self {
        Self {
            context: None,
            context_id: 0,
            state: SessionState::Idle,
            mic_stream: None,
            capture_node: None,
            sink: None,
            last_buffer: None,
            capture_started: None,
            events: EventLog::new(event_capacity),
            affordance: None,
            generation: 0,
            pending_capture: None,
            next_request: 0,
            capture_seq: 0,
            reacquiring: false,
            playback_token: 0,
        }
    }

    pub(super) fn log(&mut self, label: &str) {
        self.events.push(label);
    }

    /// Disarm the sink, stop the stream, disconnect the node and drain the
    /// frames.  Returns `None` when nothing was being captured.
    pub(super) fn release_capture(&mut self) -> Option<CapturedAudio> {
        let sink = self.sink.take();
        if let Some(sink) = &sink {
            sink.disarm();
        }
        if let Some(mut stream) = self.mic_stream.take() {
            stream.stop();
        }
        if let Some(mut node) = self.capture_node.take() {
            node.disconnect();
        }
        self.reacquiring = false;
        sink.map(|s| s.take())
    }

    pub(super) fn live_context(&self) -> Option<Arc<dyn AudioContext>> {
        self.context
            .as_ref()
            .filter(|ctx| ctx.status() != ContextStatus::Closed)
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// AudioSessionManager
// ---------------------------------------------------------------------------

/// Owns the single audio session.
///
/// Share it as `Arc<AudioSessionManager>`; each instance is an isolated
/// session, so tests build one per case over a mock backend.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use audio_session::config::AppConfig;
/// use audio_session::engine::CpalBackend;
/// use audio_session::session::AudioSessionManager;
///
/// # async fn example() -> Result<(), audio_session::session::SessionError> {
/// let manager = Arc::new(AudioSessionManager::new(
///     Arc::new(CpalBackend::new()),
///     &AppConfig::default(),
/// ));
/// manager.unlock()?;
/// manager.start_capture().await?;
/// manager.stop_capture();
/// manager.play()?;
/// # Ok(())
/// # }
/// ```
pub struct AudioSessionManager {
    pub(super) backend: Arc<dyn AudioBackend>,
    pub(super) config: SessionConfig,
    pub(super) audio: AudioConfig,
    pub(super) inner: Arc<Mutex<SessionInner>>,
}

impl AudioSessionManager {
    pub fn new(backend: Arc<dyn AudioBackend>, config: &AppConfig) -> Self {
        log::debug!("session: using {} backend", backend.name());
        Self {
            backend,
            config: config.session.clone(),
            audio: config.audio.clone(),
            inner: Arc::new(Mutex::new(SessionInner::new(
                config.session.event_log_capacity,
            ))),
        }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Context lifecycle
    // -----------------------------------------------------------------------

    /// Return the shared context, creating it (and bumping `context_id`) if
    /// there is none.
    ///
    /// The backend may block while it opens the output device, so creation
    /// runs without the lock.  If another caller installed a context in the
    /// meantime, that one wins and the new one is closed.
    pub fn ensure_context(&self) -> Result<Arc<dyn AudioContext>, SessionError> {
        if let Some(ctx) = self.lock().live_context() {
            return Ok(ctx);
        }
        let created = self.backend.create_context();
        let mut inner = self.lock();
        self.install_context(&mut inner, created)
    }

    fn install_context(
        &self,
        inner: &mut SessionInner,
        created: Result<Arc<dyn AudioContext>, EngineError>,
    ) -> Result<Arc<dyn AudioContext>, SessionError> {
        if let Some(existing) = inner.live_context() {
            if let Ok(ctx) = created {
                log::debug!("session: discarding context created by a concurrent caller");
                ctx.close();
            }
            return Ok(existing);
        }
        match created {
            Ok(ctx) => {
                inner.context_id += 1;
                inner.context = Some(Arc::clone(&ctx));
                inner.log("context_created");
                log::debug!(
                    "session: context #{} at {} Hz ({})",
                    inner.context_id,
                    ctx.sample_rate(),
                    ctx.status().label()
                );
                Ok(ctx)
            }
            Err(EngineError::GestureRequired) => {
                inner.affordance = Some(Affordance::Unlock);
                inner.log("unlock_required");
                Err(SessionError::UnlockRequired)
            }
            Err(e) => {
                log::warn!("session: context creation failed: {e}");
                inner.log("context_create_failed");
                Err(SessionError::Engine(e))
            }
        }
    }

    /// Under the implicit policy, create the context before an idle session
    /// starts a capture or playback, so the locked section only looks it up.
    pub(super) fn prepare_context(&self) -> Result<(), SessionError> {
        if self.config.unlock_policy == UnlockPolicy::Implicit
            && self.state() == SessionState::Idle
        {
            self.ensure_context()?;
        }
        Ok(())
    }

    /// Context for a capture or playback call.  A missing context means the
    /// session is still locked.
    pub(super) fn context_for_use(
        &self,
        inner: &mut SessionInner,
    ) -> Result<Arc<dyn AudioContext>, SessionError> {
        match inner.live_context() {
            Some(ctx) => Ok(ctx),
            None => {
                inner.affordance = Some(Affordance::Unlock);
                inner.log("unlock_required");
                Err(SessionError::UnlockRequired)
            }
        }
    }

    /// Satisfy the gesture requirement: create the context and resume it.
    pub fn unlock(&self) -> Result<(), SessionError> {
        let ctx = self.ensure_context()?;
        {
            let mut inner = self.lock();
            inner.affordance = None;
            inner.log("unlocked");
        }
        self.spawn_resume(&ctx);
        Ok(())
    }

    /// Resume a suspended context in the background.
    ///
    /// Returns the spawned task, or `None` when there was nothing to resume
    /// (no context, not suspended, or no tokio runtime on this thread).
    pub fn resume_if_suspended(&self) -> Option<JoinHandle<()>> {
        let ctx = self.lock().live_context()?;
        self.spawn_resume(&ctx)
    }

    pub(super) fn spawn_resume(&self, ctx: &Arc<dyn AudioContext>) -> Option<JoinHandle<()>> {
        if ctx.status() != ContextStatus::Suspended {
            return None;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("session: no tokio runtime, cannot resume suspended context");
            return None;
        };
        let ctx = Arc::clone(ctx);
        let inner = Arc::downgrade(&self.inner);
        Some(runtime.spawn(async move {
            let result = ctx.resume().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            match result {
                Ok(()) => inner.log("context_resumed"),
                Err(e) => {
                    // The next gesture-bearing call retries.
                    log::warn!("session: resume failed: {e}");
                    inner.log("context_resume_failed");
                }
            }
        }))
    }

    /// Close the context after tearing down any capture or playback.
    ///
    /// The session is left idle without a context; the next unlock (or an
    /// implicit-policy capture/play) creates a fresh one.
    pub fn close_context(&self) {
        let mut inner = self.lock();
        self.teardown_locked(&mut inner);
    }

    /// Release capture, forget playback, close the context; state → idle.
    fn teardown_locked(&self, inner: &mut SessionInner) {
        inner.pending_capture = None;
        if inner.release_capture().is_some() {
            log::debug!("session: active capture discarded");
        }
        inner.capture_started = None;
        inner.playback_token += 1;
        inner.state = SessionState::Idle;
        if let Some(ctx) = inner.context.take() {
            ctx.close();
            inner.log("audio_context_closed");
        }
    }

    /// Recover from anything: stop capture, clear the buffer, close and
    /// recreate the context, force `Idle`.
    ///
    /// Late asynchronous completions from before the reset are discarded.
    pub fn reset(&self) -> Result<(), SessionError> {
        {
            let mut inner = self.lock();
            inner.log("reset_audio_stack");
            inner.generation += 1;
            self.teardown_locked(&mut inner);
            inner.last_buffer = None;
        }
        self.ensure_context()?;
        self.lock().affordance = None;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Event log
    // -----------------------------------------------------------------------

    pub fn log_event(&self, label: &str) {
        self.lock().log(label);
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn context_id(&self) -> u64 {
        self.lock().context_id
    }

    /// `"none"` before the first context, otherwise the context's status.
    pub fn context_status(&self) -> String {
        match &self.lock().context {
            Some(ctx) => ctx.status().label().to_string(),
            None => "none".to_string(),
        }
    }

    /// Event log display strings, newest first.
    pub fn event_log(&self) -> Vec<String> {
        self.lock().events.display_lines()
    }

    /// Event labels without timestamps, newest first.
    pub fn event_labels(&self) -> Vec<String> {
        self.lock().events.labels()
    }

    pub fn affordance(&self) -> Option<Affordance> {
        self.lock().affordance
    }

    pub fn last_buffer(&self) -> Option<Arc<AudioBuffer>> {
        self.lock().last_buffer.clone()
    }

    pub fn has_buffer(&self) -> bool {
        self.lock().last_buffer.is_some()
    }

    pub fn is_capture_pending(&self) -> bool {
        self.lock().pending_capture.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.lock();
        SessionSnapshot {
            state: inner.state,
            context_id: inner.context_id,
            context_status: inner
                .context
                .as_ref()
                .map_or("none", |ctx| ctx.status().label())
                .to_string(),
            capture_pending: inner.pending_capture.is_some(),
            buffer_secs: inner.last_buffer.as_ref().map(|b| b.duration_secs()),
            affordance: inner.affordance,
            events: inner.events.display_lines(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureMode;
    use crate::engine::mock::MockBackend;

    fn manager_with(backend: &MockBackend, policy: UnlockPolicy) -> AudioSessionManager {
        let mut config = AppConfig::default();
        config.session.unlock_policy = policy;
        config.session.capture_mode = CaptureMode::Toggle;
        AudioSessionManager::new(Arc::new(backend.clone()), &config)
    }

    #[test]
    fn fresh_session_has_no_context() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, UnlockPolicy::Explicit);

        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(m.context_id(), 0);
        assert_eq!(m.context_status(), "none");
        assert!(m.event_log().is_empty());
        assert_eq!(backend.contexts_created(), 0);
    }

    #[test]
    fn ensure_context_is_idempotent() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, UnlockPolicy::Explicit);

        m.ensure_context().expect("first");
        m.ensure_context().expect("second");

        assert_eq!(m.context_id(), 1);
        assert_eq!(backend.contexts_created(), 1);
        assert_eq!(m.event_labels(), vec!["context_created"]);
    }

    #[test]
    fn reset_creates_the_context_without_holding_the_lock() {
        let backend = MockBackend::new(48_000);
        let m = Arc::new(manager_with(&backend, UnlockPolicy::Explicit));
        m.unlock().expect("unlock");

        let release = backend.hold_next_create();
        let resetting = {
            let m = Arc::clone(&m);
            std::thread::spawn(move || m.reset())
        };
        while backend.creates_started() < 2 {
            std::thread::yield_now();
        }

        // The backend is still opening the new context.
        assert!(m.inner.try_lock().is_ok());
        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(m.event_labels()[0], "audio_context_closed");

        release.send(()).expect("release");
        resetting.join().expect("thread").expect("reset");
        assert_eq!(m.context_id(), 2);
        assert_eq!(m.context_status(), "running");
    }

    #[test]
    fn concurrent_creation_keeps_a_single_context() {
        let backend = MockBackend::new(48_000);
        let m = Arc::new(manager_with(&backend, UnlockPolicy::Explicit));

        let release = backend.hold_next_create();
        let slow = {
            let m = Arc::clone(&m);
            std::thread::spawn(move || m.ensure_context())
        };
        while backend.creates_started() < 1 {
            std::thread::yield_now();
        }
        let fast = m.ensure_context().expect("fast");
        release.send(()).expect("release");
        let slow = slow.join().expect("thread").expect("slow");

        assert!(Arc::ptr_eq(&fast, &slow));
        assert_eq!(m.context_id(), 1);
        assert_eq!(backend.contexts_created(), 2);
        assert_eq!(backend.open_contexts(), 1);
    }

    #[test]
    fn unlock_creates_context_and_clears_affordance() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, UnlockPolicy::Explicit);

        assert!(matches!(m.play(), Err(SessionError::UnlockRequired)));
        assert_eq!(m.affordance(), Some(Affordance::Unlock));

        m.unlock().expect("unlock");
        assert_eq!(m.affordance(), None);
        assert_eq!(m.context_status(), "running");
        assert_eq!(m.event_labels()[..2], ["unlocked", "context_created"]);
    }

    #[test]
    fn gesture_rejection_surfaces_unlock() {
        let backend = MockBackend::new(48_000);
        backend.require_gesture(true);
        let m = manager_with(&backend, UnlockPolicy::Implicit);

        assert!(matches!(m.play(), Err(SessionError::UnlockRequired)));
        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(m.affordance(), Some(Affordance::Unlock));
        assert_eq!(m.context_id(), 0);

        backend.require_gesture(false);
        m.play().expect("play after gesture");
        assert_eq!(m.state(), SessionState::Playing);
    }

    #[test]
    fn reset_recreates_context_and_goes_idle() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, UnlockPolicy::Explicit);
        m.unlock().expect("unlock");
        m.play().expect("play");
        assert_eq!(m.state(), SessionState::Playing);

        m.reset().expect("reset");

        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(m.context_id(), 2);
        assert!(!m.has_buffer());
        assert_eq!(backend.open_contexts(), 1);
        assert_eq!(
            m.event_labels()[..3],
            ["context_created", "audio_context_closed", "reset_audio_stack"]
        );
    }

    #[test]
    fn reset_twice_yields_the_same_end_state() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, UnlockPolicy::Explicit);
        m.unlock().expect("unlock");

        m.reset().expect("first reset");
        let first = (m.state(), m.has_buffer(), m.context_status(), backend.open_contexts());
        m.reset().expect("second reset");
        let second = (m.state(), m.has_buffer(), m.context_status(), backend.open_contexts());

        assert_eq!(first, second);
        assert_eq!(second.0, SessionState::Idle);
        assert_eq!(m.context_id(), 3);
    }

    #[test]
    fn reset_before_unlock_creates_first_context() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, UnlockPolicy::Explicit);
        m.reset().expect("reset");

        assert_eq!(m.context_id(), 1);
        assert_eq!(m.event_labels(), vec!["context_created", "reset_audio_stack"]);
    }

    #[test]
    fn late_playback_end_after_reset_is_ignored() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, UnlockPolicy::Explicit);
        m.unlock().expect("unlock");
        m.play().expect("play");

        let stale = backend.take_pending_playbacks();
        m.reset().expect("reset");
        m.play().expect("play again");

        for on_ended in stale {
            on_ended();
        }
        assert_eq!(m.state(), SessionState::Playing);
        assert!(!m.event_labels().contains(&"play_end".to_string()));
    }

    #[test]
    fn close_context_leaves_idle_without_context() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, UnlockPolicy::Explicit);
        m.unlock().expect("unlock");
        m.close_context();

        assert_eq!(m.context_status(), "none");
        assert_eq!(backend.open_contexts(), 0);
        assert!(matches!(m.play(), Err(SessionError::UnlockRequired)));
    }

    #[tokio::test]
    async fn resume_if_suspended_resumes_in_background() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, UnlockPolicy::Explicit);
        m.unlock().expect("unlock");
        backend.suspend_current();
        assert_eq!(m.context_status(), "suspended");

        let task = m.resume_if_suspended().expect("resume spawned");
        task.await.expect("resume task");

        assert_eq!(m.context_status(), "running");
        assert_eq!(m.event_labels()[0], "context_resumed");
    }

    #[tokio::test]
    async fn resume_failure_is_swallowed() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, UnlockPolicy::Explicit);
        m.unlock().expect("unlock");
        backend.suspend_current();
        backend.require_gesture(true);

        m.resume_if_suspended().expect("spawned").await.expect("task");

        assert_eq!(m.context_status(), "suspended");
        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(m.event_labels()[0], "context_resume_failed");
    }

    #[test]
    fn running_context_needs_no_resume() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, UnlockPolicy::Explicit);
        assert!(m.resume_if_suspended().is_none());
        m.unlock().expect("unlock");
        assert!(m.resume_if_suspended().is_none());
        assert_eq!(backend.resume_calls(), 0);
    }

    #[test]
    fn snapshot_reflects_session() {
        let backend = MockBackend::new(48_000);
        let m = manager_with(&backend, UnlockPolicy::Explicit);
        m.unlock().expect("unlock");
        m.log_event("custom");

        let snap = m.snapshot();
        assert_eq!(snap.state, SessionState::Idle);
        assert_eq!(snap.context_id, 1);
        assert_eq!(snap.context_status, "running");
        assert!(!snap.capture_pending);
        assert_eq!(snap.buffer_secs, None);
        assert_eq!(snap.events.len(), 3);
        assert!(snap.events[0].ends_with("custom"));
    }

    #[test]
    fn event_log_capacity_comes_from_config() {
        let backend = MockBackend::new(48_000);
        let mut config = AppConfig::default();
        config.session.event_log_capacity = 10;
        let m = AudioSessionManager::new(Arc::new(backend), &config);

        for i in 0..11 {
            m.log_event(&format!("e{i}"));
        }
        let labels = m.event_labels();
        assert_eq!(labels.len(), 10);
        assert_eq!(labels[0], "e10");
        assert_eq!(labels[9], "e1");
    }
}
