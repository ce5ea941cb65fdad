//! Scripted backend for unit tests.
//!
//! [`MockBackend`] is cheap to clone; every clone observes the same contexts,
//! streams and pending playbacks, so a test can hand one clone to the session
//! and keep another to drive the "platform".

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{
    AudioBackend, AudioContext, CaptureNode, ContextStatus, EngineError, MicConstraints, MicStream,
    PlaybackEnded,
};
use crate::audio::{AudioBuffer, CaptureSink};

/// What the next microphone request resolves to.
#[derive(Clone)]
pub enum MicOutcome {
    Grant,
    Deny,
    NoDevice,
    /// Resolve with a grant only once the gate is notified.
    GrantAfter(Arc<Notify>),
}

struct StreamState {
    live: AtomicBool,
    sink: Mutex<Option<Arc<CaptureSink>>>,
}

#[derive(Default)]
struct Control {
    gesture_required: bool,
    start_suspended: bool,
    mic_script: VecDeque<MicOutcome>,
    contexts: Vec<Arc<MockContext>>,
    mic_requests: usize,
    last_constraints: Option<MicConstraints>,
    streams: Vec<Arc<StreamState>>,
    pending_playbacks: Vec<PlaybackEnded>,
    played: Vec<Arc<AudioBuffer>>,
    resume_calls: usize,
    fail_playback: bool,
    /// Rate of streams opened from now on; the context rate when unset.
    mic_rate: Option<u32>,
    create_gate: Option<mpsc::Receiver<()>>,
    creates_started: usize,
}

#[derive(Clone)]
pub struct MockBackend {
    control: Arc<Mutex<Control>>,
    sample_rate: u32,
}

impl MockBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            control: Arc::default(),
            sample_rate,
        }
    }

    /// Deliver microphone frames at a different rate than the context.
    pub fn with_mic_rate(self, rate: u32) -> Self {
        self.set_mic_rate(rate);
        self
    }

    /// Rate of the next microphone streams, as if the user swapped devices.
    pub fn set_mic_rate(&self, rate: u32) {
        self.lock().mic_rate = Some(rate);
    }

    /// Park the next `create_context` call until the returned sender fires
    /// (or is dropped).
    pub fn hold_next_create(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        self.lock().create_gate = Some(rx);
        tx
    }

    /// Number of `create_context` calls that have begun.
    pub fn creates_started(&self) -> usize {
        self.lock().creates_started
    }

    pub fn require_gesture(&self, required: bool) {
        self.lock().gesture_required = required;
    }

    /// New contexts start suspended, like a page without a gesture yet.
    pub fn start_suspended(&self, suspended: bool) {
        self.lock().start_suspended = suspended;
    }

    /// Make `play_buffer` fail with a device error.
    pub fn fail_playback(&self, fail: bool) {
        self.lock().fail_playback = fail;
    }

    pub fn script_mic(&self, outcome: MicOutcome) {
        self.lock().mic_script.push_back(outcome);
    }

    /// Push one frame through every connected, live stream.
    pub fn feed_frame(&self, frame: &[f32]) {
        let streams = self.lock().streams.clone();
        for stream in streams {
            if !stream.live.load(Ordering::Acquire) {
                continue;
            }
            let sink = stream.sink.lock().unwrap().clone();
            if let Some(sink) = sink {
                sink.push(frame);
            }
        }
    }

    /// Fire every pending playback-ended callback.  Returns how many fired.
    pub fn finish_playback(&self) -> usize {
        let pending = std::mem::take(&mut self.lock().pending_playbacks);
        let count = pending.len();
        for on_ended in pending {
            on_ended();
        }
        count
    }

    /// Take the pending callbacks without firing them.
    pub fn take_pending_playbacks(&self) -> Vec<PlaybackEnded> {
        std::mem::take(&mut self.lock().pending_playbacks)
    }

    /// Simulate the platform auto-suspending the newest context.
    pub fn suspend_current(&self) {
        if let Some(ctx) = self.lock().contexts.last() {
            *ctx.status.lock().unwrap() = ContextStatus::Suspended;
        }
    }

    pub fn contexts_created(&self) -> usize {
        self.lock().contexts.len()
    }

    pub fn open_contexts(&self) -> usize {
        self.lock()
            .contexts
            .iter()
            .filter(|c| c.status() != ContextStatus::Closed)
            .count()
    }

    pub fn current_status(&self) -> Option<ContextStatus> {
        self.lock().contexts.last().map(|c| c.status())
    }

    pub fn mic_requests(&self) -> usize {
        self.lock().mic_requests
    }

    pub fn last_constraints(&self) -> Option<MicConstraints> {
        self.lock().last_constraints.clone()
    }

    pub fn live_streams(&self) -> usize {
        self.lock()
            .streams
            .iter()
            .filter(|s| s.live.load(Ordering::Acquire))
            .count()
    }

    pub fn connected_sinks(&self) -> usize {
        self.lock()
            .streams
            .iter()
            .filter(|s| s.sink.lock().unwrap().is_some())
            .count()
    }

    pub fn played(&self) -> Vec<Arc<AudioBuffer>> {
        self.lock().played.clone()
    }

    pub fn resume_calls(&self) -> usize {
        self.lock().resume_calls
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap()
    }
}

impl AudioBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn create_context(&self) -> Result<Arc<dyn AudioContext>, EngineError> {
        let gate = {
            let mut control = self.lock();
            control.creates_started += 1;
            control.create_gate.take()
        };
        if let Some(gate) = gate {
            let _ = gate.recv();
        }

        let mut control = self.lock();
        if control.gesture_required {
            return Err(EngineError::GestureRequired);
        }
        let status = if control.start_suspended {
            ContextStatus::Suspended
        } else {
            ContextStatus::Running
        };
        let ctx = Arc::new(MockContext {
            status: Mutex::new(status),
            control: Arc::clone(&self.control),
            sample_rate: self.sample_rate,
        });
        control.contexts.push(Arc::clone(&ctx));
        Ok(ctx)
    }
}

pub struct MockContext {
    status: Mutex<ContextStatus>,
    control: Arc<Mutex<Control>>,
    sample_rate: u32,
}

#[async_trait]
impl AudioContext for MockContext {
    fn status(&self) -> ContextStatus {
        *self.status.lock().unwrap()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn resume(&self) -> Result<(), EngineError> {
        let gesture_required = {
            let mut control = self.control.lock().unwrap();
            control.resume_calls += 1;
            control.gesture_required
        };
        let mut status = self.status.lock().unwrap();
        match *status {
            ContextStatus::Closed => Err(EngineError::Closed),
            _ if gesture_required => Err(EngineError::GestureRequired),
            _ => {
                *status = ContextStatus::Running;
                Ok(())
            }
        }
    }

    fn suspend(&self) -> Result<(), EngineError> {
        let mut status = self.status.lock().unwrap();
        if *status == ContextStatus::Closed {
            return Err(EngineError::Closed);
        }
        *status = ContextStatus::Suspended;
        Ok(())
    }

    fn close(&self) {
        *self.status.lock().unwrap() = ContextStatus::Closed;
        self.control.lock().unwrap().pending_playbacks.clear();
    }

    async fn open_microphone(
        &self,
        constraints: &MicConstraints,
    ) -> Result<Box<dyn MicStream>, EngineError> {
        if self.status() == ContextStatus::Closed {
            return Err(EngineError::Closed);
        }
        let (outcome, sample_rate) = {
            let mut control = self.control.lock().unwrap();
            control.mic_requests += 1;
            control.last_constraints = Some(constraints.clone());
            (
                control.mic_script.pop_front().unwrap_or(MicOutcome::Grant),
                control.mic_rate.unwrap_or(self.sample_rate),
            )
        };

        match outcome {
            MicOutcome::Grant => {}
            MicOutcome::Deny => {
                return Err(EngineError::PermissionDenied("denied by test".into()))
            }
            MicOutcome::NoDevice => return Err(EngineError::NoDevice),
            MicOutcome::GrantAfter(gate) => gate.notified().await,
        }

        let state = Arc::new(StreamState {
            live: AtomicBool::new(true),
            sink: Mutex::new(None),
        });
        self.control
            .lock()
            .unwrap()
            .streams
            .push(Arc::clone(&state));
        Ok(Box::new(MockMicStream { state, sample_rate }))
    }

    fn play_buffer(
        &self,
        buffer: Arc<AudioBuffer>,
        on_ended: PlaybackEnded,
    ) -> Result<(), EngineError> {
        if self.status() == ContextStatus::Closed {
            return Err(EngineError::Closed);
        }
        let mut control = self.control.lock().unwrap();
        if control.fail_playback {
            return Err(EngineError::Device("output unavailable".into()));
        }
        control.played.push(buffer);
        control.pending_playbacks.push(on_ended);
        Ok(())
    }
}

struct MockMicStream {
    state: Arc<StreamState>,
    sample_rate: u32,
}

impl MicStream for MockMicStream {
    fn label(&self) -> &str {
        "mock microphone"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn is_live(&self) -> bool {
        self.state.live.load(Ordering::Acquire)
    }

    fn connect(&mut self, sink: Arc<CaptureSink>) -> Result<Box<dyn CaptureNode>, EngineError> {
        if !self.is_live() {
            return Err(EngineError::Device("stream already stopped".into()));
        }
        *self.state.sink.lock().unwrap() = Some(sink);
        Ok(Box::new(MockNode {
            state: Arc::clone(&self.state),
        }))
    }

    fn stop(&mut self) {
        self.state.live.store(false, Ordering::Release);
        *self.state.sink.lock().unwrap() = None;
    }
}

struct MockNode {
    state: Arc<StreamState>,
}

impl CaptureNode for MockNode {
    fn disconnect(&mut self) {
        *self.state.sink.lock().unwrap() = None;
    }

    fn is_connected(&self) -> bool {
        self.state.sink.lock().unwrap().is_some()
    }
}
