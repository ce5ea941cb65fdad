//! Native audio engine built on `cpal`.
//!
//! `cpal::Stream` is not `Send`, so each [`CpalContext`] owns a dedicated
//! engine thread that holds every stream it creates.  The context and the
//! stream handles it returns are thin, `Send + Sync` proxies that talk to the
//! thread over an mpsc channel:
//!
//! ```text
//!   CpalContext ──Command──▶ audio-context-N thread
//!   CpalMicStream ─────────▶   ├─ inputs:    HashMap<id, cpal::Stream>
//!                              ├─ playbacks: Vec<ActivePlayback>
//!                              └─ reaps finished playbacks every 20 ms
//!                                 and fires their `on_ended` callbacks
//! ```
//!
//! Input callbacks downmix to mono and hand the frame to whatever
//! [`CaptureSink`] is currently plugged into the stream's slot.  The slot is
//! the "processing node": connecting fills it, disconnecting empties it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tokio::sync::oneshot;

use super::{
    AudioBackend, AudioContext, CaptureNode, ContextStatus, EngineError, MicConstraints, MicStream,
    PlaybackEnded,
};
use crate::audio::{downmix_into, AudioBuffer, CaptureSink};

/// How often the engine thread checks for finished playbacks.
const REAP_INTERVAL: Duration = Duration::from_millis(20);

/// Upper bound on waiting for the engine thread to answer a sync command.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

type SinkSlot = Arc<Mutex<Option<Arc<CaptureSink>>>>;

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

/// Errors that can occur while setting up cpal devices and streams.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no input device found on the default audio host")]
    NoDevice,

    #[error("no output device found on the default audio host")]
    NoOutputDevice,

    #[error("failed to enumerate devices: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("failed to query default stream config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("failed to pause audio stream: {0}")]
    PauseStream(#[from] cpal::PauseStreamError),
}

impl From<CaptureError> for EngineError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::NoDevice
            | CaptureError::BuildStream(cpal::BuildStreamError::DeviceNotAvailable) => {
                EngineError::NoDevice
            }
            other => EngineError::Device(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// CpalBackend
// ---------------------------------------------------------------------------

/// [`AudioBackend`] for the default cpal host.
#[derive(Debug, Default)]
pub struct CpalBackend {
    contexts: AtomicU64,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn create_context(&self) -> Result<Arc<dyn AudioContext>, EngineError> {
        let n = self.contexts.fetch_add(1, Ordering::Relaxed) + 1;
        let ctx = CpalContext::spawn(n)?;
        Ok(Arc::new(ctx))
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

enum Command {
    OpenInput {
        id: u64,
        constraints: MicConstraints,
        slot: SinkSlot,
        reply: oneshot::Sender<Result<InputInfo, EngineError>>,
    },
    StopInput {
        id: u64,
    },
    Play {
        buffer: Arc<AudioBuffer>,
        on_ended: PlaybackEnded,
        reply: mpsc::SyncSender<Result<(), EngineError>>,
    },
    Suspend {
        reply: mpsc::SyncSender<Result<(), EngineError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Close,
}

struct InputInfo {
    sample_rate: u32,
    label: String,
}

// ---------------------------------------------------------------------------
// CpalContext
// ---------------------------------------------------------------------------

/// Proxy to one engine thread.  Dropping it closes the context.
pub struct CpalContext {
    tx: mpsc::Sender<Command>,
    status: Arc<Mutex<ContextStatus>>,
    sample_rate: u32,
    next_stream_id: AtomicU64,
}

impl CpalContext {
    /// Start the engine thread and wait for it to open the default output.
    fn spawn(n: u64) -> Result<Self, EngineError> {
        let (tx, rx) = mpsc::channel::<Command>();
        let (init_tx, init_rx) = mpsc::sync_channel::<Result<u32, EngineError>>(1);
        let status = Arc::new(Mutex::new(ContextStatus::Running));
        let thread_status = Arc::clone(&status);

        std::thread::Builder::new()
            .name(format!("audio-context-{n}"))
            .spawn(move || match EngineThread::open(thread_status) {
                Ok(engine) => {
                    let _ = init_tx.send(Ok(engine.sample_rate));
                    engine.run(rx);
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e.into()));
                }
            })
            .map_err(|e| EngineError::Device(format!("failed to spawn engine thread: {e}")))?;

        let sample_rate = init_rx
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| EngineError::Device("engine thread did not start".into()))??;

        log::info!("cpal: audio context {n} running at {sample_rate} Hz");
        Ok(Self {
            tx,
            status,
            sample_rate,
            next_stream_id: AtomicU64::new(1),
        })
    }

    fn send(&self, cmd: Command) -> Result<(), EngineError> {
        self.tx.send(cmd).map_err(|_| EngineError::Closed)
    }

    fn set_status(&self, status: ContextStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

#[async_trait]
impl AudioContext for CpalContext {
    fn status(&self) -> ContextStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn resume(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Resume { reply })?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    fn suspend(&self) -> Result<(), EngineError> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.send(Command::Suspend { reply })?;
        rx.recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| EngineError::Closed)?
    }

    fn close(&self) {
        if self.status() == ContextStatus::Closed {
            return;
        }
        self.set_status(ContextStatus::Closed);
        let _ = self.send(Command::Close);
    }

    async fn open_microphone(
        &self,
        constraints: &MicConstraints,
    ) -> Result<Box<dyn MicStream>, EngineError> {
        if self.status() == ContextStatus::Closed {
            return Err(EngineError::Closed);
        }
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let slot: SinkSlot = Arc::new(Mutex::new(None));
        let (reply, rx) = oneshot::channel();
        self.send(Command::OpenInput {
            id,
            constraints: constraints.clone(),
            slot: Arc::clone(&slot),
            reply,
        })?;

        let info = rx.await.map_err(|_| EngineError::Closed)??;
        Ok(Box::new(CpalMicStream {
            id,
            tx: self.tx.clone(),
            slot,
            label: info.label,
            sample_rate: info.sample_rate,
            live: true,
        }))
    }

    fn play_buffer(
        &self,
        buffer: Arc<AudioBuffer>,
        on_ended: PlaybackEnded,
    ) -> Result<(), EngineError> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.send(Command::Play {
            buffer,
            on_ended,
            reply,
        })?;
        rx.recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| EngineError::Closed)?
    }
}

impl Drop for CpalContext {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// CpalMicStream / CpalCaptureNode
// ---------------------------------------------------------------------------

/// Handle to an input stream living on the engine thread.
///
/// Dropping the handle stops the stream.
struct CpalMicStream {
    id: u64,
    tx: mpsc::Sender<Command>,
    slot: SinkSlot,
    label: String,
    sample_rate: u32,
    live: bool,
}

impl MicStream for CpalMicStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn connect(&mut self, sink: Arc<CaptureSink>) -> Result<Box<dyn CaptureNode>, EngineError> {
        if !self.live {
            return Err(EngineError::Device("stream already stopped".into()));
        }
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        Ok(Box::new(CpalCaptureNode {
            slot: Arc::clone(&self.slot),
        }))
    }

    fn stop(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        // The engine thread may already be gone after close.
        let _ = self.tx.send(Command::StopInput { id: self.id });
    }
}

impl Drop for CpalMicStream {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CpalCaptureNode {
    slot: SinkSlot,
}

impl CaptureNode for CpalCaptureNode {
    fn disconnect(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn is_connected(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

// ---------------------------------------------------------------------------
// EngineThread
// ---------------------------------------------------------------------------

struct ActivePlayback {
    stream: cpal::Stream,
    done: Arc<AtomicBool>,
    on_ended: PlaybackEnded,
}

/// State owned by the engine thread; never leaves it.
struct EngineThread {
    host: cpal::Host,
    output: cpal::Device,
    output_config: cpal::StreamConfig,
    sample_rate: u32,
    status: Arc<Mutex<ContextStatus>>,
    inputs: HashMap<u64, cpal::Stream>,
    playbacks: Vec<ActivePlayback>,
}

impl EngineThread {
    fn open(status: Arc<Mutex<ContextStatus>>) -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let output = host
            .default_output_device()
            .ok_or(CaptureError::NoOutputDevice)?;
        let supported = output.default_output_config()?;
        let sample_rate = supported.sample_rate().0;
        let output_config: cpal::StreamConfig = supported.into();

        Ok(Self {
            host,
            output,
            output_config,
            sample_rate,
            status,
            inputs: HashMap::new(),
            playbacks: Vec::new(),
        })
    }

    fn run(mut self, rx: mpsc::Receiver<Command>) {
        loop {
            match rx.recv_timeout(REAP_INTERVAL) {
                Ok(Command::Close) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(cmd) => self.handle(cmd),
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.reap_finished();
        }
        self.shutdown();
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::OpenInput {
                id,
                constraints,
                slot,
                reply,
            } => {
                let result = self.open_input(id, &constraints, slot).map_err(EngineError::from);
                if let Err(e) = &result {
                    log::warn!("cpal: microphone open failed: {e}");
                }
                // Requester may have given up; the stream handle is then never
                // created, so release the stream here.
                if reply.send(result).is_err() {
                    self.inputs.remove(&id);
                }
            }
            Command::StopInput { id } => {
                if self.inputs.remove(&id).is_some() {
                    log::debug!("cpal: input stream {id} stopped");
                }
            }
            Command::Play {
                buffer,
                on_ended,
                reply,
            } => {
                let result = self.play(buffer, on_ended).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            Command::Suspend { reply } => {
                let _ = reply.send(self.suspend().map_err(EngineError::from));
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.resume().map_err(EngineError::from));
            }
            Command::Close => {}
        }
    }

    fn is_running(&self) -> bool {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) == ContextStatus::Running
    }

    fn find_input_device(&self, name: Option<&str>) -> Result<cpal::Device, CaptureError> {
        if let Some(wanted) = name {
            let found = self
                .host
                .input_devices()?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false));
            if let Some(device) = found {
                return Ok(device);
            }
            log::warn!("cpal: input device {wanted:?} not found, using default");
        }
        self.host
            .default_input_device()
            .ok_or(CaptureError::NoDevice)
    }

    fn open_input(
        &mut self,
        id: u64,
        constraints: &MicConstraints,
        slot: SinkSlot,
    ) -> Result<InputInfo, CaptureError> {
        let device = self.find_input_device(constraints.device.as_deref())?;
        let label = device.name().unwrap_or_else(|_| "unknown input".into());
        let supported = device.default_input_config()?;
        let channels = supported.channels();
        let sample_rate = supported.sample_rate().0;
        let config: cpal::StreamConfig = supported.into();

        if constraints.echo_cancellation
            || constraints.noise_suppression
            || constraints.auto_gain_control
        {
            log::debug!("cpal: echo cancellation / noise suppression / AGC are left to the OS");
        }

        let mut scratch: Vec<f32> = Vec::with_capacity(4096);
        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Never block the audio thread; a frame racing a reconnect is
                // simply skipped.
                let Ok(guard) = slot.try_lock() else {
                    return;
                };
                let Some(sink) = guard.as_ref() else {
                    return;
                };
                if channels == 1 {
                    sink.push(data);
                } else {
                    downmix_into(data, channels, &mut scratch);
                    sink.push(&scratch);
                }
            },
            |err: cpal::StreamError| {
                log::error!("cpal input stream error: {err}");
            },
            None,
        )?;

        if self.is_running() {
            stream.play()?;
        }
        self.inputs.insert(id, stream);
        log::debug!("cpal: input stream {id} open on {label:?} ({channels} ch @ {sample_rate} Hz)");

        Ok(InputInfo { sample_rate, label })
    }

    fn play(&mut self, buffer: Arc<AudioBuffer>, on_ended: PlaybackEnded) -> Result<(), CaptureError> {
        let channels = (self.output_config.channels as usize).max(1);
        let done = Arc::new(AtomicBool::new(false));
        let done_cb = Arc::clone(&done);
        let mut pos = 0usize;

        if buffer.sample_rate() != self.sample_rate {
            log::warn!(
                "cpal: buffer at {} Hz played on a {} Hz context",
                buffer.sample_rate(),
                self.sample_rate
            );
        }

        let stream = self.output.build_output_stream(
            &self.output_config,
            move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let samples = buffer.samples();
                for frame in out.chunks_mut(channels) {
                    match samples.get(pos) {
                        Some(&s) => {
                            frame.fill(s);
                            pos += 1;
                        }
                        None => {
                            frame.fill(0.0);
                            done_cb.store(true, Ordering::Release);
                        }
                    }
                }
            },
            |err: cpal::StreamError| {
                log::error!("cpal output stream error: {err}");
            },
            None,
        )?;

        if self.is_running() {
            stream.play()?;
        }
        self.playbacks.push(ActivePlayback {
            stream,
            done,
            on_ended,
        });
        Ok(())
    }

    fn suspend(&mut self) -> Result<(), CaptureError> {
        for stream in self.inputs.values() {
            stream.pause()?;
        }
        for playback in &self.playbacks {
            playback.stream.pause()?;
        }
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = ContextStatus::Suspended;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), CaptureError> {
        for stream in self.inputs.values() {
            stream.play()?;
        }
        for playback in &self.playbacks {
            playback.stream.play()?;
        }
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = ContextStatus::Running;
        Ok(())
    }

    fn reap_finished(&mut self) {
        if self.playbacks.is_empty() {
            return;
        }
        let (finished, active): (Vec<_>, Vec<_>) = self
            .playbacks
            .drain(..)
            .partition(|p| p.done.load(Ordering::Acquire));
        self.playbacks = active;

        for playback in finished {
            let ActivePlayback {
                stream, on_ended, ..
            } = playback;
            drop(stream);
            on_ended();
        }
    }

    fn shutdown(&mut self) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = ContextStatus::Closed;
        // Pending playbacks are dropped without firing `on_ended`.
        self.playbacks.clear();
        self.inputs.clear();
        log::debug!("cpal: engine thread exiting");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
