//! Command runner: the single actor that feeds the session.
//!
//! [`SessionRunner`] receives [`SessionCommand`]s over a `tokio::sync::mpsc`
//! channel from the hotkey thread, the device watcher and the host.
//!
//! ```text
//! RecordPressed
//!   └─▶ press_record()            sync: registers the microphone request
//!         └─▶ complete_capture()  spawned: awaits the grant
//! RecordReleased
//!   └─▶ record_released()         sync: cancels or stops, in command order
//! Signal(DeviceChanged)
//!   └─▶ handle_signal()           sync: tears down the old stream
//!         └─▶ reacquire()         spawned: opens the new one
//! ```
//!
//! Synchronous halves run inline so commands take effect in the order they
//! arrive even when a permission prompt is still open.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};

use super::capture::{CaptureRequest, StopOutcome};
use super::manager::{AudioSessionManager, SessionError};
use super::recovery::{LifecycleSignal, ReacquireRequest};

/// One consumer or platform request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCommand {
    Unlock,
    StartCapture,
    StopCapture,
    RecordPressed,
    RecordReleased,
    Play,
    Reset,
    Signal(LifecycleSignal),
}

impl FromStr for SessionCommand {
    type Err = String;

    /// Parse a console command such as `play` or `device-changed`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cmd = match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "unlock" => SessionCommand::Unlock,
            "start" | "start_capture" => SessionCommand::StartCapture,
            "stop" | "stop_capture" => SessionCommand::StopCapture,
            "press" => SessionCommand::RecordPressed,
            "release" => SessionCommand::RecordReleased,
            "play" => SessionCommand::Play,
            "reset" => SessionCommand::Reset,
            "visible" => SessionCommand::Signal(LifecycleSignal::Visible),
            "hidden" => SessionCommand::Signal(LifecycleSignal::Hidden),
            "restored" => SessionCommand::Signal(LifecycleSignal::Restored),
            "device_changed" => SessionCommand::Signal(LifecycleSignal::DeviceChanged),
            other => return Err(format!("unknown command {other:?}")),
        };
        Ok(cmd)
    }
}

/// Drives an [`AudioSessionManager`] from a command channel.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use audio_session::config::AppConfig;
/// use audio_session::engine::CpalBackend;
/// use audio_session::session::{AudioSessionManager, SessionCommand, SessionRunner};
///
/// # async fn example() {
/// let manager = Arc::new(AudioSessionManager::new(
///     Arc::new(CpalBackend::new()),
///     &AppConfig::default(),
/// ));
/// let (tx, rx) = tokio::sync::mpsc::channel(32);
/// tokio::spawn(SessionRunner::new(manager).run(rx));
/// tx.send(SessionCommand::Unlock).await.ok();
/// # }
/// ```
pub struct SessionRunner {
    manager: Arc<AudioSessionManager>,
    tasks: JoinSet<()>,
}

impl SessionRunner {
    pub fn new(manager: Arc<AudioSessionManager>) -> Self {
        Self {
            manager,
            tasks: JoinSet::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Main async loop
    // -----------------------------------------------------------------------

    /// Run until `rx` is closed, then wait for in-flight microphone requests.
    pub async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.dispatch_blocking(cmd),
                    None => break,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("session: background task failed: {e}");
                    }
                }
            }
        }

        log::info!("session: command channel closed, runner shutting down");
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                log::error!("session: background task failed: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Commands can block briefly inside the engine (opening the output
    /// device, handing a buffer to the playback thread).  On a multi-thread
    /// runtime the worker hands its other tasks off for that time.
    fn dispatch_blocking(&mut self, cmd: SessionCommand) {
        match Handle::current().runtime_flavor() {
            RuntimeFlavor::MultiThread => task::block_in_place(|| self.dispatch(cmd)),
            _ => self.dispatch(cmd),
        }
    }

    fn dispatch(&mut self, cmd: SessionCommand) {
        log::debug!("session: command {cmd:?}");
        match cmd {
            SessionCommand::Unlock => report("unlock", self.manager.unlock()),
            SessionCommand::StartCapture => match self.manager.request_capture() {
                Ok(req) => self.spawn_capture(req),
                Err(e) => report_err("start_capture", &e),
            },
            SessionCommand::StopCapture => log_stop(self.manager.stop_capture()),
            SessionCommand::RecordPressed => match self.manager.press_record() {
                Ok(Some(req)) => self.spawn_capture(req),
                Ok(None) => {}
                Err(e) => report_err("record_pressed", &e),
            },
            SessionCommand::RecordReleased => log_stop(self.manager.record_released()),
            SessionCommand::Play => report("play", self.manager.play()),
            SessionCommand::Reset => report("reset", self.manager.reset()),
            SessionCommand::Signal(signal) => {
                if let Some(req) = self.manager.handle_signal(signal) {
                    self.spawn_reacquire(req);
                }
            }
        }

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("session: snapshot {}", self.manager.snapshot().to_json());
        }
    }

    fn spawn_capture(&mut self, req: CaptureRequest) {
        let manager = Arc::clone(&self.manager);
        self.tasks.spawn(async move {
            report("start_capture", manager.complete_capture(req).await);
        });
    }

    fn spawn_reacquire(&mut self, req: ReacquireRequest) {
        let manager = Arc::clone(&self.manager);
        self.tasks.spawn(async move {
            report("reacquire", manager.reacquire(req).await);
        });
    }
}

fn report(op: &str, result: Result<(), SessionError>) {
    if let Err(e) = result {
        report_err(op, &e);
    }
}

fn report_err(op: &str, e: &SessionError) {
    match e {
        SessionError::Superseded => log::debug!("session: {op}: {e}"),
        _ => log::warn!("session: {op}: {e}"),
    }
}

fn log_stop(outcome: StopOutcome) {
    match outcome {
        StopOutcome::NotListening => {}
        StopOutcome::Recorded {
            samples,
            fallback,
            held,
            ..
        } => log::debug!(
            "session: stop after {} ms, {samples} samples{}",
            held.as_millis(),
            if fallback { " (fallback tone)" } else { "" }
        ),
        StopOutcome::Discarded { held } => {
            log::debug!("session: stop after {} ms, discarded", held.as_millis())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
