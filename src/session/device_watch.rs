//! Default-input-device polling.
//!
//! cpal has no hot-plug notification, so [`DeviceWatcher`] polls the name of
//! the default input device on a dedicated OS thread and sends
//! `Signal(DeviceChanged)` to the runner whenever it differs from the
//! previous poll.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait};
use tokio::sync::mpsc;

use super::recovery::LifecycleSignal;
use super::runner::SessionCommand;

/// Change detector over successive device observations.
///
/// The first observation only establishes the baseline.
#[derive(Debug, Default)]
pub struct DeviceTracker {
    last: Option<Option<String>>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `current`; returns `true` if it differs from the previous one.
    pub fn observe(&mut self, current: Option<String>) -> bool {
        let changed = matches!(&self.last, Some(prev) if *prev != current);
        self.last = Some(current);
        changed
    }
}

/// Handle to the polling thread.  Dropping it stops the thread after its
/// current sleep.
pub struct DeviceWatcher {
    stop: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

impl DeviceWatcher {
    pub fn start(poll: Duration, tx: mpsc::Sender<SessionCommand>) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let poll = poll.max(Duration::from_millis(50));

        let thread = std::thread::Builder::new()
            .name("device-watch".into())
            .spawn(move || {
                let host = cpal::default_host();
                let mut tracker = DeviceTracker::new();
                while !stop_clone.load(Ordering::Relaxed) {
                    let current = host.default_input_device().and_then(|d| d.name().ok());
                    if tracker.observe(current.clone()) {
                        log::info!(
                            "device-watch: default input is now {}",
                            current.as_deref().unwrap_or("<none>")
                        );
                        let cmd = SessionCommand::Signal(LifecycleSignal::DeviceChanged);
                        if tx.blocking_send(cmd).is_err() {
                            break;
                        }
                    }
                    std::thread::sleep(poll);
                }
                log::debug!("device-watch: stopped");
            })?;

        Ok(Self {
            stop,
            _thread: thread,
        })
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
