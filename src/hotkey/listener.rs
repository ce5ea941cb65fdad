//! Dedicated OS-thread hotkey listener using `rdev::listen`.
//!
//! `rdev::listen` is a blocking call that must live on its own OS thread.
//! [`HotkeyListener`] owns that thread and a stop flag; dropping it sets the
//! flag so the callback silently ignores further events.
//!
//! # Shutdown caveat
//!
//! `rdev::listen` has **no graceful shutdown API**.  Setting the stop flag
//! prevents events from being forwarded, but the OS thread itself will remain
//! blocked in the rdev event loop until the process exits.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::mpsc;

use super::{HotkeyBindings, KeyAction};
use crate::session::SessionCommand;

// ---------------------------------------------------------------------------
// KeyDebounce
// ---------------------------------------------------------------------------

/// Drops OS auto-repeat: a press is forwarded only if the key was up.
#[derive(Debug, Default)]
struct KeyDebounce {
    held: Vec<rdev::Key>,
}

impl KeyDebounce {
    /// Returns the action to forward, or `None` for a repeat.
    fn filter(&mut self, key: rdev::Key, action: KeyAction) -> Option<KeyAction> {
        let pos = self.held.iter().position(|k| *k == key);
        match (action, pos) {
            (KeyAction::Press, Some(_)) => None,
            (KeyAction::Press, None) => {
                self.held.push(key);
                Some(action)
            }
            (KeyAction::Release, Some(i)) => {
                self.held.swap_remove(i);
                Some(action)
            }
            // Release without a press we saw (started while held).
            (KeyAction::Release, None) => Some(action),
        }
    }
}

// ---------------------------------------------------------------------------
// HotkeyListener
// ---------------------------------------------------------------------------

/// Handle to a running hotkey listener thread.
///
/// The underlying OS thread will continue to exist until the process exits
/// because `rdev::listen` cannot be interrupted, but it will silently discard
/// all events once the stop flag is set.
pub struct HotkeyListener {
    stop: Arc<AtomicBool>,
    /// Never joined; `rdev::listen` does not return.
    _thread: std::thread::JoinHandle<()>,
}

impl HotkeyListener {
    /// Spawn the listener thread.  Bound key events are sent on `tx` with
    /// `blocking_send`, so `tx` may feed an async runner.
    pub fn start(
        bindings: HotkeyBindings,
        tx: mpsc::Sender<SessionCommand>,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("hotkey-listener".into())
            .spawn(move || {
                let mut debounce = KeyDebounce::default();
                let result = rdev::listen(move |event| {
                    if stop_clone.load(Ordering::Relaxed) {
                        return;
                    }
                    let (key, action) = match event.event_type {
                        rdev::EventType::KeyPress(k) => (k, KeyAction::Press),
                        rdev::EventType::KeyRelease(k) => (k, KeyAction::Release),
                        _ => return,
                    };
                    if !bindings.is_bound(key) {
                        return;
                    }
                    let Some(action) = debounce.filter(key, action) else {
                        return;
                    };
                    if let Some(cmd) = bindings.translate(key, action) {
                        if tx.blocking_send(cmd).is_err() {
                            log::debug!("hotkey-listener: runner gone, dropping {cmd:?}");
                        }
                    }
                });

                if let Err(e) = result {
                    log::error!("hotkey-listener: rdev::listen exited with error: {:?}", e);
                }
            })?;

        Ok(Self {
            stop,
            _thread: thread,
        })
    }
}

impl Drop for HotkeyListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
