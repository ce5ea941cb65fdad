//! The audio session: one shared context, push-to-talk capture, playback and
//! recovery.
//!
//! # Layout
//!
//! ```text
//!  hotkeys ─┐
//!  host ────┼─▶ SessionRunner ──▶ AudioSessionManager ──▶ engine::AudioContext
//!  devices ─┘    (mpsc actor)      (SessionInner + lock)
//! ```
//!
//! * [`manager`]: the session record, context lifecycle, reset, observers.
//! * [`capture`]: microphone acquisition and the stop policy.
//! * [`playback`]: playing the last buffer or the fallback tone.
//! * [`recovery`]: lifecycle signals and device-change re-acquisition.
//! * [`runner`]: the command actor.
//! * [`device_watch`]: default-input polling.
//! * [`events`] / [`state`]: the event log and state values.

pub mod capture;
pub mod device_watch;
pub mod events;
pub mod manager;
pub mod playback;
pub mod recovery;
pub mod runner;
pub mod state;

pub use capture::{CaptureRequest, StopOutcome};
pub use device_watch::{DeviceTracker, DeviceWatcher};
pub use events::{EventEntry, EventLog};
pub use manager::{AudioSessionManager, SessionError};
pub use recovery::{LifecycleSignal, ReacquireRequest};
pub use runner::{SessionCommand, SessionRunner};
pub use state::{Affordance, SessionSnapshot, SessionState};
