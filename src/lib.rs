//! Persistent audio session with push-to-talk capture, playback and
//! interruption recovery.
//!
//! * [`session`]: the session manager, its command runner and recovery.
//! * [`engine`]: the audio engine seam and the cpal implementation.
//! * [`audio`]: frame buffers, the fallback tone and resampling helpers.
//! * [`config`]: `settings.toml` persistence.
//! * [`hotkey`]: global key bindings for the host binary.

pub mod audio;
pub mod config;
pub mod engine;
pub mod hotkey;
pub mod session;
