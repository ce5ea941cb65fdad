//! Audio engine seam.
//!
//! The session never touches a platform API directly.  It talks to an
//! [`AudioBackend`], which constructs [`AudioContext`]s; a context hands out
//! microphone streams and plays buffers.
//!
//! ```text
//! ┌───────────────┐ create_context ┌────────────────┐ open_microphone ┌─────────────┐
//! │ AudioBackend  │───────────────▶│  AudioContext  │────────────────▶│  MicStream  │
//! │ (CpalBackend) │                │ status/resume  │                 │  connect()  │
//! └───────────────┘                │ suspend/close  │                 └──────┬──────┘
//!                                  │ play_buffer()  │                        │
//!                                  └────────────────┘                        ▼
//!                                                                     ┌─────────────┐
//!                                                   CaptureSink ◀─────│ CaptureNode │
//!                                                                     └─────────────┘
//! ```
//!
//! [`CpalBackend`] is the production implementation.  Unit tests use
//! `MockBackend`, a scripted backend that can grant or deny the microphone,
//! delay a grant, feed frames and finish playback on demand.

pub mod cpal_backend;
#[cfg(test)]
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::audio::{AudioBuffer, CaptureSink};
use crate::config::AudioConfig;

pub use cpal_backend::{CaptureError, CpalBackend, CpalContext};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Failures reported by an audio backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The platform refuses to start audio until a user gesture happens.
    #[error("a user gesture is required before audio can start")]
    GestureRequired,

    /// The user or the OS denied microphone access.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("no input device available")]
    NoDevice,

    /// Any other device or stream failure.
    #[error("audio device error: {0}")]
    Device(String),

    /// The context was closed before the call completed.
    #[error("audio context is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// ContextStatus
// ---------------------------------------------------------------------------

/// Lifecycle status reported by an [`AudioContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Running,
    /// Paused by the platform (no gesture yet, backgrounded) or by the host.
    Suspended,
    Closed,
}

impl ContextStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ContextStatus::Running => "running",
            ContextStatus::Suspended => "suspended",
            ContextStatus::Closed => "closed",
        }
    }
}

// ---------------------------------------------------------------------------
// MicConstraints
// ---------------------------------------------------------------------------

/// Processing constraints requested with every microphone stream.
///
/// Backends that cannot honour a flag log it and continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicConstraints {
    pub channel_count: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Preferred input device name, `None` for the system default.
    pub device: Option<String>,
}

impl Default for MicConstraints {
    fn default() -> Self {
        Self {
            channel_count: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            device: None,
        }
    }
}

impl From<&AudioConfig> for MicConstraints {
    fn from(cfg: &AudioConfig) -> Self {
        Self {
            channel_count: cfg.channels.max(1),
            echo_cancellation: cfg.echo_cancellation,
            noise_suppression: cfg.noise_suppression,
            auto_gain_control: cfg.auto_gain_control,
            device: cfg.input_device.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Invoked once by the engine when a buffer finishes playing naturally.
pub type PlaybackEnded = Box<dyn FnOnce() + Send + 'static>;

/// Factory for audio contexts.
pub trait AudioBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Construct a new context.
    ///
    /// Returns [`EngineError::GestureRequired`] when the platform blocks
    /// audio until the user interacts.
    fn create_context(&self) -> Result<Arc<dyn AudioContext>, EngineError>;
}

/// One shared playback-and-capture context.
#[async_trait]
pub trait AudioContext: Send + Sync {
    fn status(&self) -> ContextStatus;

    /// Rate every buffer played through this context is expected to use.
    fn sample_rate(&self) -> u32;

    async fn resume(&self) -> Result<(), EngineError>;

    fn suspend(&self) -> Result<(), EngineError>;

    /// Release every stream and node owned by the context.  Idempotent.
    fn close(&self);

    /// Request a microphone stream.  May wait on a permission prompt.
    async fn open_microphone(
        &self,
        constraints: &MicConstraints,
    ) -> Result<Box<dyn MicStream>, EngineError>;

    /// Start playing `buffer` to the default output; `on_ended` fires on
    /// natural completion only.
    fn play_buffer(
        &self,
        buffer: Arc<AudioBuffer>,
        on_ended: PlaybackEnded,
    ) -> Result<(), EngineError>;
}

/// A live, revocable microphone stream.
pub trait MicStream: Send + Sync {
    /// Device label for logging.
    fn label(&self) -> &str;

    /// Rate of the mono frames this stream delivers.
    fn sample_rate(&self) -> u32;

    fn is_live(&self) -> bool;

    /// Wire the stream through a processing node into `sink`.
    fn connect(&mut self, sink: Arc<CaptureSink>) -> Result<Box<dyn CaptureNode>, EngineError>;

    /// Stop all tracks.  Idempotent.
    fn stop(&mut self);
}

/// Processing node between a [`MicStream`] and a [`CaptureSink`].
pub trait CaptureNode: Send + Sync {
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

// Compile-time assertion: the traits must stay object-safe.
const _: fn() = || {
    fn _assert_object_safe(
        _: Box<dyn AudioBackend>,
        _: Arc<dyn AudioContext>,
        _: Box<dyn MicStream>,
        _: Box<dyn CaptureNode>,
    ) {
    }
};
