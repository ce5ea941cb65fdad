//! Sample-level building blocks for the session.
//!
//! # Data flow
//!
//! ```text
//! engine input callback → downmix_to_mono → CaptureSink (armed?) → FrameBuffer
//!                                                    │
//!                              stop_capture ─────────┘
//!                                   │
//!        resample_linear per segment (mic rate ≠ context rate)
//!                                   │
//!                                   ▼
//!                           AudioBuffer ──▶ playback
//!
//!               fallback_tone ──▶ AudioBuffer (nothing recorded)
//! ```

pub mod buffer;
pub mod capture;
pub mod resample;
pub mod tone;

pub use buffer::{AudioBuffer, FrameBuffer};
pub use capture::{CaptureSink, CapturedAudio, CapturedSegment};
pub use resample::{downmix_into, downmix_to_mono, resample_linear};
pub use tone::{fallback_tone, tone_sample, FALLBACK_TONE_SECS};
