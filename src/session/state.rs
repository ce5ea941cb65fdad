//! Session state machine values and the read-only snapshot.
//!
//! ```text
//!            start_capture ok
//!   Idle ─────────────────────▶ Listening
//!    ▲  ◀───────────────────────    │
//!    │   stop_capture / reset /     │ play()
//!    │   failed re-acquisition      ▼
//!    │ ◀──────────────────────── Playing ◀── play() from Idle
//!        playback ended / reset
//! ```
//!
//! `start_capture` while `Playing` is rejected.

use serde::Serialize;

/// The session's single state value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    /// Microphone stream and capture node are live; frames accumulate.
    Listening,
    /// A buffer is playing; ends on natural completion or reset.
    Playing,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Playing => "playing",
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle
    }
}

/// What the consumer should offer the user after a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Affordance {
    /// Audio needs a gesture-bearing `unlock()` first.
    Unlock,
    /// Microphone access failed; pressing record again retries.
    RetryMicrophone,
}

/// Point-in-time, serialisable view of the session for presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub context_id: u64,
    /// `"none"`, `"running"`, `"suspended"` or `"closed"`.
    pub context_status: String,
    pub capture_pending: bool,
    pub buffer_secs: Option<f32>,
    pub affordance: Option<Affordance>,
    /// Event log display strings, newest first.
    pub events: Vec<String>,
}

impl SessionSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}
