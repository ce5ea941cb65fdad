//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// UnlockPolicy
// ---------------------------------------------------------------------------

/// How the session satisfies the platform's user-gesture requirement.
///
/// | Variant  | Behaviour                                                  |
/// |----------|------------------------------------------------------------|
/// | Explicit | `unlock()` must run before any capture or playback         |
/// | Implicit | capture / play create the context lazily on first use      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnlockPolicy {
    Explicit,
    Implicit,
}

impl Default for UnlockPolicy {
    fn default() -> Self {
        Self::Explicit
    }
}

// ---------------------------------------------------------------------------
// CaptureMode
// ---------------------------------------------------------------------------

/// Interaction model for the record control, which also decides what
/// `stop_capture` does with the frames.
///
/// | Variant | Record control          | On stop                                  |
/// |---------|-------------------------|------------------------------------------|
/// | Toggle  | press starts / stops    | always saves (fallback tone if empty)    |
/// | Hold    | press starts, release stops | discards takes ≤ `min_hold_ms`       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    Toggle,
    Hold,
}

impl Default for CaptureMode {
    fn default() -> Self {
        Self::Hold
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Behaviour of the audio session state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub unlock_policy: UnlockPolicy,
    pub capture_mode: CaptureMode,
    /// Hold mode only: takes this short or shorter are treated as accidental
    /// taps and discarded.
    pub min_hold_ms: u64,
    /// Number of entries kept in the observable event log.
    pub event_log_capacity: usize,
    /// Length of the synthetic fallback tone.
    pub fallback_tone_secs: f32,
    /// Suspend the context when the host reports it went to the background.
    pub suspend_when_hidden: bool,
}

impl SessionConfig {
    pub fn min_hold(&self) -> Duration {
        Duration::from_millis(self.min_hold_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            unlock_policy: UnlockPolicy::default(),
            capture_mode: CaptureMode::default(),
            min_hold_ms: 300,
            event_log_capacity: 10,
            fallback_tone_secs: 0.4,
            suspend_when_hidden: false,
        }
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Microphone constraints and capture limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Requested channel count; recordings are always stored mono.
    pub channels: u16,
    /// Audio input device name, `None` for the system default.
    pub input_device: Option<String>,
    /// Frames beyond this length are dropped.
    pub max_recording_secs: f32,
    /// How often the device watcher polls for a changed default input.
    pub device_poll_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            channels: 1,
            input_device: None,
            max_recording_secs: 120.0,
            device_poll_ms: 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// HotkeyConfig
// ---------------------------------------------------------------------------

/// Global hotkey bindings for the host binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotkeyConfig {
    /// Record control (toggle or hold, per `session.capture_mode`).
    pub push_to_talk_key: String,
    pub play_key: String,
    pub reset_key: String,
    pub unlock_key: String,
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            push_to_talk_key: "F9".into(),
            play_key: "F10".into(),
            reset_key: "F12".into(),
            unlock_key: "F8".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use audio_session::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub hotkey: HotkeyConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns `true` when no `settings.toml` file exists yet.
    pub fn is_first_run() -> bool {
        !AppPaths::new().settings_file.exists()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
