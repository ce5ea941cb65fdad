//! Global hotkeys for the session entry points, backed by `rdev`.
//!
//! # Design
//!
//! `rdev::listen()` is a blocking OS-level call that never returns while the
//! process is alive.  It must run on a **dedicated OS thread**; it cannot be
//! used inside a tokio task.
//!
//! [`HotkeyListener::start`] spawns that thread.  Each key event is mapped
//! through [`HotkeyBindings::translate`] to a [`SessionCommand`] and sent to
//! the session runner.
//!
//! | Config key          | Press            | Release          |
//! |---------------------|------------------|------------------|
//! | `push_to_talk_key`  | `RecordPressed`  | `RecordReleased` |
//! | `play_key`          | `Play`           |                  |
//! | `reset_key`         | `Reset`          |                  |
//! | `unlock_key`        | `Unlock`         |                  |
//!
//! # Usage
//!
//! ```no_run
//! use tokio::sync::mpsc;
//! use audio_session::config::HotkeyConfig;
//! use audio_session::hotkey::{HotkeyBindings, HotkeyListener};
//!
//! let (tx, mut rx) = mpsc::channel(16);
//! let bindings = HotkeyBindings::from_config(&HotkeyConfig::default()).expect("bindings");
//! let _listener = HotkeyListener::start(bindings, tx).expect("listener thread");
//! ```

pub mod listener;

pub use listener::HotkeyListener;

use thiserror::Error;

use crate::config::HotkeyConfig;
use crate::session::SessionCommand;

// ---------------------------------------------------------------------------
// KeyAction
// ---------------------------------------------------------------------------

/// Direction of a key event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Press,
    Release,
}

// ---------------------------------------------------------------------------
// HotkeyBindings
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HotkeyError {
    #[error("unknown key name {name:?} for {binding}")]
    UnknownKey { binding: &'static str, name: String },
}

/// Resolved key for each session entry point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HotkeyBindings {
    pub record: rdev::Key,
    pub play: rdev::Key,
    pub reset: rdev::Key,
    pub unlock: rdev::Key,
}

impl HotkeyBindings {
    pub fn from_config(cfg: &HotkeyConfig) -> Result<Self, HotkeyError> {
        let resolve = |binding: &'static str, name: &str| {
            parse_key(name).ok_or_else(|| HotkeyError::UnknownKey {
                binding,
                name: name.to_string(),
            })
        };
        Ok(Self {
            record: resolve("push_to_talk_key", &cfg.push_to_talk_key)?,
            play: resolve("play_key", &cfg.play_key)?,
            reset: resolve("reset_key", &cfg.reset_key)?,
            unlock: resolve("unlock_key", &cfg.unlock_key)?,
        })
    }

    /// Map one key event to a session command, if it is bound.
    ///
    /// The record key wins when several entry points share a key.
    pub fn translate(&self, key: rdev::Key, action: KeyAction) -> Option<SessionCommand> {
        if key == self.record {
            return Some(match action {
                KeyAction::Press => SessionCommand::RecordPressed,
                KeyAction::Release => SessionCommand::RecordReleased,
            });
        }
        if action == KeyAction::Release {
            return None;
        }
        if key == self.play {
            Some(SessionCommand::Play)
        } else if key == self.reset {
            Some(SessionCommand::Reset)
        } else if key == self.unlock {
            Some(SessionCommand::Unlock)
        } else {
            None
        }
    }

    /// Whether `key` is bound to any entry point.
    pub fn is_bound(&self, key: rdev::Key) -> bool {
        [self.record, self.play, self.reset, self.unlock].contains(&key)
    }
}

// ---------------------------------------------------------------------------
// parse_key
// ---------------------------------------------------------------------------

/// Parse a hotkey name from a config string into an [`rdev::Key`].
///
/// Supports F1–F12, common named keys, and single ASCII letters.  Names are
/// matched case-insensitively.
///
/// # Examples
///
/// ```
/// use audio_session::hotkey::parse_key;
///
/// assert_eq!(parse_key("F9"),      Some(rdev::Key::F9));
/// assert_eq!(parse_key("escape"),  Some(rdev::Key::Escape));
/// assert_eq!(parse_key("a"),       Some(rdev::Key::KeyA));
/// assert_eq!(parse_key("xyz"),     None);
/// ```
pub fn parse_key(key_str: &str) -> Option<rdev::Key> {
    use rdev::Key;

    let name = key_str.trim().to_ascii_uppercase();
    let key = match name.as_str() {
        "F1" => Key::F1,
        "F2" => Key::F2,
        "F3" => Key::F3,
        "F4" => Key::F4,
        "F5" => Key::F5,
        "F6" => Key::F6,
        "F7" => Key::F7,
        "F8" => Key::F8,
        "F9" => Key::F9,
        "F10" => Key::F10,
        "F11" => Key::F11,
        "F12" => Key::F12,

        "ESCAPE" | "ESC" => Key::Escape,
        "SPACE" => Key::Space,
        "RETURN" | "ENTER" => Key::Return,
        "TAB" => Key::Tab,
        "BACKSPACE" => Key::Backspace,
        "DELETE" | "DEL" => Key::Delete,
        "HOME" => Key::Home,
        "END" => Key::End,
        "PAGEUP" => Key::PageUp,
        "PAGEDOWN" => Key::PageDown,
        "UPARROW" | "UP" => Key::UpArrow,
        "DOWNARROW" | "DOWN" => Key::DownArrow,
        "LEFTARROW" | "LEFT" => Key::LeftArrow,
        "RIGHTARROW" | "RIGHT" => Key::RightArrow,
        "CAPSLOCK" => Key::CapsLock,
        "SCROLLLOCK" => Key::ScrollLock,
        "PRINTSCREEN" => Key::PrintScreen,
        "PAUSE" => Key::Pause,

        "A" => Key::KeyA,
        "B" => Key::KeyB,
        "C" => Key::KeyC,
        "D" => Key::KeyD,
        "E" => Key::KeyE,
        "F" => Key::KeyF,
        "G" => Key::KeyG,
        "H" => Key::KeyH,
        "I" => Key::KeyI,
        "J" => Key::KeyJ,
        "K" => Key::KeyK,
        "L" => Key::KeyL,
        "M" => Key::KeyM,
        "N" => Key::KeyN,
        "O" => Key::KeyO,
        "P" => Key::KeyP,
        "Q" => Key::KeyQ,
        "R" => Key::KeyR,
        "S" => Key::KeyS,
        "T" => Key::KeyT,
        "U" => Key::KeyU,
        "V" => Key::KeyV,
        "W" => Key::KeyW,
        "X" => Key::KeyX,
        "Y" => Key::KeyY,
        "Z" => Key::KeyZ,

        _ => return None,
    };
    Some(key)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
