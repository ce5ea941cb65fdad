//! Playback of the last buffer, or the fallback tone when there is none.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::audio::fallback_tone;
use crate::engine::PlaybackEnded;

use super::manager::{AudioSessionManager, SessionError, SessionInner};
use super::state::SessionState;

impl AudioSessionManager {
    /// Start playing `last_buffer` (or the fallback tone).
    ///
    /// A running capture is stopped first.  Returns once the engine accepted
    /// the buffer; the session goes back to idle when the engine reports
    /// natural completion.
    pub fn play(&self) -> Result<(), SessionError> {
        self.prepare_context()?;
        let (ctx, buffer, token) = {
            let mut inner = self.lock();
            if inner.state == SessionState::Playing {
                inner.log("play_rejected_busy");
                return Err(SessionError::AlreadyPlaying);
            }
            let ctx = self.context_for_use(&mut inner)?;
            self.stop_capture_locked(&mut inner);

            let buffer = match &inner.last_buffer {
                Some(buffer) => Arc::clone(buffer),
                None => Arc::new(fallback_tone(
                    ctx.sample_rate(),
                    self.config.fallback_tone_secs,
                )),
            };
            inner.playback_token += 1;
            inner.state = SessionState::Playing;
            inner.log("play_start");
            (ctx, buffer, inner.playback_token)
        };

        // The engine may call `on_ended` before `play_buffer` returns, so the
        // lock must not be held here.
        self.spawn_resume(&ctx);
        let on_ended = playback_ended(Arc::downgrade(&self.inner), token);
        if let Err(e) = ctx.play_buffer(buffer, on_ended) {
            log::warn!("session: playback failed to start: {e}");
            let mut inner = self.lock();
            if inner.playback_token == token && inner.state == SessionState::Playing {
                inner.state = SessionState::Idle;
            }
            inner.log("play_failed");
            return Err(e.into());
        }
        Ok(())
    }
}

fn playback_ended(inner: Weak<Mutex<SessionInner>>, token: u64) -> PlaybackEnded {
    Box::new(move || {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.playback_token != token || inner.state != SessionState::Playing {
            log::debug!("session: ignoring completion of superseded playback");
            return;
        }
        inner.state = SessionState::Idle;
        inner.log("play_end");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
