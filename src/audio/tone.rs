//! Deterministic fallback tone.
//!
//! Used whenever playback has nothing real to play: an empty capture in
//! toggle mode, or `play()` before anything was recorded.  Both paths call
//! [`fallback_tone`] so the waveform is identical and reproducible.

use std::f32::consts::PI;

use super::AudioBuffer;

/// Default tone length in seconds.
pub const FALLBACK_TONE_SECS: f32 = 0.4;

/// Samples per half period of the fallback waveform.
const HALF_PERIOD: f32 = 20.0;

/// Synthesize the fallback tone at `sample_rate` lasting `secs` seconds.
///
/// Sample `i` is `sin((i / 20) · π)`; the length is
/// `floor(sample_rate × secs)`.
///
/// ```rust
/// use audio_session::audio::{fallback_tone, FALLBACK_TONE_SECS};
///
/// let tone = fallback_tone(48_000, FALLBACK_TONE_SECS);
/// assert_eq!(tone.len(), 19_200);
/// assert_eq!(tone.samples()[0], 0.0);
/// ```
pub fn fallback_tone(sample_rate: u32, secs: f32) -> AudioBuffer {
    let len = tone_len(sample_rate, secs);
    let samples = (0..len).map(tone_sample).collect();
    AudioBuffer::new(samples, sample_rate)
}

/// Value of the fallback waveform at frame index `i`.
pub fn tone_sample(i: usize) -> f32 {
    ((i as f32 / HALF_PERIOD) * PI).sin()
}

fn tone_len(sample_rate: u32, secs: f32) -> usize {
    if secs <= 0.0 {
        return 0;
    }
    // Integer path for the default length so 44.1 kHz gives exactly 17 640.
    if secs == FALLBACK_TONE_SECS {
        return sample_rate as usize * 2 / 5;
    }
    (sample_rate as f64 * secs as f64).floor() as usize
}
