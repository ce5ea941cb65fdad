//! Channel mixing and rate conversion for captured audio.
//!
//! The session keeps every recording as **mono `f32` at the context rate**.
//! Microphones rarely agree on either, so the capture path uses:
//!
//! 1. [`downmix_into`] inside the input callback, reusing one scratch buffer.
//! 2. [`resample_linear`] at stop time, once per stream segment whose rate
//!    differs from the context rate.

// ---------------------------------------------------------------------------
// downmix_to_mono
// ---------------------------------------------------------------------------

/// Mix interleaved multi-channel audio down to mono by averaging channels.
///
/// The output length is `samples.len() / channels`; a trailing partial frame
/// is discarded.  `channels == 0` yields an empty vector.
///
/// ```rust
/// use audio_session::audio::downmix_to_mono;
///
/// let stereo = vec![0.5_f32, -0.5, 0.2, 0.4]; // L R L R
/// let mono = downmix_to_mono(&stereo, 2);
/// assert_eq!(mono.len(), 2);
/// assert!((mono[0] - 0.0).abs() < 1e-6);
/// assert!((mono[1] - 0.3).abs() < 1e-6);
/// ```
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    let mut out = Vec::new();
    downmix_into(samples, channels, &mut out);
    out
}

/// [`downmix_to_mono`] into a caller-owned buffer, which is cleared first.
///
/// Lets an input callback reuse one allocation across frames.
pub fn downmix_into(samples: &[f32], channels: u16, out: &mut Vec<f32>) {
    out.clear();
    match channels {
        0 => {}
        1 => out.extend_from_slice(samples),
        n => {
            let n = n as usize;
            out.extend(
                samples
                    .chunks_exact(n)
                    .map(|frame| frame.iter().sum::<f32>() / n as f32),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// resample_linear
// ---------------------------------------------------------------------------

/// Resample mono `samples` from `source_rate` to `target_rate` Hz using linear
/// interpolation.
///
/// Equal rates, empty input and a zero rate on either side return the input
/// unchanged.  The output length is `ceil(len × target / source)`.
///
/// ```rust
/// use audio_session::audio::resample_linear;
///
/// let hi = vec![0.5_f32; 480];
/// assert_eq!(resample_linear(&hi, 48_000, 16_000).len(), 160);
/// assert_eq!(resample_linear(&hi, 48_000, 48_000).len(), 480);
/// ```
pub fn resample_linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || source_rate == 0 || target_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let output_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else if idx < samples.len() {
            samples[idx]
        } else {
            0.0
        };

        output.push(sample);
    }

    output
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
