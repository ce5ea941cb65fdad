//! Capture-side frame storage and the playable mono [`AudioBuffer`].
//!
//! [`FrameBuffer`] is an append-only, bounded store of the frames delivered by
//! the capture callback.  Unlike a ring buffer it never overwrites: once the
//! sample budget is spent, further frames are rejected and counted so the
//! head of the recording is preserved.
//!
//! # Example
//!
//! ```rust
//! use audio_session::audio::FrameBuffer;
//!
//! let mut buf = FrameBuffer::new(4);
//! assert!(buf.push_frame(&[1.0, 2.0]));
//! assert!(buf.push_frame(&[3.0, 4.0]));
//! assert!(!buf.push_frame(&[5.0])); // budget spent → rejected
//! assert_eq!(buf.take_concatenated(), vec![1.0, 2.0, 3.0, 4.0]);
//! ```

use std::sync::Arc;

// ---------------------------------------------------------------------------
// FrameBuffer
// ---------------------------------------------------------------------------

/// Bounded, append-only sequence of owned audio frames.
///
/// Every frame is stored as its own boxed slice; the producer hands in a
/// borrowed slice and the buffer copies it.  The engine reuses its scratch
/// memory across callbacks, so keeping a reference would corrupt all prior
/// frames.
pub struct FrameBuffer {
    frames: Vec<Box<[f32]>>,
    /// Maximum number of samples across all frames.
    max_samples: usize,
    /// Number of samples currently stored.
    len: usize,
    /// Frames rejected because the budget was spent.
    dropped: usize,
}

impl FrameBuffer {
    /// Create a new buffer that accepts at most `max_samples` samples.
    ///
    /// # Panics
    ///
    /// Panics if `max_samples == 0`.
    pub fn new(max_samples: usize) -> Self {
        assert!(max_samples > 0, "FrameBuffer capacity must be > 0");
        Self {
            frames: Vec::new(),
            max_samples,
            len: 0,
            dropped: 0,
        }
    }

    /// Append an owned copy of `frame`.
    ///
    /// Returns `false` (and counts the frame as dropped) when storing it
    /// would exceed the sample budget.  Empty frames are accepted and ignored.
    pub fn push_frame(&mut self, frame: &[f32]) -> bool {
        if frame.is_empty() {
            return true;
        }
        if self.len + frame.len() > self.max_samples {
            self.dropped += 1;
            return false;
        }
        self.len += frame.len();
        self.frames.push(frame.into());
        true
    }

    /// Concatenate every stored frame in arrival order and reset the buffer.
    pub fn take_concatenated(&mut self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.len);
        for frame in self.frames.drain(..) {
            out.extend_from_slice(&frame);
        }
        self.len = 0;
        self.dropped = 0;
        out
    }

    /// Drain the buffer as consecutive runs, one per entry of `starts`.
    ///
    /// `starts` holds ascending frame indices; run `i` gets the frames from
    /// `starts[i]` up to the next start.  Frames before the first start go to
    /// the first run.  An empty `starts` yields a single run.
    pub fn take_runs(&mut self, starts: &[usize]) -> Vec<Vec<f32>> {
        let mut frames = self.frames.drain(..).enumerate().peekable();
        let mut runs = Vec::with_capacity(starts.len().max(1));
        for i in 0..starts.len().max(1) {
            let end = starts.get(i + 1).copied().unwrap_or(usize::MAX);
            let mut run = Vec::new();
            while let Some((_, frame)) = frames.next_if(|(idx, _)| *idx < end) {
                run.extend_from_slice(&frame);
            }
            runs.push(run);
        }
        drop(frames);
        self.len = 0;
        self.dropped = 0;
        runs
    }

    /// Discard all frames and the dropped-frame counter.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.len = 0;
        self.dropped = 0;
    }

    /// Number of frames stored.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Number of samples stored across all frames.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Frames rejected since the last clear.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn capacity(&self) -> usize {
        self.max_samples
    }

    /// Duration of the stored audio in seconds, assuming `sample_rate` Hz mono.
    pub fn duration_secs(&self, sample_rate: u32) -> f32 {
        if sample_rate == 0 {
            return 0.0;
        }
        self.len as f32 / sample_rate as f32
    }
}

// ---------------------------------------------------------------------------
// AudioBuffer
// ---------------------------------------------------------------------------

/// Immutable mono clip at a fixed sample rate, ready for playback.
///
/// Shared as `Arc<AudioBuffer>` between the session (which owns the last
/// recording) and the engine (which reads it while playing).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
