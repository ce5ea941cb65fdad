//! Frame sink shared between the capture node and the session.
//!
//! The engine's processing callback calls [`CaptureSink::push`] once per
//! frame.  The sink copies the frame only while armed, so the session can
//! wire the graph first and start accumulating exactly when capture begins.
//! The session owns the sink for the lifetime of one capture; a device-change
//! re-acquisition reconnects the new stream to the same sink so no frames are
//! lost.
//!
//! Each stream that feeds the sink opens a segment tagged with its rate, so a
//! replacement microphone running at a different rate never relabels the
//! frames recorded before the switch.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use super::{resample_linear, FrameBuffer};

/// A run of samples delivered at one rate.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedSegment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Everything accumulated by one capture, drained at stop time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedAudio {
    /// Mono segments in arrival order, one per stream that fed the capture.
    pub segments: Vec<CapturedSegment>,
    /// Number of frames that contributed to `segments`.
    pub frames: usize,
    /// Frames rejected because the recording budget was spent or the sink
    /// was busy being drained.
    pub dropped: usize,
}

impl CapturedAudio {
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.samples.is_empty())
    }

    pub fn sample_count(&self) -> usize {
        self.segments.iter().map(|s| s.samples.len()).sum()
    }

    /// Rate of the last stream that fed the capture.
    pub fn last_rate(&self) -> Option<u32> {
        self.segments.last().map(|s| s.sample_rate)
    }

    /// Resample every segment to `rate` and join them.
    pub fn into_rate(self, rate: u32) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.sample_count());
        for segment in self.segments {
            if segment.sample_rate == rate || segment.sample_rate == 0 {
                out.extend(segment.samples);
            } else {
                out.extend(resample_linear(&segment.samples, segment.sample_rate, rate));
            }
        }
        out
    }
}

struct Recording {
    frames: FrameBuffer,
    /// `(first frame, rate)` for each stream, oldest first.  Never empty.
    segments: Vec<(usize, u32)>,
}

impl Recording {
    fn current_rate(&self) -> u32 {
        self.segments.last().map_or(0, |&(_, rate)| rate)
    }

    fn restart(&mut self) {
        let rate = self.current_rate();
        self.frames.clear();
        self.segments = vec![(0, rate)];
    }
}

/// Armed, bounded frame accumulator fed by the audio callback.
pub struct CaptureSink {
    armed: AtomicBool,
    /// Frames skipped because the recording was locked by the session.
    contended: AtomicUsize,
    recording: Mutex<Recording>,
}

impl CaptureSink {
    /// Create a disarmed sink holding at most `max_samples` samples.
    pub fn new(max_samples: usize, source_rate: u32) -> Self {
        Self {
            armed: AtomicBool::new(false),
            contended: AtomicUsize::new(0),
            recording: Mutex::new(Recording {
                frames: FrameBuffer::new(max_samples),
                segments: vec![(0, source_rate)],
            }),
        }
    }

    /// Discard anything stored and start accepting frames.
    pub fn arm(&self) {
        self.lock().restart();
        self.contended.store(0, Ordering::Relaxed);
        self.armed.store(true, Ordering::Release);
    }

    /// Stop accepting frames.  Returns whether the sink was armed.
    pub fn disarm(&self) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Called from the audio callback with the engine's scratch slice.
    ///
    /// Copies `frame` when armed; returns `false` when the frame was ignored
    /// (disarmed) or dropped (budget spent, or the session holds the lock).
    /// Never blocks.
    pub fn push(&self, frame: &[f32]) -> bool {
        if !self.is_armed() {
            return false;
        }
        match self.recording.try_lock() {
            Ok(mut recording) => recording.frames.push_frame(frame),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().frames.push_frame(frame),
            Err(TryLockError::WouldBlock) => {
                self.contended.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Record the rate of the stream now feeding this sink.
    ///
    /// Frames pushed from here on form a new segment when the rate differs
    /// from the previous stream's.
    pub fn set_source_rate(&self, rate: u32) {
        let mut guard = self.lock();
        let recording = &mut *guard;
        let next_frame = recording.frames.frame_count();
        match recording.segments.last_mut() {
            Some(&mut (_, current)) if current == rate => {}
            Some(last) if last.0 == next_frame => last.1 = rate,
            _ => recording.segments.push((next_frame, rate)),
        }
    }

    pub fn source_rate(&self) -> u32 {
        self.lock().current_rate()
    }

    pub fn frame_count(&self) -> usize {
        self.lock().frames.frame_count()
    }

    /// Drain the accumulated frames.
    pub fn take(&self) -> CapturedAudio {
        let mut recording = self.lock();
        let frames = recording.frames.frame_count();
        let dropped = recording.frames.dropped() + self.contended.swap(0, Ordering::Relaxed);
        let starts: Vec<usize> = recording.segments.iter().map(|&(start, _)| start).collect();
        let runs = recording.frames.take_runs(&starts);
        let segments = runs
            .into_iter()
            .zip(recording.segments.iter().map(|&(_, rate)| rate))
            .filter(|(samples, _)| !samples.is_empty())
            .map(|(samples, sample_rate)| CapturedSegment {
                samples,
                sample_rate,
            })
            .collect();
        recording.restart();
        CapturedAudio {
            segments,
            frames,
            dropped,
        }
    }

    /// Drop everything without producing audio.
    pub fn discard(&self) {
        self.lock().restart();
    }

    fn lock(&self) -> MutexGuard<'_, Recording> {
        self.recording.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CaptureSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSink")
            .field("armed", &self.is_armed())
            .field("source_rate", &self.source_rate())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(captured: &CapturedAudio) -> Vec<f32> {
        captured
            .segments
            .iter()
            .flat_map(|s| s.samples.iter().copied())
            .collect()
    }

    #[test]
    fn disarmed_sink_ignores_frames() {
        let sink = CaptureSink::new(64, 48_000);
        assert!(!sink.push(&[0.1, 0.2]));
        assert_eq!(sink.frame_count(), 0);
    }

    #[test]
    fn armed_sink_copies_frames() {
        let sink = CaptureSink::new(64, 48_000);
        sink.arm();
        let mut scratch = [0.5_f32; 3];
        assert!(sink.push(&scratch));
        scratch.fill(0.0);
        assert!(sink.push(&scratch));

        let captured = sink.take();
        assert_eq!(captured.frames, 2);
        assert_eq!(samples(&captured), vec![0.5, 0.5, 0.5, 0.0, 0.0, 0.0]);
        assert_eq!(captured.last_rate(), Some(48_000));
    }

    #[test]
    fn arm_clears_previous_capture() {
        let sink = CaptureSink::new(64, 48_000);
        sink.arm();
        sink.push(&[1.0]);
        sink.disarm();
        sink.arm();
        assert_eq!(sink.take().frames, 0);
    }

    #[test]
    fn disarm_reports_previous_state() {
        let sink = CaptureSink::new(8, 16_000);
        assert!(!sink.disarm());
        sink.arm();
        assert!(sink.disarm());
        assert!(!sink.push(&[1.0]));
    }

    #[test]
    fn dropped_frames_are_reported() {
        let sink = CaptureSink::new(2, 16_000);
        sink.arm();
        sink.push(&[1.0, 2.0]);
        sink.push(&[3.0]);
        let captured = sink.take();
        assert_eq!(captured.dropped, 1);
        assert_eq!(samples(&captured), vec![1.0, 2.0]);
    }

    #[test]
    fn push_while_drained_is_dropped_not_blocked() {
        let sink = CaptureSink::new(8, 16_000);
        sink.arm();
        {
            let _held = sink.lock();
            assert!(!sink.push(&[1.0]));
        }
        assert!(sink.push(&[2.0]));

        let captured = sink.take();
        assert_eq!(captured.dropped, 1);
        assert_eq!(samples(&captured), vec![2.0]);
    }

    #[test]
    fn source_rate_follows_reconnect() {
        let sink = CaptureSink::new(8, 48_000);
        sink.set_source_rate(44_100);
        assert_eq!(sink.source_rate(), 44_100);
    }

    #[test]
    fn rate_change_keeps_earlier_frames_at_their_rate() {
        let sink = CaptureSink::new(64, 48_000);
        sink.arm();
        sink.push(&[0.1, 0.2]);
        sink.set_source_rate(24_000);
        sink.push(&[0.3]);
        sink.set_source_rate(24_000);
        sink.push(&[0.4]);

        let captured = sink.take();
        assert_eq!(
            captured.segments,
            vec![
                CapturedSegment {
                    samples: vec![0.1, 0.2],
                    sample_rate: 48_000
                },
                CapturedSegment {
                    samples: vec![0.3, 0.4],
                    sample_rate: 24_000
                },
            ]
        );
        assert_eq!(captured.frames, 3);
    }

    #[test]
    fn rate_change_before_any_frame_relabels_the_segment() {
        let sink = CaptureSink::new(64, 48_000);
        sink.arm();
        sink.set_source_rate(16_000);
        sink.push(&[0.5]);
        assert_eq!(sink.take().segments.len(), 1);
        assert_eq!(sink.source_rate(), 16_000);
    }

    #[test]
    fn into_rate_resamples_each_segment() {
        let captured = CapturedAudio {
            segments: vec![
                CapturedSegment {
                    samples: vec![0.0; 4_800],
                    sample_rate: 48_000,
                },
                CapturedSegment {
                    samples: vec![0.0; 2_400],
                    sample_rate: 24_000,
                },
            ],
            frames: 2,
            dropped: 0,
        };
        // 0.1 s + 0.1 s at 48 kHz.
        assert_eq!(captured.into_rate(48_000).len(), 9_600);
    }

    #[test]
    fn sink_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CaptureSink>();
    }
}
