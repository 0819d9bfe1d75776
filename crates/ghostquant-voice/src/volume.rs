//! Volume measurement and silence tracking for captured frames.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Frequency-domain RMS of a frame, normalized to [0, 1].
///
/// The magnitude spectrum is summed over every bin, so by Parseval's identity
/// the result matches the time-domain RMS of the frame.
pub struct VolumeAnalyzer {
    planner: FftPlanner<f32>,
    plan: Option<(usize, Arc<dyn Fft<f32>>)>,
    buffer: Vec<Complex<f32>>,
}

impl VolumeAnalyzer {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            plan: None,
            buffer: Vec::new(),
        }
    }

    fn fft_for(&mut self, len: usize) -> Arc<dyn Fft<f32>> {
        if let Some((n, fft)) = &self.plan {
            if *n == len {
                return Arc::clone(fft);
            }
        }
        let fft = self.planner.plan_fft_forward(len);
        self.plan = Some((len, Arc::clone(&fft)));
        fft
    }

    /// Measure one frame.
    #[allow(clippy::cast_precision_loss)]
    pub fn measure(&mut self, samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let n = samples.len();
        let fft = self.fft_for(n);

        self.buffer.clear();
        self.buffer.extend(samples.iter().map(|&s| Complex::new(s, 0.0)));
        fft.process(&mut self.buffer);

        let energy: f32 = self.buffer.iter().map(|c| c.norm_sqr()).sum();
        let rms = energy.sqrt() / n as f32;
        if rms.is_finite() {
            rms.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Drop the cached FFT plan and scratch space.
    pub fn reset(&mut self) {
        self.plan = None;
        self.buffer = Vec::new();
    }
}

impl Default for VolumeAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot silence detector: fires once per silent stretch.
#[derive(Debug, Clone)]
pub struct SilenceTracker {
    threshold: f32,
    duration: Duration,
    silent_since: Option<Instant>,
    fired: bool,
}

impl SilenceTracker {
    pub fn new(threshold: f32, duration: Duration) -> Self {
        Self {
            threshold,
            duration,
            silent_since: None,
            fired: false,
        }
    }

    /// Feed a level. Returns the silent span when the detector fires.
    pub fn observe(&mut self, level: f32, at: Instant) -> Option<Duration> {
        if level >= self.threshold {
            self.silent_since = None;
            self.fired = false;
            return None;
        }

        let since = *self.silent_since.get_or_insert(at);
        let silent_for = at.saturating_duration_since(since);
        if !self.fired && silent_for >= self.duration {
            self.fired = true;
            return Some(silent_for);
        }
        None
    }

    pub fn is_silent(&self) -> bool {
        self.silent_since.is_some()
    }

    pub fn reset(&mut self) {
        self.silent_since = None;
        self.fired = false;
    }
}
