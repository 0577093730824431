//! # Pitch Detection Module
//!
//! Fundamental-frequency estimation with the YIN algorithm, tuned for a
//! single live voice or instrument.
//!
//! ## Features
//! - Difference function via FFT cross-correlation
//! - Cumulative mean normalized difference with absolute threshold
//! - Lag search bounded by the configured frequency range
//! - Parabolic interpolation for sub-sample accuracy
//! - Silence short-circuit that never divides by zero

use crate::config::{Config, ConfigError};
use crate::fft::{self, DifferenceFunction};
use crate::{AudioFrame, PitchEstimate};

/// RMS below which a frame (after DC removal) is treated as silence.
const SILENCE_RMS: f64 = 1e-6;

/// Lags 0 and 1 carry no period information.
const FIRST_LAG: usize = 2;

/// Relative slack on the frequency bounds, so a pitch sitting exactly on
/// `min_frequency` or `max_frequency` survives interpolation error.
const RANGE_TOLERANCE: f32 = 0.01;

/// A stateless YIN estimator for frames of one fixed length.
///
/// Holding the FFT plans is the only reason this is a struct: `detect`
/// takes `&self`, keeps nothing between calls and gives the same answer for
/// the same frame.
#[derive(Debug)]
pub struct YinDetector {
    sample_rate: u32,
    threshold: f64,
    min_frequency: f32,
    max_frequency: f32,
    min_lag: usize,
    max_lag: usize,
    difference: DifferenceFunction,
}

impl YinDetector {
    /// Builds a detector for the given configuration and device sample rate.
    ///
    /// # Returns
    /// * `Ok(detector)` - Ready to analyze `config.buffer_size`-sample frames
    /// * `Err(ConfigError)` - The frequency range does not fit the frame
    pub fn new(config: &Config, sample_rate: u32) -> Result<Self, ConfigError> {
        config.validate_for_sample_rate(sample_rate)?;

        let difference = DifferenceFunction::new(config.buffer_size);
        let window = difference.window();
        let min_frequency = config.min_frequency * (1.0 - RANGE_TOLERANCE);
        let max_frequency = config.max_frequency * (1.0 + RANGE_TOLERANCE);
        let min_lag = ((sample_rate as f32 / max_frequency).floor() as usize).max(FIRST_LAG);
        let max_lag = ((sample_rate as f32 / min_frequency).ceil() as usize).min(window - 1);

        log::debug!(
            "YIN detector: {} Hz, frame {}, lags {}..={}",
            sample_rate,
            config.buffer_size,
            min_lag,
            max_lag
        );

        Ok(Self {
            sample_rate,
            threshold: config.yin_threshold as f64,
            min_frequency,
            max_frequency,
            min_lag,
            max_lag,
            difference,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_size(&self) -> usize {
        self.difference.frame_size()
    }

    /// Estimates the fundamental frequency of one frame.
    ///
    /// # Returns
    /// * A pitched estimate with confidence `1 - cmnd(lag)`
    /// * "No pitch" (confidence 0) for silence, frames of the wrong length,
    ///   frames with no lag under the threshold, or results outside the
    ///   configured frequency range
    pub fn detect(&self, frame: &AudioFrame) -> PitchEstimate {
        if frame.len() != self.frame_size() {
            log::trace!(
                "Ignoring frame of {} samples, expected {}",
                frame.len(),
                self.frame_size()
            );
            return PitchEstimate::none();
        }

        let mut signal: Vec<f64> = frame.samples().iter().map(|&s| s as f64).collect();
        if signal.iter().any(|s| !s.is_finite()) {
            return PitchEstimate::none();
        }
        fft::remove_dc_offset(&mut signal);

        // --- Noise floor: silent or DC-only frames never reach a division ---
        let rms = (signal.iter().map(|s| s * s).sum::<f64>() / signal.len() as f64).sqrt();
        if rms < SILENCE_RMS {
            return PitchEstimate::none();
        }

        let diff = self.difference.difference(&signal);
        let cmnd = cumulative_mean_normalized(&diff, self.max_lag + 1);

        let Some(lag) = self.first_dip(&cmnd) else {
            return PitchEstimate::none();
        };

        let refined = parabolic_lag(&cmnd, lag);
        let frequency = (self.sample_rate as f64 / refined) as f32;
        if !frequency.is_finite()
            || frequency < self.min_frequency
            || frequency > self.max_frequency
        {
            return PitchEstimate::none();
        }

        PitchEstimate {
            frequency: Some(frequency),
            confidence: (1.0 - cmnd[lag]).clamp(0.0, 1.0) as f32,
        }
    }

    /// Smallest lag under the threshold, followed down to its local minimum.
    ///
    /// The scan starts below `min_lag` so a pitch above `max_frequency` is
    /// rejected instead of being reported at one of its subharmonics.
    fn first_dip(&self, cmnd: &[f64]) -> Option<usize> {
        let mut tau = (FIRST_LAG..=self.max_lag).find(|&tau| cmnd[tau] < self.threshold)?;
        while tau < self.max_lag && cmnd[tau + 1] < cmnd[tau] {
            tau += 1;
        }
        (tau >= self.min_lag).then_some(tau)
    }
}

/// Normalizes `d(tau)` by its running mean for `tau` in `0..=last`.
///
/// `cmnd(0) = 1`; a zero running sum (possible only for a silent prefix)
/// yields 1 instead of dividing.
fn cumulative_mean_normalized(diff: &[f64], last: usize) -> Vec<f64> {
    let last = last.min(diff.len() - 1);
    let mut cmnd = vec![1.0; last + 1];
    let mut running_sum = 0.0;
    for tau in 1..=last {
        running_sum += diff[tau];
        if running_sum > 0.0 {
            cmnd[tau] = diff[tau] * tau as f64 / running_sum;
        }
    }
    cmnd
}

/// Refines an integer lag with a parabola through its neighbours.
fn parabolic_lag(cmnd: &[f64], tau: usize) -> f64 {
    if tau == 0 || tau + 1 >= cmnd.len() {
        return tau as f64;
    }
    let y1 = cmnd[tau - 1];
    let y2 = cmnd[tau];
    let y3 = cmnd[tau + 1];
    let denominator = y1 - 2.0 * y2 + y3;
    if denominator.abs() < 1e-12 {
        return tau as f64;
    }
    let shift = (y1 - y3) / (2.0 * denominator);
    if shift.is_finite() && shift.abs() <= 1.0 {
        tau as f64 + shift
    } else {
        tau as f64
    }
}
