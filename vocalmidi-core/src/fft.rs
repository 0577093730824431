//! # Fast Fourier Transform (FFT) Module
//!
//! FFT helpers for the pitch detector. The YIN difference function needs the
//! lagged products `sum x[j] * x[j + tau]` for every lag; computing them as
//! a cross-correlation in the frequency domain turns an O(N^2) loop into
//! O(N log N), which keeps detection well inside the tick period.
//!
//! ## Features
//! - High-performance FFT using RustFFT (plans are built once and reused)
//! - DC offset removal
//! - Difference function from prefix energies and FFT cross-correlation

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Removes the DC offset from a signal by making its average value zero.
///
/// # Arguments
/// * `signal` - Audio signal to process (modified in-place)
pub fn remove_dc_offset(signal: &mut [f64]) {
    let len = signal.len();
    if len == 0 {
        return;
    }
    let avg = signal.iter().sum::<f64>() / len as f64;
    if avg.abs() > 1e-12 {
        for sample in signal.iter_mut() {
            *sample -= avg;
        }
    }
}

/// Computes YIN difference functions for frames of one fixed length.
///
/// The forward and inverse plans are created at construction; `difference`
/// only allocates its working buffers.
pub struct DifferenceFunction {
    frame_size: usize,
    fft_size: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for DifferenceFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DifferenceFunction")
            .field("frame_size", &self.frame_size)
            .field("fft_size", &self.fft_size)
            .finish()
    }
}

impl DifferenceFunction {
    pub fn new(frame_size: usize) -> Self {
        let fft_size = frame_size.next_power_of_two();
        let mut planner = FftPlanner::new();
        Self {
            frame_size,
            fft_size,
            forward: planner.plan_fft_forward(fft_size),
            inverse: planner.plan_fft_inverse(fft_size),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Integration window of the difference function (half the frame).
    pub fn window(&self) -> usize {
        self.frame_size / 2
    }

    /// Returns `d(tau)` for `tau` in `0..=window`.
    ///
    /// `d(tau) = sum_{j<W} (x[j] - x[j+tau])^2`, expanded as
    /// `e(0..W) + e(tau..tau+W) - 2 * sum_{j<W} x[j] x[j+tau]`.
    /// The energies come from a prefix sum of squares, the cross term from
    /// `IFFT(conj(FFT(head)) * FFT(frame))`. Values are clamped at zero to
    /// absorb rounding.
    ///
    /// # Panics
    /// * If `signal.len()` differs from the frame size given to `new`
    pub fn difference(&self, signal: &[f64]) -> Vec<f64> {
        assert_eq!(signal.len(), self.frame_size, "frame length mismatch");
        let window = self.window();

        let mut prefix = Vec::with_capacity(signal.len() + 1);
        prefix.push(0.0);
        let mut acc = 0.0;
        for &s in signal {
            acc += s * s;
            prefix.push(acc);
        }

        let mut head: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); self.fft_size];
        let mut full: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); self.fft_size];
        for (i, &s) in signal.iter().enumerate() {
            full[i].re = s;
            if i < window {
                head[i].re = s;
            }
        }

        self.forward.process(&mut head);
        self.forward.process(&mut full);
        for (h, f) in head.iter_mut().zip(full.iter()) {
            *h = h.conj() * f;
        }
        self.inverse.process(&mut head);

        // rustfft leaves the inverse unnormalized.
        let scale = 1.0 / self.fft_size as f64;
        (0..=window)
            .map(|tau| {
                let cross = head[tau].re * scale;
                let energy = prefix[window] + (prefix[tau + window] - prefix[tau]);
                (energy - 2.0 * cross).max(0.0)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_difference(signal: &[f64]) -> Vec<f64> {
        let window = signal.len() / 2;
        (0..=window)
            .map(|tau| {
                (0..window)
                    .map(|j| {
                        let delta = signal[j] - signal[j + tau];
                        delta * delta
                    })
                    .sum()
            })
            .collect()
    }

    #[test]
    fn matches_the_direct_sum() {
        let signal: Vec<f64> = (0..256)
            .map(|i| {
                let t = i as f64;
                (t * 0.21).sin() + 0.4 * (t * 0.05).cos() + 0.1 * ((i * 7919 % 13) as f64 - 6.0) / 6.0
            })
            .collect();
        let fast = DifferenceFunction::new(signal.len()).difference(&signal);
        let slow = naive_difference(&signal);
        assert_eq!(fast.len(), slow.len());
        for (tau, (a, b)) in fast.iter().zip(slow.iter()).enumerate() {
            assert!((a - b).abs() < 1e-6 * (1.0 + b.abs()), "tau {tau}: {a} vs {b}");
        }
    }

    #[test]
    fn non_power_of_two_frames_are_padded() {
        let signal: Vec<f64> = (0..300).map(|i| (i as f64 * 0.3).sin()).collect();
        let diff = DifferenceFunction::new(300);
        assert_eq!(diff.window(), 150);
        let fast = diff.difference(&signal);
        let slow = naive_difference(&signal);
        for (a, b) in fast.iter().zip(slow.iter()) {
            assert!((a - b).abs() < 1e-6 * (1.0 + b.abs()));
        }
    }

    #[test]
    fn dc_offset_is_removed() {
        let mut signal = vec![0.5, 1.5, 0.5, 1.5];
        remove_dc_offset(&mut signal);
        assert_eq!(signal, vec![-0.5, 0.5, -0.5, 0.5]);
    }
}
