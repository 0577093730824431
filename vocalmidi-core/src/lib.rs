// vocalmidi-core/src/lib.rs

//! The core logic for turning a sung or played monophonic voice into MIDI.
//! This crate is responsible for audio capture, pitch detection, note
//! tracking and MIDI dispatch. It is completely headless and contains no
//! GUI code.
//!
//! Data flows strictly downstream:
//! capture -> [`pitch`] -> [`tracker`] -> [`dispatcher`] -> MIDI / synth / recorder,
//! driven by the [`pipeline`] loop.

pub mod audio;
pub mod config;
pub mod dispatcher;
pub mod fft;
pub mod midi;
pub mod monitor;
pub mod pipeline;
pub mod pitch;
pub mod tracker;
pub mod tuning;

pub use config::{Config, ConfigError};
pub use tracker::{NoteEvent, NoteTracker, TrackerState};

use std::sync::Arc;
use thiserror::Error;

/// One fixed-length block of mono PCM samples.
///
/// Frames are immutable once produced; cloning shares the sample storage.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
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

    /// Root-mean-square level of the frame, 0.0 for an empty frame.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        (self.samples.iter().map(|&s| s * s).sum::<f32>() / self.samples.len() as f32).sqrt()
    }
}

/// Represents the result of pitch detection on a single audio frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchEstimate {
    /// The detected fundamental in Hz, `None` for "no pitch".
    pub frequency: Option<f32>,
    /// The confidence of the estimate (0.0 to 1.0).
    pub confidence: f32,
}

impl PitchEstimate {
    /// "No pitch" with zero confidence.
    pub const fn none() -> Self {
        Self {
            frequency: None,
            confidence: 0.0,
        }
    }
}

/// Which external device a status change refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Capture,
    Midi,
}

/// Availability of an external device as last observed by the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Available,
    Unavailable(String),
}

/// A capture or MIDI device failure. Never fatal to a running pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device disconnected: {0}")]
    Disconnected(String),
    #[error("device write failed: {0}")]
    Write(String),
}
