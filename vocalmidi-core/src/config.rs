//! # Configuration Module
//!
//! The parameter bundle that governs every threshold in the estimator,
//! the note tracker and the dispatcher.
//!
//! Field names serialize in camelCase (`bufferSize`, `noteOffDelay`, ...) and
//! every field has a default, so a config file only needs the options it
//! changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Octave shift bounds accepted by [`Config::octave_shift`].
pub const OCTAVE_SHIFT_RANGE: std::ops::RangeInclusive<i8> = -3..=3;

/// Upper bound of [`Config::sensitivity`], in percent.
pub const MAX_SENSITIVITY: f32 = 100.0;

/// A malformed configuration, rejected before the pipeline starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("bufferSize must be at least {min} samples, got {got}")]
    BufferTooSmall { min: usize, got: usize },
    #[error("processInterval must be greater than zero")]
    ZeroInterval,
    #[error("{name} must be within {min}..={max}, got {got}")]
    OutOfRange {
        name: &'static str,
        min: f32,
        max: f32,
        got: f32,
    },
    #[error("minFrequency ({min} Hz) must be below maxFrequency ({max} Hz)")]
    InvertedFrequencyRange { min: f32, max: f32 },
    #[error("maxFrequency ({max} Hz) must be below the Nyquist frequency of {sample_rate} Hz")]
    AboveNyquist { max: f32, sample_rate: u32 },
    #[error(
        "minFrequency ({min} Hz) needs a lag of {lag} samples, but a {buffer_size}-sample frame supports at most {limit}"
    )]
    FrameTooShort {
        min: f32,
        lag: usize,
        buffer_size: usize,
        limit: usize,
    },
    #[error("noteOnConsecutive must be at least 1")]
    ZeroConsecutive,
    #[error("{name} is fixed by the running capture and cannot change until it restarts")]
    FixedByCapture { name: &'static str },
}

/// Every option recognized by the detector, tracker and dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Frame length in samples.
    pub buffer_size: usize,
    /// Milliseconds between processing ticks.
    #[serde(rename = "processInterval")]
    pub process_interval_ms: u64,
    /// Difference-function acceptance threshold.
    pub yin_threshold: f32,
    /// Minimum confidence for a frame to count as a detection, before
    /// `sensitivity` lowers it.
    pub confidence_threshold: f32,
    pub min_frequency: f32,
    pub max_frequency: f32,
    /// Frames of the same note required to confirm an onset.
    pub note_on_consecutive: u32,
    /// Milliseconds of silence that confirm a release.
    #[serde(rename = "noteOffDelay")]
    pub note_off_delay_ms: u64,
    /// Cents changes smaller than this are not re-sent as pitch bend.
    pub cents_hysteresis: u32,
    /// Milliseconds a note must sound before it may change to another.
    #[serde(rename = "minNoteDuration")]
    pub min_note_duration_ms: u64,
    /// MIDI channel, 0 to 15.
    pub channel: u8,
    /// Octaves added to the detected note before sending, -3 to 3.
    pub octave_shift: i8,
    pub base_velocity: u8,
    pub velocity_from_amplitude: bool,
    /// Semitones covered by the full pitch-bend range.
    pub pitch_bend_range: f32,
    /// Percent (0 to 100) by which half the confidence threshold is waived.
    pub sensitivity: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: 2048,
            process_interval_ms: 10,
            yin_threshold: 0.15,
            confidence_threshold: 0.5,
            min_frequency: 50.0,
            max_frequency: 2000.0,
            note_on_consecutive: 3,
            note_off_delay_ms: 50,
            cents_hysteresis: 30,
            min_note_duration_ms: 30,
            channel: 0,
            octave_shift: 0,
            base_velocity: 100,
            velocity_from_amplitude: true,
            pitch_bend_range: 2.0,
            sensitivity: 70.0,
        }
    }
}

/// The confidence a detection needs once sensitivity is applied.
///
/// Sensitivity 0 keeps the threshold as configured; 100 halves it.
pub fn adjusted_confidence_threshold(confidence_threshold: f32, sensitivity: f32) -> f32 {
    confidence_threshold * (1.0 - sensitivity.clamp(0.0, MAX_SENSITIVITY) / 200.0)
}

fn check_range(name: &'static str, got: f32, min: f32, max: f32) -> Result<(), ConfigError> {
    if got.is_finite() && (min..=max).contains(&got) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { name, min, max, got })
    }
}

impl Config {
    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }

    pub fn note_off_delay(&self) -> Duration {
        Duration::from_millis(self.note_off_delay_ms)
    }

    pub fn min_note_duration(&self) -> Duration {
        Duration::from_millis(self.min_note_duration_ms)
    }

    pub fn adjusted_confidence_threshold(&self) -> f32 {
        adjusted_confidence_threshold(self.confidence_threshold, self.sensitivity)
    }

    /// Checks every option that does not depend on the audio device.
    ///
    /// # Returns
    /// * `Ok(())` - The configuration can drive a pipeline
    /// * `Err(ConfigError)` - The first malformed option found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < 64 {
            return Err(ConfigError::BufferTooSmall { min: 64, got: self.buffer_size });
        }
        if self.process_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        check_range("yinThreshold", self.yin_threshold, f32::EPSILON, 1.0)?;
        check_range("confidenceThreshold", self.confidence_threshold, 0.0, 1.0)?;
        check_range("minFrequency", self.min_frequency, f32::EPSILON, f32::MAX)?;
        check_range("maxFrequency", self.max_frequency, f32::EPSILON, f32::MAX)?;
        if self.min_frequency >= self.max_frequency {
            return Err(ConfigError::InvertedFrequencyRange {
                min: self.min_frequency,
                max: self.max_frequency,
            });
        }
        if self.note_on_consecutive == 0 {
            return Err(ConfigError::ZeroConsecutive);
        }
        check_range("channel", self.channel as f32, 0.0, 15.0)?;
        check_range(
            "octaveShift",
            self.octave_shift as f32,
            *OCTAVE_SHIFT_RANGE.start() as f32,
            *OCTAVE_SHIFT_RANGE.end() as f32,
        )?;
        check_range("baseVelocity", self.base_velocity as f32, 1.0, 127.0)?;
        check_range("pitchBendRange", self.pitch_bend_range, 1.0, 24.0)?;
        check_range("sensitivity", self.sensitivity, 0.0, MAX_SENSITIVITY)?;
        Ok(())
    }

    /// Checks that `next` keeps the frame geometry a running capture was
    /// opened with.
    pub fn check_capture_unchanged(&self, next: &Config) -> Result<(), ConfigError> {
        if next.buffer_size != self.buffer_size {
            return Err(ConfigError::FixedByCapture { name: "bufferSize" });
        }
        if next.process_interval_ms != self.process_interval_ms {
            return Err(ConfigError::FixedByCapture { name: "processInterval" });
        }
        Ok(())
    }

    /// Checks the options that depend on the capture device's sample rate.
    ///
    /// The estimator needs `sample_rate / min_frequency` (plus one lag for
    /// interpolation) to fit inside half a frame.
    pub fn validate_for_sample_rate(&self, sample_rate: u32) -> Result<(), ConfigError> {
        self.validate()?;
        if self.max_frequency >= sample_rate as f32 / 2.0 {
            return Err(ConfigError::AboveNyquist {
                max: self.max_frequency,
                sample_rate,
            });
        }
        let lag = (sample_rate as f32 / self.min_frequency).ceil() as usize;
        let limit = self.buffer_size / 2 - 1;
        if lag > limit {
            return Err(ConfigError::FrameTooShort {
                min: self.min_frequency,
                lag,
                buffer_size: self.buffer_size,
                limit,
            });
        }
        Ok(())
    }

    /// Loads a configuration from a JSON file and validates it.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        let mut data = String::new();
        file.read_to_string(&mut data)?;
        let config: Config = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration as pretty-printed JSON.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json_string = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create {}", path.as_ref().display()))?;
        file.write_all(json_string.as_bytes())?;
        Ok(())
    }
}
