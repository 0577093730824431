//! # Note Tracker Module
//!
//! Turns the noisy per-frame output of the pitch detector into discrete,
//! monophonic note events.
//!
//! The tracker is either `Silent` or sounding a single note. Onsets need the
//! same note on `note_on_consecutive` consecutive frames of sufficient
//! confidence (the configured threshold, lowered by `sensitivity`); releases need
//! `note_off_delay` of wall-clock time without a valid detection, so brief
//! dropouts (vibrato, consonants) do not cut a note. While a note sounds,
//! intonation changes become pitch bends (with hysteresis) and a new pitch
//! becomes a single `NoteChange` once `min_note_duration` has passed.

use crate::config::{self, Config};
use crate::tuning;
use std::time::Duration;

/// One musical event produced by the tracker for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteEvent {
    NoteOn { note: u8, cents: i32 },
    NoteOff { note: u8 },
    /// An atomic note-off of `old_note` followed by a note-on of `new_note`.
    NoteChange { old_note: u8, new_note: u8, cents: i32 },
    /// Intonation change of the sounding note; the note itself is unchanged.
    PitchBend { note: u8, cents: i32 },
}

/// The tracker's persistent state, copied out for display code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerState {
    pub current_note: Option<u8>,
    /// Cents offset last reported for `current_note`.
    pub current_cents: i32,
    pub consecutive_detection_count: u32,
    pub last_detection_timestamp: Option<Duration>,
    pub note_start_timestamp: Option<Duration>,
    pub pending_candidate_note: Option<u8>,
}

/// Thresholds the tracker reads from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq)]
struct TrackerSettings {
    confidence_threshold: f32,
    sensitivity: f32,
    note_on_consecutive: u32,
    note_off_delay: Duration,
    cents_hysteresis: u32,
    min_note_duration: Duration,
}

/// Stateful debouncing note tracker. Deterministic: the same input sequence
/// always yields the same events.
#[derive(Debug, Clone)]
pub struct NoteTracker {
    settings: TrackerSettings,
    state: TrackerState,
}

impl NoteTracker {
    pub fn new(config: &Config) -> Self {
        Self {
            settings: TrackerSettings {
                confidence_threshold: config.confidence_threshold,
                sensitivity: config.sensitivity,
                note_on_consecutive: config.note_on_consecutive.max(1),
                note_off_delay: config.note_off_delay(),
                cents_hysteresis: config.cents_hysteresis,
                min_note_duration: config.min_note_duration(),
            },
            state: TrackerState::default(),
        }
    }

    /// A copy of the current state.
    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn current_note(&self) -> Option<u8> {
        self.state.current_note
    }

    /// Changes the sensitivity between frames; takes effect on the next update.
    pub fn set_sensitivity(&mut self, sensitivity: f32) {
        self.settings.sensitivity = sensitivity;
    }

    /// Returns to `Silent` without emitting anything.
    ///
    /// Used on stop and panic, where the caller releases notes itself.
    pub fn reset(&mut self) {
        self.state = TrackerState::default();
    }

    /// Feeds one frame's reading into the state machine.
    ///
    /// # Arguments
    /// * `frequency` - Detected frequency, `None` for "no pitch"
    /// * `confidence` - Detector confidence (0.0 to 1.0)
    /// * `timestamp` - Time of the frame, monotonically non-decreasing
    ///
    /// # Returns
    /// * At most one event for this frame
    pub fn update(
        &mut self,
        frequency: Option<f32>,
        confidence: f32,
        timestamp: Duration,
    ) -> Option<NoteEvent> {
        let threshold = config::adjusted_confidence_threshold(
            self.settings.confidence_threshold,
            self.settings.sensitivity,
        );
        let detection = frequency
            .filter(|_| confidence >= threshold)
            .and_then(tuning::frequency_to_note);

        match (self.state.current_note, detection) {
            (None, Some((note, cents))) => self.detect_while_silent(note, cents, timestamp),
            (None, None) => {
                self.state.pending_candidate_note = None;
                self.state.consecutive_detection_count = 0;
                None
            }
            (Some(current), Some((note, cents))) => {
                self.detect_while_sounding(current, note, cents, timestamp)
            }
            (Some(current), None) => self.release_if_expired(current, timestamp),
        }
    }

    fn detect_while_silent(&mut self, note: u8, cents: i32, timestamp: Duration) -> Option<NoteEvent> {
        let state = &mut self.state;
        if state.pending_candidate_note == Some(note) {
            state.consecutive_detection_count += 1;
        } else {
            state.pending_candidate_note = Some(note);
            state.consecutive_detection_count = 1;
        }
        state.last_detection_timestamp = Some(timestamp);

        if state.consecutive_detection_count < self.settings.note_on_consecutive {
            return None;
        }

        state.current_note = Some(note);
        state.current_cents = cents;
        state.note_start_timestamp = Some(timestamp);
        state.pending_candidate_note = None;
        state.consecutive_detection_count = 0;
        log::debug!("Note on {} ({:+} cents)", tuning::note_name(note), cents);
        Some(NoteEvent::NoteOn { note, cents })
    }

    fn detect_while_sounding(
        &mut self,
        current: u8,
        note: u8,
        cents: i32,
        timestamp: Duration,
    ) -> Option<NoteEvent> {
        self.state.last_detection_timestamp = Some(timestamp);

        if note == current {
            let threshold = self.settings.cents_hysteresis.max(1);
            if (cents - self.state.current_cents).unsigned_abs() < threshold {
                return None;
            }
            self.state.current_cents = cents;
            return Some(NoteEvent::PitchBend { note, cents });
        }

        let started = self.state.note_start_timestamp.unwrap_or(timestamp);
        if timestamp.saturating_sub(started) < self.settings.min_note_duration {
            return None;
        }

        self.state.current_note = Some(note);
        self.state.current_cents = cents;
        self.state.note_start_timestamp = Some(timestamp);
        log::debug!(
            "Note change {} -> {} ({:+} cents)",
            tuning::note_name(current),
            tuning::note_name(note),
            cents
        );
        Some(NoteEvent::NoteChange {
            old_note: current,
            new_note: note,
            cents,
        })
    }

    fn release_if_expired(&mut self, current: u8, timestamp: Duration) -> Option<NoteEvent> {
        let last = self.state.last_detection_timestamp.unwrap_or(timestamp);
        if timestamp.saturating_sub(last) <= self.settings.note_off_delay {
            return None;
        }
        log::debug!("Note off {}", tuning::note_name(current));
        self.reset();
        Some(NoteEvent::NoteOff { note: current })
    }
}
