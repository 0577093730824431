//! # Monitoring Module
//!
//! Contracts for the collaborators that mirror the MIDI stream: a local
//! monitoring synthesizer and a note recorder. A recorder that keeps its take
//! in memory and saves it as JSON is included; synthesizers are supplied by
//! the host.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Local sound source that follows the outgoing notes.
pub trait Synthesizer {
    fn note_on(&mut self, note: u8, velocity: u8);
    fn note_off(&mut self, note: u8);
    /// Retunes the sounding note by a cents offset.
    fn update_pitch(&mut self, note: u8, cents: i32);
}

/// Receives note boundaries with their timestamps for later playback.
pub trait Recorder {
    /// `cents` is the intonation offset the note started with.
    fn note_on(&mut self, note: u8, velocity: u8, cents: i32, at: Duration);
    fn note_off(&mut self, note: u8, at: Duration);
}

/// A single entry of a recorded take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecordedEvent {
    NoteOn { note: u8, velocity: u8, cents: i32, at_ms: u64 },
    NoteOff { note: u8, at_ms: u64 },
}

/// A complete note reconstructed from a take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedNote {
    pub note: u8,
    pub velocity: u8,
    pub cents: i32,
    pub start_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
struct Take {
    recording: bool,
    events: Vec<RecordedEvent>,
}

/// In-memory recorder shared between the processing loop and the host.
///
/// Clones refer to the same take, so the host keeps one handle while the
/// dispatcher owns another. Events arriving while stopped are ignored.
#[derive(Debug, Clone, Default)]
pub struct NoteRecorder {
    take: Arc<Mutex<Take>>,
}

impl NoteRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Take> {
        // A poisoned take is still a valid list of events.
        self.take.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clears the previous take and starts recording.
    pub fn start(&self) {
        let mut take = self.lock();
        take.events.clear();
        take.recording = true;
    }

    pub fn stop(&self) {
        self.lock().recording = false;
    }

    pub fn is_recording(&self) -> bool {
        self.lock().recording
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.lock().events.clone()
    }

    /// Pairs note-on and note-off events into complete notes.
    ///
    /// A note still open at the end of the take is closed at the last event.
    pub fn notes(&self) -> Vec<RecordedNote> {
        let events = self.events();
        let end_ms = events
            .iter()
            .map(|event| match *event {
                RecordedEvent::NoteOn { at_ms, .. } | RecordedEvent::NoteOff { at_ms, .. } => at_ms,
            })
            .max()
            .unwrap_or(0);

        // The open note carries its duration as 0 until it is closed.
        let close = |mut note: RecordedNote, at_ms: u64| {
            note.duration_ms = at_ms.saturating_sub(note.start_ms);
            note
        };
        let mut notes = Vec::new();
        let mut open: Option<RecordedNote> = None;
        for event in events {
            match event {
                RecordedEvent::NoteOn { note, velocity, cents, at_ms } => {
                    if let Some(prev) = open.take() {
                        notes.push(close(prev, at_ms));
                    }
                    open = Some(RecordedNote {
                        note,
                        velocity,
                        cents,
                        start_ms: at_ms,
                        duration_ms: 0,
                    });
                }
                RecordedEvent::NoteOff { note, at_ms } => {
                    if let Some(prev) = open.filter(|prev| prev.note == note) {
                        notes.push(close(prev, at_ms));
                        open = None;
                    }
                }
            }
        }
        if let Some(prev) = open {
            notes.push(close(prev, end_ms));
        }
        notes
    }

    fn push(&self, event: RecordedEvent) {
        let mut take = self.lock();
        if take.recording {
            take.events.push(event);
        }
    }

    /// Saves the recorded events to a JSON file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json_string = serde_json::to_string_pretty(&self.events())?;
        let mut file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create {}", path.as_ref().display()))?;
        file.write_all(json_string.as_bytes())?;
        Ok(())
    }

    /// Loads a take saved by [`save_to_file`](Self::save_to_file). The
    /// returned recorder is stopped.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path.as_ref())
            .with_context(|| format!("Failed to open {}", path.as_ref().display()))?;
        let mut data = String::new();
        file.read_to_string(&mut data)?;
        let events: Vec<RecordedEvent> = serde_json::from_str(&data)?;
        Ok(Self {
            take: Arc::new(Mutex::new(Take {
                recording: false,
                events,
            })),
        })
    }
}

impl Recorder for NoteRecorder {
    fn note_on(&mut self, note: u8, velocity: u8, cents: i32, at: Duration) {
        self.push(RecordedEvent::NoteOn {
            note,
            velocity,
            cents,
            at_ms: at.as_millis() as u64,
        });
    }

    fn note_off(&mut self, note: u8, at: Duration) {
        self.push(RecordedEvent::NoteOff {
            note,
            at_ms: at.as_millis() as u64,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn ignores_events_while_stopped() {
        let mut recorder = NoteRecorder::new();
        recorder.note_on(60, 100, 0, ms(0));
        assert!(recorder.events().is_empty());

        recorder.start();
        recorder.note_on(60, 100, -7, ms(10));
        recorder.stop();
        recorder.note_off(60, ms(20));
        assert_eq!(
            recorder.events(),
            vec![RecordedEvent::NoteOn { note: 60, velocity: 100, cents: -7, at_ms: 10 }]
        );
    }

    #[test]
    fn clones_share_the_take() {
        let host = NoteRecorder::new();
        let mut dispatcher_side = host.clone();
        host.start();
        dispatcher_side.note_on(64, 90, 0, ms(5));
        assert_eq!(host.events().len(), 1);
    }

    #[test]
    fn notes_pair_on_and_off() {
        let mut recorder = NoteRecorder::new();
        recorder.start();
        recorder.note_on(60, 100, 0, ms(0));
        recorder.note_off(60, ms(250));
        recorder.note_on(62, 80, 14, ms(300));
        recorder.note_off(61, ms(350));
        recorder.note_off(62, ms(400));
        recorder.note_on(64, 70, -3, ms(420));
        recorder.note_on(65, 70, 22, ms(500));
        recorder.note_off(65, ms(650));
        recorder.note_on(67, 90, 0, ms(700));
        recorder.note_off(60, ms(760));

        assert_eq!(
            recorder.notes(),
            vec![
                RecordedNote { note: 60, velocity: 100, cents: 0, start_ms: 0, duration_ms: 250 },
                RecordedNote { note: 62, velocity: 80, cents: 14, start_ms: 300, duration_ms: 100 },
                RecordedNote { note: 64, velocity: 70, cents: -3, start_ms: 420, duration_ms: 80 },
                RecordedNote { note: 65, velocity: 70, cents: 22, start_ms: 500, duration_ms: 150 },
                RecordedNote { note: 67, velocity: 90, cents: 0, start_ms: 700, duration_ms: 60 },
            ]
        );
    }

    #[test]
    fn take_survives_a_file_round_trip() {
        let path = std::env::temp_dir().join(format!("vocalmidi-take-{}.json", std::process::id()));
        let mut recorder = NoteRecorder::new();
        recorder.start();
        recorder.note_on(69, 127, 31, ms(0));
        recorder.note_off(69, ms(90));
        recorder.save_to_file(&path).unwrap();

        let loaded = NoteRecorder::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(!loaded.is_recording());
        assert_eq!(loaded.events(), recorder.events());
    }
}
