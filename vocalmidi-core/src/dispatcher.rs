//! # Event Dispatcher Module
//!
//! Routes note events from the tracker to the MIDI output, the monitoring
//! synthesizer and the recorder, and turns frame energy into velocity.
//!
//! The dispatcher remembers the note and channel it actually sent, so a
//! release always matches its note-on even if the octave shift or channel
//! changed while the note was sounding.

use crate::config::Config;
use crate::midi::{MidiOutput, PitchBend};
use crate::monitor::{Recorder, Synthesizer};
use crate::tracker::NoteEvent;
use crate::{DeviceError, tuning};
use std::time::Duration;

/// RMS floor applied before the level is converted to decibels.
pub const MIN_RMS: f32 = 1e-4;
/// Level that maps to velocity 0 before clamping; -50 dBFS and below give 1.
pub const VELOCITY_OFFSET_DB: f32 = 50.0;
/// Velocity steps per decibel above the offset.
pub const VELOCITY_PER_DB: f32 = 2.5;

/// Converts an RMS level to dBFS, flooring it at [`MIN_RMS`] (-80 dB).
pub fn rms_to_db(rms: f32) -> f32 {
    let rms = if rms.is_finite() { rms.max(MIN_RMS) } else { MIN_RMS };
    20.0 * rms.log10()
}

/// Maps an RMS level to a MIDI velocity.
///
/// Velocity is `(dB + 50) * 2.5`, rounded and clamped to `1..=127`; a
/// full-scale sine (-3 dB) plays at 117 and -10 dB at 100.
pub fn velocity_from_rms(rms: f32) -> u8 {
    ((rms_to_db(rms) + VELOCITY_OFFSET_DB) * VELOCITY_PER_DB)
        .round()
        .clamp(1.0, 127.0) as u8
}

/// Per-event output settings; the live-adjustable subset of [`Config`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputSettings {
    pub channel: u8,
    pub octave_shift: i8,
    pub base_velocity: u8,
    pub velocity_from_amplitude: bool,
    pub pitch_bend_range: f32,
}

impl From<&Config> for OutputSettings {
    fn from(config: &Config) -> Self {
        Self {
            channel: config.channel,
            octave_shift: config.octave_shift,
            base_velocity: config.base_velocity,
            velocity_from_amplitude: config.velocity_from_amplitude,
            pitch_bend_range: config.pitch_bend_range,
        }
    }
}

/// A note as it was sent to the outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentNote {
    pub channel: u8,
    pub note: u8,
    pub velocity: u8,
}

/// Owns the output collaborators and fans events out to them.
pub struct EventDispatcher {
    midi: Box<dyn MidiOutput>,
    synth: Option<Box<dyn Synthesizer>>,
    recorder: Option<Box<dyn Recorder>>,
    settings: OutputSettings,
    sounding: Option<SentNote>,
    midi_errors: Vec<DeviceError>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("settings", &self.settings)
            .field("sounding", &self.sounding)
            .field("synth", &self.synth.is_some())
            .field("recorder", &self.recorder.is_some())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new(midi: Box<dyn MidiOutput>, config: &Config) -> Self {
        Self {
            midi,
            synth: None,
            recorder: None,
            settings: OutputSettings::from(config),
            sounding: None,
            midi_errors: Vec::new(),
        }
    }

    pub fn with_synth(mut self, synth: Box<dyn Synthesizer>) -> Self {
        self.synth = Some(synth);
        self
    }

    pub fn with_recorder(mut self, recorder: Box<dyn Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn settings(&self) -> OutputSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: OutputSettings) {
        self.settings = settings;
    }

    pub fn set_channel(&mut self, channel: u8) {
        self.settings.channel = channel.min(15);
    }

    pub fn set_octave_shift(&mut self, octave_shift: i8) {
        self.settings.octave_shift = octave_shift;
    }

    /// The note currently held on the outputs, if any.
    pub fn sounding(&self) -> Option<SentNote> {
        self.sounding
    }

    /// Asks the MIDI sink for failures it observed outside of a send.
    pub fn check_midi(&mut self) -> Result<(), DeviceError> {
        self.midi.check()
    }

    /// Drains the MIDI failures seen since the last call.
    pub fn take_midi_errors(&mut self) -> Vec<DeviceError> {
        std::mem::take(&mut self.midi_errors)
    }

    fn velocity(&self, rms: f32) -> u8 {
        if self.settings.velocity_from_amplitude {
            velocity_from_rms(rms)
        } else {
            self.settings.base_velocity.clamp(1, 127)
        }
    }

    /// Records a sink failure without interrupting the event.
    fn report(&mut self, result: Result<(), DeviceError>) {
        if let Err(err) = result {
            log::warn!("[DISPATCH] MIDI output failed: {}", err);
            self.midi_errors.push(err);
        }
    }

    /// Sends one tracker event to every output.
    ///
    /// # Arguments
    /// * `event` - The tracker's event for this frame
    /// * `rms` - RMS of the frame that produced it (for velocity)
    /// * `at` - Timestamp forwarded to the recorder
    pub fn dispatch(&mut self, event: NoteEvent, rms: f32, at: Duration) {
        match event {
            NoteEvent::NoteOn { note, cents } => self.start_note(note, cents, rms, at),
            NoteEvent::NoteChange { new_note, cents, .. } => {
                // Release first: the old note must never be heard after the change.
                self.release(at);
                self.start_note(new_note, cents, rms, at);
            }
            NoteEvent::NoteOff { .. } => self.release(at),
            NoteEvent::PitchBend { cents, .. } => {
                if let Some(sent) = self.sounding {
                    let bend = PitchBend::from_cents(cents, self.settings.pitch_bend_range);
                    let result = self.midi.send_pitch_bend(sent.channel, bend);
                    self.report(result);
                    if let Some(synth) = &mut self.synth {
                        synth.update_pitch(sent.note, cents);
                    }
                }
            }
        }
    }

    fn start_note(&mut self, note: u8, cents: i32, rms: f32, at: Duration) {
        let sent = SentNote {
            channel: self.settings.channel,
            note: tuning::shift_octaves(note, self.settings.octave_shift),
            velocity: self.velocity(rms),
        };

        let result = self.midi.send_note_on(sent.channel, sent.note, sent.velocity);
        self.report(result);
        let result = self.midi.reset_pitch_bend(sent.channel);
        self.report(result);
        if cents != 0 {
            let bend = PitchBend::from_cents(cents, self.settings.pitch_bend_range);
            let result = self.midi.send_pitch_bend(sent.channel, bend);
            self.report(result);
        }

        if let Some(synth) = &mut self.synth {
            synth.note_on(sent.note, sent.velocity);
            if cents != 0 {
                synth.update_pitch(sent.note, cents);
            }
        }
        if let Some(recorder) = &mut self.recorder {
            recorder.note_on(sent.note, sent.velocity, cents, at);
        }
        self.sounding = Some(sent);
    }

    /// Releases the sounding note, if any, and centers the pitch bend.
    pub fn release(&mut self, at: Duration) {
        let Some(sent) = self.sounding.take() else {
            return;
        };
        let result = self.midi.send_note_off(sent.channel, sent.note);
        self.report(result);
        let result = self.midi.reset_pitch_bend(sent.channel);
        self.report(result);
        if let Some(synth) = &mut self.synth {
            synth.note_off(sent.note);
        }
        if let Some(recorder) = &mut self.recorder {
            recorder.note_off(sent.note, at);
        }
    }

    /// Shutdown: releases the sounding note, or just centers the bend when
    /// nothing is sounding.
    pub fn release_all(&mut self, at: Duration) {
        if self.sounding.is_some() {
            self.release(at);
        } else {
            let result = self.midi.reset_pitch_bend(self.settings.channel);
            self.report(result);
        }
    }

    /// Releases everything and sends "all notes off" regardless of state.
    pub fn panic(&mut self, at: Duration) {
        let previous_channel = self.sounding.map(|sent| sent.channel);
        self.release(at);
        let channel = self.settings.channel;
        let result = self.midi.all_notes_off(channel);
        self.report(result);
        let result = self.midi.reset_pitch_bend(channel);
        self.report(result);
        if let Some(previous) = previous_channel.filter(|&previous| previous != channel) {
            let result = self.midi.all_notes_off(previous);
            self.report(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{CC_ALL_NOTES_OFF, CC_ALL_SOUND_OFF, MidiMessage};
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeSink(Arc<Mutex<Vec<MidiMessage>>>);

    impl MidiOutput for FakeSink {
        fn send(&mut self, message: MidiMessage) -> Result<(), DeviceError> {
            self.0.lock().unwrap().push(message);
            Ok(())
        }
    }

    struct BrokenSink;

    impl MidiOutput for BrokenSink {
        fn send(&mut self, _message: MidiMessage) -> Result<(), DeviceError> {
            Err(DeviceError::Disconnected("unplugged".into()))
        }
    }

    #[derive(Clone, Default)]
    struct FakeSynth(Arc<Mutex<Vec<String>>>);

    impl Synthesizer for FakeSynth {
        fn note_on(&mut self, note: u8, velocity: u8) {
            self.0.lock().unwrap().push(format!("on {note} {velocity}"));
        }
        fn note_off(&mut self, note: u8) {
            self.0.lock().unwrap().push(format!("off {note}"));
        }
        fn update_pitch(&mut self, note: u8, cents: i32) {
            self.0.lock().unwrap().push(format!("pitch {note} {cents}"));
        }
    }

    fn dispatcher(config: &Config) -> (EventDispatcher, Arc<Mutex<Vec<MidiMessage>>>) {
        let sink = FakeSink::default();
        let log = sink.0.clone();
        (EventDispatcher::new(Box::new(sink), config), log)
    }

    fn note_on_velocities(log: &Arc<Mutex<Vec<MidiMessage>>>) -> Vec<u8> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|m| match *m {
                MidiMessage::NoteOn { velocity, .. } => Some(velocity),
                _ => None,
            })
            .collect()
    }

    const T: Duration = Duration::ZERO;

    /// Defaults with velocity pinned to `base_velocity`.
    fn fixed_velocity() -> Config {
        Config { velocity_from_amplitude: false, ..Config::default() }
    }

    #[test]
    fn velocity_follows_the_decibel_level() {
        assert!((rms_to_db(0.0) + 80.0).abs() < 1e-3);
        assert!((rms_to_db(f32::NAN) + 80.0).abs() < 1e-3);
        assert_eq!(velocity_from_rms(0.0), 1);
        assert_eq!(velocity_from_rms(f32::NAN), 1);
        // -50 dB maps to zero and clamps to 1.
        assert_eq!(velocity_from_rms(10f32.powf(-2.5)), 1);
        assert_eq!(velocity_from_rms(0.1), 75);
        assert_eq!(velocity_from_rms(10f32.powf(-0.5)), 100);
        assert_eq!(velocity_from_rms(1.0), 125);
        assert_eq!(velocity_from_rms(2.0), 127);
    }

    #[test]
    fn note_on_sends_note_then_centered_bend_then_offset() {
        let (mut d, log) = dispatcher(&fixed_velocity());
        d.dispatch(NoteEvent::NoteOn { note: 69, cents: 25 }, 0.1, T);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                MidiMessage::NoteOn { channel: 0, note: 69, velocity: 100 },
                MidiMessage::PitchBend { channel: 0, bend: PitchBend::CENTER },
                MidiMessage::PitchBend { channel: 0, bend: PitchBend::from_cents(25, 2.0) },
            ]
        );
        assert_eq!(d.sounding(), Some(SentNote { channel: 0, note: 69, velocity: 100 }));
    }

    #[test]
    fn note_change_releases_the_old_note_first() {
        let (mut d, log) = dispatcher(&fixed_velocity());
        d.dispatch(NoteEvent::NoteOn { note: 60, cents: 0 }, 0.1, T);
        log.lock().unwrap().clear();

        d.dispatch(NoteEvent::NoteChange { old_note: 60, new_note: 72, cents: 0 }, 0.1, T);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                MidiMessage::NoteOff { channel: 0, note: 60 },
                MidiMessage::PitchBend { channel: 0, bend: PitchBend::CENTER },
                MidiMessage::NoteOn { channel: 0, note: 72, velocity: 100 },
                MidiMessage::PitchBend { channel: 0, bend: PitchBend::CENTER },
            ]
        );
    }

    #[test]
    fn pitch_bend_sends_no_note_messages() {
        let (mut d, log) = dispatcher(&fixed_velocity());
        d.dispatch(NoteEvent::NoteOn { note: 60, cents: 0 }, 0.1, T);
        log.lock().unwrap().clear();
        d.dispatch(NoteEvent::PitchBend { note: 60, cents: -20 }, 0.1, T);
        assert_eq!(
            *log.lock().unwrap(),
            vec![MidiMessage::PitchBend { channel: 0, bend: PitchBend::from_cents(-20, 2.0) }]
        );
    }

    #[test]
    fn octave_shift_applies_and_clamps() {
        for shift in -3..=3i8 {
            let config = Config { octave_shift: shift, ..fixed_velocity() };
            for note in [0u8, 30, 60, 100, 127] {
                let (mut d, log) = dispatcher(&config);
                d.dispatch(NoteEvent::NoteOn { note, cents: 0 }, 0.1, T);
                let expected = (note as i32 + 12 * shift as i32).clamp(0, 127) as u8;
                assert_eq!(
                    log.lock().unwrap()[0],
                    MidiMessage::NoteOn { channel: 0, note: expected, velocity: 100 }
                );
            }
        }
    }

    #[test]
    fn release_uses_the_note_and_channel_that_were_sent() {
        let (mut d, log) = dispatcher(&fixed_velocity());
        d.dispatch(NoteEvent::NoteOn { note: 60, cents: 0 }, 0.1, T);
        d.set_octave_shift(1);
        d.set_channel(5);
        log.lock().unwrap().clear();

        d.dispatch(NoteEvent::NoteOff { note: 60 }, 0.0, T);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                MidiMessage::NoteOff { channel: 0, note: 60 },
                MidiMessage::PitchBend { channel: 0, bend: PitchBend::CENTER },
            ]
        );
        assert_eq!(d.sounding(), None);
    }

    #[test]
    fn velocity_follows_amplitude_by_default() {
        let (mut d, log) = dispatcher(&Config::default());
        d.dispatch(NoteEvent::NoteOn { note: 60, cents: 0 }, 0.1, T);
        d.dispatch(NoteEvent::NoteChange { old_note: 60, new_note: 62, cents: 0 }, 1.0, T);
        assert_eq!(note_on_velocities(&log), vec![75, 125]);
    }

    #[test]
    fn panic_sends_all_notes_off_even_when_idle() {
        let (mut d, log) = dispatcher(&Config { channel: 2, ..fixed_velocity() });
        d.panic(T);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                MidiMessage::ControlChange { channel: 2, control: CC_ALL_SOUND_OFF, value: 0 },
                MidiMessage::ControlChange { channel: 2, control: CC_ALL_NOTES_OFF, value: 0 },
                MidiMessage::PitchBend { channel: 2, bend: PitchBend::CENTER },
            ]
        );
    }

    #[test]
    fn release_all_releases_or_centers() {
        let (mut d, log) = dispatcher(&fixed_velocity());
        d.release_all(T);
        d.dispatch(NoteEvent::NoteOn { note: 62, cents: 0 }, 0.1, T);
        log.lock().unwrap().clear();
        d.release_all(T);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                MidiMessage::NoteOff { channel: 0, note: 62 },
                MidiMessage::PitchBend { channel: 0, bend: PitchBend::CENTER },
            ]
        );
        assert_eq!(d.sounding(), None);
    }

    #[test]
    fn synth_mirrors_the_outgoing_notes() {
        let synth = FakeSynth::default();
        let calls = synth.0.clone();
        let (d, _) = dispatcher(&Config { octave_shift: -1, ..fixed_velocity() });
        let mut d = d.with_synth(Box::new(synth));
        d.dispatch(NoteEvent::NoteOn { note: 69, cents: 10 }, 0.1, T);
        d.dispatch(NoteEvent::PitchBend { note: 69, cents: -8 }, 0.1, T);
        d.dispatch(NoteEvent::NoteOff { note: 69 }, 0.0, T);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["on 57 100", "pitch 57 10", "pitch 57 -8", "off 57"]
        );
    }

    #[test]
    fn recorder_gets_the_sent_note_with_its_cents() {
        let recorder = crate::monitor::NoteRecorder::new();
        recorder.start();
        let (d, _) = dispatcher(&Config { octave_shift: 1, ..fixed_velocity() });
        let mut d = d.with_recorder(Box::new(recorder.clone()));
        d.dispatch(NoteEvent::NoteOn { note: 69, cents: -12 }, 0.1, Duration::from_millis(40));
        d.dispatch(NoteEvent::NoteOff { note: 69 }, 0.0, Duration::from_millis(90));
        assert_eq!(
            recorder.notes(),
            vec![crate::monitor::RecordedNote {
                note: 81,
                velocity: 100,
                cents: -12,
                start_ms: 40,
                duration_ms: 50,
            }]
        );
    }

    #[test]
    fn broken_sink_is_reported_but_state_moves_on() {
        let mut d = EventDispatcher::new(Box::new(BrokenSink), &fixed_velocity());
        d.dispatch(NoteEvent::NoteOn { note: 60, cents: 0 }, 0.1, T);
        assert!(d.sounding().is_some());
        assert_eq!(d.take_midi_errors().len(), 2);
        d.dispatch(NoteEvent::NoteOff { note: 60 }, 0.0, T);
        assert!(d.sounding().is_none());
        assert_eq!(d.take_midi_errors().len(), 2);
        assert!(d.take_midi_errors().is_empty());
    }
}
