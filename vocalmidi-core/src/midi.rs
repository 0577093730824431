//! # MIDI Output Module
//!
//! Channel voice messages, the [`MidiOutput`] sink contract used by the
//! dispatcher, a midir-backed device sink, and a queue that moves device
//! writes off the processing thread.

use crate::DeviceError;
use crossbeam_channel::{Receiver, Sender, unbounded};
use midir::{MidiOutput as MidirClient, MidiOutputConnection};
use std::thread::{self, JoinHandle};

const CLIENT_NAME: &str = "vocalmidi";

/// Controller number of "All Sound Off".
pub const CC_ALL_SOUND_OFF: u8 = 120;
/// Controller number of "All Notes Off".
pub const CC_ALL_NOTES_OFF: u8 = 123;

/// A 14-bit MIDI pitch-bend value, 8192 being the center.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitchBend(u16);

impl PitchBend {
    pub const CENTER: PitchBend = PitchBend(8192);
    pub const MAX: u16 = 16383;

    /// Clamps a raw value into the 14-bit range.
    pub fn new(value: u16) -> Self {
        Self(value.min(Self::MAX))
    }

    /// Scales a cents offset so that `range_semitones` maps to full deflection.
    ///
    /// # Arguments
    /// * `cents` - Offset from the note in hundredths of a semitone
    /// * `range_semitones` - Receiver's pitch-bend range (commonly 2)
    pub fn from_cents(cents: i32, range_semitones: f32) -> Self {
        if range_semitones <= 0.0 || !range_semitones.is_finite() {
            return Self::CENTER;
        }
        let fraction = (cents as f32 / 100.0) / range_semitones;
        let value = (8192.0 + fraction * 8192.0).round().clamp(0.0, Self::MAX as f32);
        Self(value as u16)
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    pub fn lsb(&self) -> u8 {
        (self.0 & 0x7F) as u8
    }

    pub fn msb(&self) -> u8 {
        (self.0 >> 7) as u8
    }
}

/// A MIDI channel voice message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    PitchBend { channel: u8, bend: PitchBend },
    ControlChange { channel: u8, control: u8, value: u8 },
}

impl MidiMessage {
    /// Encodes the message as raw MIDI bytes.
    pub fn to_bytes(&self) -> [u8; 3] {
        match *self {
            MidiMessage::NoteOn { channel, note, velocity } => {
                [0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            MidiMessage::NoteOff { channel, note } => [0x80 | (channel & 0x0F), note & 0x7F, 0],
            MidiMessage::PitchBend { channel, bend } => {
                [0xE0 | (channel & 0x0F), bend.lsb(), bend.msb()]
            }
            MidiMessage::ControlChange { channel, control, value } => {
                [0xB0 | (channel & 0x0F), control & 0x7F, value & 0x7F]
            }
        }
    }
}

/// The sink the dispatcher writes to.
///
/// Implementors only provide [`send`](MidiOutput::send); the note and bend
/// helpers build the messages.
pub trait MidiOutput {
    fn send(&mut self, message: MidiMessage) -> Result<(), DeviceError>;

    /// Reports a failure the sink observed outside of [`send`](MidiOutput::send),
    /// such as a write that failed on another thread. Sinks that fail
    /// synchronously keep the default.
    fn check(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn send_note_on(&mut self, channel: u8, note: u8, velocity: u8) -> Result<(), DeviceError> {
        self.send(MidiMessage::NoteOn { channel, note, velocity })
    }

    fn send_note_off(&mut self, channel: u8, note: u8) -> Result<(), DeviceError> {
        self.send(MidiMessage::NoteOff { channel, note })
    }

    fn send_pitch_bend(&mut self, channel: u8, bend: PitchBend) -> Result<(), DeviceError> {
        self.send(MidiMessage::PitchBend { channel, bend })
    }

    fn reset_pitch_bend(&mut self, channel: u8) -> Result<(), DeviceError> {
        self.send_pitch_bend(channel, PitchBend::CENTER)
    }

    /// Sends "All Sound Off" and "All Notes Off" on the channel.
    fn all_notes_off(&mut self, channel: u8) -> Result<(), DeviceError> {
        self.send(MidiMessage::ControlChange {
            channel,
            control: CC_ALL_SOUND_OFF,
            value: 0,
        })?;
        self.send(MidiMessage::ControlChange {
            channel,
            control: CC_ALL_NOTES_OFF,
            value: 0,
        })
    }
}

impl<M: MidiOutput + ?Sized> MidiOutput for Box<M> {
    fn send(&mut self, message: MidiMessage) -> Result<(), DeviceError> {
        (**self).send(message)
    }

    fn check(&mut self) -> Result<(), DeviceError> {
        (**self).check()
    }
}

/// A sink that drops every message, used when no port is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

impl MidiOutput for NullOutput {
    fn send(&mut self, _message: MidiMessage) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Lists all available MIDI output ports.
pub fn list_output_ports() -> Result<Vec<String>, DeviceError> {
    let midi_out = MidirClient::new(CLIENT_NAME)
        .map_err(|err| DeviceError::Disconnected(format!("Failed to initialize MIDI output: {err}")))?;
    Ok(midi_out
        .ports()
        .iter()
        .filter_map(|port| midi_out.port_name(port).ok())
        .collect())
}

/// Handles MIDI output to a connected device through midir.
pub struct MidirOutput {
    connection: MidiOutputConnection,
    port_name: String,
}

impl std::fmt::Debug for MidirOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidirOutput")
            .field("port_name", &self.port_name)
            .finish()
    }
}

impl MidirOutput {
    /// Connects to the first port whose name equals or contains `port_name`.
    pub fn connect(port_name: &str) -> Result<Self, DeviceError> {
        let midi_out = MidirClient::new(CLIENT_NAME)
            .map_err(|err| DeviceError::Disconnected(format!("Failed to create MIDI output: {err}")))?;

        let ports = midi_out.ports();
        let named: Vec<_> = ports
            .iter()
            .filter_map(|port| midi_out.port_name(port).ok().map(|name| (port, name)))
            .collect();
        let (port, name) = named
            .iter()
            .find(|(_, name)| name == port_name)
            .or_else(|| named.iter().find(|(_, name)| name.contains(port_name)))
            .ok_or_else(|| DeviceError::Disconnected(format!("MIDI port '{port_name}' not found")))?;
        let name = name.clone();

        let connection = midi_out
            .connect(port, "vocalmidi-out")
            .map_err(|err| DeviceError::Disconnected(format!("Failed to connect to MIDI port: {err}")))?;
        log::info!("Connected to MIDI output '{}'", name);

        Ok(Self {
            connection,
            port_name: name,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl MidiOutput for MidirOutput {
    fn send(&mut self, message: MidiMessage) -> Result<(), DeviceError> {
        self.connection
            .send(&message.to_bytes())
            .map_err(|err| DeviceError::Write(format!("Failed to send MIDI message: {err}")))
    }
}

/// Moves an output onto a writer thread so senders never wait on the device.
///
/// Messages are forwarded in order through an unbounded channel. The writer
/// reports each change between a healthy and a failing device back over a
/// second channel; [`check`](MidiOutput::check) drains it and returns the
/// failure while the device keeps failing. A send itself only fails once the
/// writer has gone away.
pub struct QueuedOutput {
    sender: Option<Sender<MidiMessage>>,
    health: Receiver<Result<(), DeviceError>>,
    failure: Option<DeviceError>,
    writer: Option<JoinHandle<()>>,
}

impl QueuedOutput {
    pub fn spawn<M>(output: M) -> Self
    where
        M: MidiOutput + Send + 'static,
    {
        Self::spawn_with(move || Ok(output))
    }

    /// Builds the output on the writer thread itself, for device handles
    /// that cannot be moved between threads.
    ///
    /// If `make_output` fails, the failure is reported through
    /// [`check`](MidiOutput::check) and queued messages are discarded.
    pub fn spawn_with<F, M>(make_output: F) -> Self
    where
        F: FnOnce() -> Result<M, DeviceError> + Send + 'static,
        M: MidiOutput,
    {
        let (sender, receiver) = unbounded::<MidiMessage>();
        let (health_tx, health) = unbounded::<Result<(), DeviceError>>();
        let writer = thread::Builder::new()
            .name("midi-writer".into())
            .spawn(move || {
                let mut output = match make_output() {
                    Ok(output) => output,
                    Err(err) => {
                        log::error!("[MIDI] {}", err);
                        let _ = health_tx.send(Err(err));
                        receiver.iter().for_each(drop);
                        return;
                    }
                };
                let mut healthy = true;
                for message in receiver {
                    match output.send(message) {
                        Ok(()) if !healthy => {
                            log::info!("[MIDI] Output recovered");
                            healthy = true;
                            let _ = health_tx.send(Ok(()));
                        }
                        Ok(()) => {}
                        Err(err) => {
                            if healthy {
                                log::warn!("[MIDI] {}", err);
                                healthy = false;
                                let _ = health_tx.send(Err(err));
                            }
                        }
                    }
                }
                log::debug!("[MIDI] Writer thread finished");
            })
            .ok();
        if writer.is_none() {
            log::error!("[MIDI] Failed to spawn writer thread; output disabled");
        }
        Self {
            sender: writer.as_ref().map(|_| sender),
            health,
            failure: None,
            writer,
        }
    }
}

impl MidiOutput for QueuedOutput {
    fn send(&mut self, message: MidiMessage) -> Result<(), DeviceError> {
        match &self.sender {
            Some(sender) => sender
                .send(message)
                .map_err(|_| DeviceError::Disconnected("MIDI writer thread stopped".into())),
            None => Err(DeviceError::Disconnected("MIDI writer thread not running".into())),
        }
    }

    fn check(&mut self) -> Result<(), DeviceError> {
        for change in self.health.try_iter() {
            self.failure = change.err();
        }
        match (&self.failure, &self.sender) {
            (Some(err), _) => Err(err.clone()),
            (None, None) => Err(DeviceError::Disconnected("MIDI writer thread not running".into())),
            (None, Some(_)) => Ok(()),
        }
    }
}

impl Drop for QueuedOutput {
    /// Flushes queued messages before returning.
    fn drop(&mut self) {
        self.sender.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}
