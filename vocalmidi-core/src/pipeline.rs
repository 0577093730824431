//! # Processing Loop Module
//!
//! The real-time heartbeat: on every tick, pull one frame from the capture,
//! run the pitch detector and the note tracker, and hand the resulting event
//! to the dispatcher.
//!
//! ## Architecture
//! - **Ownership**: the pipeline owns the config, detector, tracker and
//!   dispatcher; nothing else touches them while it runs
//! - **Scheduling**: a crossbeam `tick` channel selected against a control
//!   channel; a late tick coalesces with the next one instead of queueing
//! - **Reporting**: copies of each tick's results go to the host over a
//!   bounded channel with `try_send`, so a slow display never stalls the loop
//! - **Fault isolation**: a panic inside a tick aborts that tick only

use crate::audio::AudioCapture;
use crate::config::{Config, ConfigError, OCTAVE_SHIFT_RANGE};
use crate::dispatcher::{EventDispatcher, OutputSettings};
use crate::pitch::YinDetector;
use crate::tracker::{NoteEvent, NoteTracker, TrackerState};
use crate::{Device, DeviceStatus, PitchEstimate};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

/// Commands accepted by a running pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    SetSensitivity(f32),
    SetOctaveShift(i8),
    SetChannel(u8),
    /// Releases any note and restarts the detector and tracker with a new
    /// config. `bufferSize` and `processInterval` must match the running capture.
    Reconfigure(Box<Config>),
    /// Releases any note and sends "all notes off" unconditionally.
    Panic,
    /// Releases any note and leaves the loop.
    Stop,
}

/// What one processed frame produced, copied out for display code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub timestamp: Duration,
    pub estimate: PitchEstimate,
    pub rms: f32,
    pub event: Option<NoteEvent>,
    pub state: TrackerState,
}

/// Messages from the pipeline to its host.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Tick(TickReport),
    Device { device: Device, status: DeviceStatus },
    /// A tick was aborted or a command was rejected.
    Error(String),
    /// The pipeline stopped; `released` is the note it turned off, if any.
    Stopped { released: Option<u8> },
}

/// The capture -> detector -> tracker -> dispatcher chain.
pub struct Pipeline<C: AudioCapture> {
    config: Config,
    capture: C,
    detector: YinDetector,
    tracker: NoteTracker,
    dispatcher: EventDispatcher,
    reports: Option<Sender<PipelineEvent>>,
    capture_status: DeviceStatus,
    midi_status: DeviceStatus,
}

impl<C: AudioCapture> std::fmt::Debug for Pipeline<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("tracker", &self.tracker.state())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl<C: AudioCapture> Pipeline<C> {
    /// Builds a pipeline, validating the config against the capture's
    /// sample rate.
    ///
    /// # Returns
    /// * `Ok(pipeline)` - Ready to tick
    /// * `Err(ConfigError)` - Fatal: the pipeline cannot start
    pub fn new(config: Config, capture: C, mut dispatcher: EventDispatcher) -> Result<Self, ConfigError> {
        let detector = YinDetector::new(&config, capture.sample_rate())?;
        let tracker = NoteTracker::new(&config);
        dispatcher.set_settings(OutputSettings::from(&config));
        Ok(Self {
            config,
            capture,
            detector,
            tracker,
            dispatcher,
            reports: None,
            capture_status: DeviceStatus::Available,
            midi_status: DeviceStatus::Available,
        })
    }

    /// Sends tick reports and status changes to the host.
    pub fn with_reports(mut self, reports: Sender<PipelineEvent>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker_state(&self) -> TrackerState {
        self.tracker.state()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    fn report(&mut self, event: PipelineEvent) {
        if let Some(reports) = &self.reports {
            match reports.try_send(event) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => {
                    log::debug!("[PIPELINE] Report receiver dropped");
                    self.reports = None;
                }
            }
        }
    }

    fn set_status(&mut self, device: Device, status: DeviceStatus) {
        let current = match device {
            Device::Capture => &mut self.capture_status,
            Device::Midi => &mut self.midi_status,
        };
        if *current == status {
            return;
        }
        match &status {
            DeviceStatus::Available => log::info!("[PIPELINE] {:?} device available", device),
            DeviceStatus::Unavailable(reason) => {
                log::warn!("[PIPELINE] {:?} device unavailable: {}", device, reason)
            }
        }
        *current = status.clone();
        self.report(PipelineEvent::Device { device, status });
    }

    /// Folds this tick's send failures and the sink's own health into the
    /// MIDI device status.
    fn sync_midi_status(&mut self, sent_something: bool) {
        let health = match self.dispatcher.take_midi_errors().pop() {
            Some(err) => Err(err),
            None => self.dispatcher.check_midi(),
        };
        match health {
            Err(err) => self.set_status(Device::Midi, DeviceStatus::Unavailable(err.to_string())),
            Ok(()) if sent_something => self.set_status(Device::Midi, DeviceStatus::Available),
            Ok(()) => {}
        }
    }

    /// Runs one processing tick.
    ///
    /// # Arguments
    /// * `now` - Time since the pipeline started; must not go backwards
    ///
    /// # Returns
    /// * `Some(report)` - A frame was processed
    /// * `None` - No frame was available, the device failed, or the tick was
    ///   aborted by a panic (reported as [`PipelineEvent::Error`])
    pub fn tick(&mut self, now: Duration) -> Option<TickReport> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process_frame(now)));
        match outcome {
            Ok(report) => report,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("[PIPELINE] Tick aborted: {}", message);
                self.report(PipelineEvent::Error(format!("tick aborted: {message}")));
                None
            }
        }
    }

    fn process_frame(&mut self, now: Duration) -> Option<TickReport> {
        let frame = match self.capture.get_buffer() {
            Ok(Some(frame)) => {
                self.set_status(Device::Capture, DeviceStatus::Available);
                frame
            }
            Ok(None) => return None,
            Err(err) => {
                self.set_status(Device::Capture, DeviceStatus::Unavailable(err.to_string()));
                return None;
            }
        };

        let rms = frame.rms();
        let estimate = self.detector.detect(&frame);
        let event = self.tracker.update(estimate.frequency, estimate.confidence, now);

        if let Some(event) = event {
            self.dispatcher.dispatch(event, rms, now);
        }
        self.sync_midi_status(event.is_some());

        let report = TickReport {
            timestamp: now,
            estimate,
            rms,
            event,
            state: self.tracker.state(),
        };
        self.report(PipelineEvent::Tick(report));
        Some(report)
    }

    /// Releases the sounding note (if any), centers the pitch bend and
    /// resets the tracker.
    ///
    /// # Returns
    /// * The note that was released, as tracked
    pub fn stop(&mut self, now: Duration) -> Option<u8> {
        let released = self.tracker.current_note();
        self.dispatcher.release_all(now);
        self.tracker.reset();
        self.sync_midi_status(true);
        released
    }

    /// Stops the current note and sends "all notes off" regardless of state.
    pub fn panic(&mut self, now: Duration) {
        log::info!("[PIPELINE] Panic: all notes off");
        self.dispatcher.panic(now);
        self.tracker.reset();
        self.sync_midi_status(true);
    }

    pub fn set_sensitivity(&mut self, sensitivity: f32) -> Result<(), ConfigError> {
        let candidate = Config {
            sensitivity,
            ..self.config.clone()
        };
        candidate.validate()?;
        self.config.sensitivity = sensitivity;
        self.tracker.set_sensitivity(sensitivity);
        Ok(())
    }

    pub fn set_octave_shift(&mut self, octave_shift: i8) -> Result<(), ConfigError> {
        if !OCTAVE_SHIFT_RANGE.contains(&octave_shift) {
            return Err(ConfigError::OutOfRange {
                name: "octaveShift",
                min: *OCTAVE_SHIFT_RANGE.start() as f32,
                max: *OCTAVE_SHIFT_RANGE.end() as f32,
                got: octave_shift as f32,
            });
        }
        self.config.octave_shift = octave_shift;
        self.dispatcher.set_octave_shift(octave_shift);
        Ok(())
    }

    pub fn set_channel(&mut self, channel: u8) -> Result<(), ConfigError> {
        if channel > 15 {
            return Err(ConfigError::OutOfRange {
                name: "channel",
                min: 0.0,
                max: 15.0,
                got: channel as f32,
            });
        }
        self.config.channel = channel;
        self.dispatcher.set_channel(channel);
        Ok(())
    }

    /// Swaps in a new configuration between ticks.
    ///
    /// The sounding note is released first; on error the old configuration
    /// stays in place and nothing is released. The capture keeps producing
    /// frames of its original size and rate, so a config that changes
    /// `buffer_size` or `process_interval_ms` is rejected.
    pub fn reconfigure(&mut self, config: Config, now: Duration) -> Result<(), ConfigError> {
        self.config.check_capture_unchanged(&config)?;
        let detector = YinDetector::new(&config, self.capture.sample_rate())?;
        self.stop(now);
        self.detector = detector;
        self.tracker = NoteTracker::new(&config);
        self.dispatcher.set_settings(OutputSettings::from(&config));
        self.config = config;
        log::info!("[PIPELINE] Reconfigured");
        Ok(())
    }

    /// Applies one control command.
    ///
    /// # Returns
    /// * `false` once the pipeline has stopped
    pub fn handle(&mut self, control: Control, now: Duration) -> bool {
        let result = match control {
            Control::SetSensitivity(value) => self.set_sensitivity(value),
            Control::SetOctaveShift(value) => self.set_octave_shift(value),
            Control::SetChannel(value) => self.set_channel(value),
            Control::Reconfigure(config) => self.reconfigure(*config, now),
            Control::Panic => {
                self.panic(now);
                Ok(())
            }
            Control::Stop => {
                let released = self.stop(now);
                self.report(PipelineEvent::Stopped { released });
                return false;
            }
        };
        if let Err(err) = result {
            log::warn!("[PIPELINE] Rejected command: {}", err);
            self.report(PipelineEvent::Error(err.to_string()));
        }
        true
    }

    /// Runs the loop until [`Control::Stop`] arrives or the control sender
    /// is dropped.
    pub fn run(&mut self, controls: &Receiver<Control>) {
        let start = Instant::now();
        let interval = self.config.process_interval();
        let ticker = crossbeam_channel::tick(interval);
        log::info!(
            "[PIPELINE] Running: {} Hz, {}-sample frames every {:?}",
            self.capture.sample_rate(),
            self.config.buffer_size,
            interval
        );

        loop {
            crossbeam_channel::select! {
                recv(ticker) -> _ => {
                    self.tick(start.elapsed());
                },
                recv(controls) -> msg => match msg {
                    Ok(control) => {
                        if !self.handle(control, start.elapsed()) {
                            break;
                        }
                    }
                    Err(_) => {
                        let released = self.stop(start.elapsed());
                        self.report(PipelineEvent::Stopped { released });
                        break;
                    }
                },
            }
        }
        log::info!("[PIPELINE] Stopped");
    }
}
