//! # vocalmidi - Voice to MIDI
//!
//! Command-line host for the vocalmidi pipeline.
//!
//! ## Architecture
//! - **Main Thread**: reads commands from stdin and prints note events
//! - **Pipeline Thread**: owns the audio stream and runs the processing loop
//! - **MIDI Writer Thread**: owns the MIDI connection
//! - **Communication**: crossbeam channels in both directions

mod cli;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use crossbeam_channel::{Receiver, Sender};
use std::io::BufRead;
use std::path::Path;
use std::thread::{self, JoinHandle};
use vocalmidi_core::audio::{self, CpalCapture};
use vocalmidi_core::dispatcher::EventDispatcher;
use vocalmidi_core::midi::{self, MidirOutput, NullOutput, QueuedOutput};
use vocalmidi_core::monitor::NoteRecorder;
use vocalmidi_core::pipeline::{Control, Pipeline, PipelineEvent};
use vocalmidi_core::{Config, DeviceError, DeviceStatus, NoteEvent, tuning};

use cli::Cli;

/// Reports buffered between the pipeline and the printer.
const REPORT_QUEUE_DEPTH: usize = 256;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    if cli.list_ports {
        for port in midi::list_output_ports()? {
            println!("{port}");
        }
        return Ok(());
    }
    if cli.list_inputs {
        for device in audio::list_input_devices()? {
            println!("{device}");
        }
        return Ok(());
    }
    if let Some(path) = &cli.write_default_config {
        Config::default().save_to_file(path)?;
        log::info!("Wrote default config to {}", path.display());
        return Ok(());
    }

    let config = cli.resolve_config()?;
    let recorder = NoteRecorder::new();
    if cli.record.is_some() {
        recorder.start();
    }

    let (control_tx, control_rx) = crossbeam_channel::unbounded::<Control>();
    let (report_tx, report_rx) = crossbeam_channel::bounded::<PipelineEvent>(REPORT_QUEUE_DEPTH);
    let worker = spawn_pipeline(config, cli.port.clone(), recorder.clone(), control_rx, report_tx)?;
    let lines = spawn_stdin_reader()?;

    println!("Listening. {}", cli::COMMANDS_HELP);
    drive(&report_rx, &lines, &control_tx);

    let outcome = worker
        .join()
        .map_err(|_| anyhow!("Pipeline thread panicked"))?;

    if let Some(path) = &cli.record {
        recorder.stop();
        save_recording(&recorder, path)?;
    }
    outcome
}

/// Starts the pipeline thread. The audio stream cannot move between threads,
/// so the capture is opened on the pipeline thread itself.
fn spawn_pipeline(
    config: Config,
    port: Option<String>,
    recorder: NoteRecorder,
    controls: Receiver<Control>,
    reports: Sender<PipelineEvent>,
) -> Result<JoinHandle<Result<()>>> {
    let handle = thread::Builder::new()
        .name("pipeline".into())
        .spawn(move || -> Result<()> {
            let capture = CpalCapture::start(config.buffer_size, config.process_interval_ms)
                .context("Failed to start audio capture")?;
            log::info!("Capturing from '{}'", capture.device_name());

            let output = match port {
                Some(name) => QueuedOutput::spawn_with(move || open_midi_port(&name)),
                None => {
                    log::warn!("No MIDI port given (--port); notes are only printed");
                    QueuedOutput::spawn(NullOutput)
                }
            };
            let dispatcher = EventDispatcher::new(Box::new(output), &config)
                .with_recorder(Box::new(recorder));
            let mut pipeline = Pipeline::new(config, capture, dispatcher)?.with_reports(reports);
            pipeline.run(&controls);
            Ok(())
        })
        .context("Failed to spawn pipeline thread")?;
    Ok(handle)
}

/// Runs on the MIDI writer thread; a failure there is reported by the
/// pipeline as the MIDI device being unavailable.
fn open_midi_port(name: &str) -> Result<MidirOutput, DeviceError> {
    let output = MidirOutput::connect(name)?;
    log::info!("Sending MIDI to '{}'", output.port_name());
    Ok(output)
}

fn spawn_stdin_reader() -> Result<Receiver<String>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("Failed to spawn stdin thread")?;
    Ok(rx)
}

/// Forwards typed commands and prints reports until the pipeline exits.
fn drive(reports: &Receiver<PipelineEvent>, lines: &Receiver<String>, controls: &Sender<Control>) {
    let mut lines = Some(lines.clone());
    let never = crossbeam_channel::never();
    loop {
        crossbeam_channel::select! {
            recv(reports) -> msg => match msg {
                Ok(event) => print_event(&event),
                Err(_) => break,
            },
            recv(lines.as_ref().unwrap_or(&never)) -> line => {
                // End of input stops the pipeline like an empty line.
                let command = line.map_or(Ok(Control::Stop), |line| cli::parse_command(&line));
                match command {
                    Ok(Control::Stop) => {
                        lines = None;
                        let _ = controls.send(Control::Stop);
                    }
                    Ok(control) => {
                        let _ = controls.send(control);
                    }
                    Err(err) => eprintln!("{err}"),
                }
            },
        }
    }
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::Tick(report) => {
            let Some(note_event) = report.event else {
                return;
            };
            match note_event {
                NoteEvent::NoteOn { note, cents } => {
                    println!("on     {:<4} {:+3}c", tuning::note_name(note), cents)
                }
                NoteEvent::NoteChange { old_note, new_note, cents } => println!(
                    "change {:<4} -> {:<4} {:+3}c",
                    tuning::note_name(old_note),
                    tuning::note_name(new_note),
                    cents
                ),
                NoteEvent::NoteOff { note } => println!("off    {}", tuning::note_name(note)),
                NoteEvent::PitchBend { .. } => {}
            }
        }
        PipelineEvent::Device { device, status } => match status {
            DeviceStatus::Available => println!("{device:?} device available"),
            DeviceStatus::Unavailable(reason) => println!("{device:?} device unavailable: {reason}"),
        },
        PipelineEvent::Error(message) => eprintln!("error: {message}"),
        PipelineEvent::Stopped { released } => match released {
            Some(note) => println!("stopped (released {})", tuning::note_name(*note)),
            None => println!("stopped"),
        },
    }
}

fn save_recording(recorder: &NoteRecorder, path: &Path) -> Result<()> {
    let notes = recorder.notes();
    recorder.save_to_file(path)?;
    log::info!("Saved {} recorded notes to {}", notes.len(), path.display());
    Ok(())
}
