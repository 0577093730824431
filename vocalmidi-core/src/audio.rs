//! # Audio Capture Module
//!
//! This module handles real-time audio capture using CPAL (Cross-Platform Audio Library).
//! It provides the [`AudioCapture`] contract the processing loop pulls frames from,
//! a cpal-backed microphone source and a channel-backed source for tests and replay.
//!
//! ## Features
//! - Automatic audio device selection
//! - Mono downmix of multi-channel input
//! - Sliding analysis window published once per processing interval
//! - Allocation-free audio callback: samples land in a preallocated ring and
//!   are copied into a fixed pool of frame buffers that the processing thread
//!   hands back after use

use crate::{AudioFrame, DeviceError};
use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SupportedStreamConfigRange};
use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};

/// Preferred capture sample rate in Hz.
pub const TARGET_SAMPLE_RATE: u32 = 44_100;

/// Frame buffers cycling between the audio callback and the processing tick.
const FRAME_POOL_SIZE: usize = 8;

/// A source of fixed-length audio frames.
pub trait AudioCapture {
    /// Sample rate of the frames this source produces.
    fn sample_rate(&self) -> u32;

    /// Returns the next frame if one is ready.
    ///
    /// # Returns
    /// * `Ok(Some(frame))` - A frame for this tick
    /// * `Ok(None)` - Nothing new yet; the tick is skipped
    /// * `Err(DeviceError)` - The device reported a failure since the last call
    fn get_buffer(&mut self) -> Result<Option<AudioFrame>, DeviceError>;
}

impl<C: AudioCapture + ?Sized> AudioCapture for Box<C> {
    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn get_buffer(&mut self) -> Result<Option<AudioFrame>, DeviceError> {
        (**self).get_buffer()
    }
}

/// The consumer side of the callback hand-off.
///
/// Full buffers arrive on `filled`; every buffer taken off it goes back on
/// `recycle` once its samples are copied into an [`AudioFrame`].
#[derive(Debug)]
struct FrameQueue {
    filled: Receiver<Vec<f32>>,
    recycle: Sender<Vec<f32>>,
    errors: Receiver<String>,
}

impl FrameQueue {
    /// Takes the newest frame, dropping stale ones.
    ///
    /// Keeping only the newest frame bounds latency when the consumer falls
    /// behind the producer.
    fn newest(&self, sample_rate: u32) -> Result<Option<AudioFrame>, DeviceError> {
        if let Ok(message) = self.errors.try_recv() {
            return Err(DeviceError::Disconnected(message));
        }

        let mut newest: Option<Vec<f32>> = None;
        let closed = loop {
            match self.filled.try_recv() {
                Ok(buffer) => {
                    if let Some(stale) = newest.replace(buffer) {
                        let _ = self.recycle.try_send(stale);
                    }
                }
                Err(TryRecvError::Empty) => break false,
                Err(TryRecvError::Disconnected) => break true,
            }
        };

        match newest {
            Some(buffer) => {
                let frame = AudioFrame::new(&buffer[..], sample_rate);
                let _ = self.recycle.try_send(buffer);
                Ok(Some(frame))
            }
            None if closed => Err(DeviceError::Disconnected("audio source closed".into())),
            None => Ok(None),
        }
    }
}

/// A capture fed through a crossbeam channel, for tests and file replay.
#[derive(Debug)]
pub struct ChannelCapture {
    sample_rate: u32,
    frames: Receiver<AudioFrame>,
}

impl ChannelCapture {
    /// Creates a capture and the sender that feeds it.
    pub fn new(sample_rate: u32) -> (Sender<AudioFrame>, Self) {
        let (sender, frames) = crossbeam_channel::unbounded();
        (sender, Self { sample_rate, frames })
    }
}

impl AudioCapture for ChannelCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames are consumed one per call, in order.
    fn get_buffer(&mut self) -> Result<Option<AudioFrame>, DeviceError> {
        match self.frames.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(DeviceError::Disconnected("audio source closed".into()))
            }
        }
    }
}

/// Collects callback samples in a fixed ring and emits overlapping frames.
///
/// Every `hop` new samples, the latest `frame_size` samples are published.
/// Nothing is allocated after construction.
#[derive(Debug)]
struct FrameAssembler {
    hop: usize,
    ring: Vec<f32>,
    /// Next slot to write; also the oldest sample once the ring is full.
    write: usize,
    filled: usize,
    since_publish: usize,
}

impl FrameAssembler {
    fn new(frame_size: usize, hop: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            hop: hop.clamp(1, frame_size),
            ring: vec![0.0; frame_size],
            write: 0,
            filled: 0,
            since_publish: 0,
        }
    }

    /// Appends interleaved samples (downmixed to mono) and calls `publish`
    /// for each frame that became complete.
    ///
    /// The frame is passed as two slices, oldest samples first; their
    /// concatenation is the window.
    fn push_interleaved(&mut self, data: &[f32], channels: usize, mut publish: impl FnMut(&[f32], &[f32])) {
        let channels = channels.max(1);
        let frame_size = self.ring.len();
        for chunk in data.chunks(channels) {
            self.ring[self.write] = chunk.iter().sum::<f32>() / chunk.len() as f32;
            self.write = (self.write + 1) % frame_size;
            self.filled = (self.filled + 1).min(frame_size);
            self.since_publish += 1;

            if self.filled == frame_size && self.since_publish >= self.hop {
                self.since_publish = 0;
                let (newer, older) = self.ring.split_at(self.write);
                publish(older, newer);
            }
        }
    }
}

/// Live microphone capture through cpal.
///
/// The cpal stream is not `Send` on every platform, so build this on the
/// thread that runs the processing loop.
pub struct CpalCapture {
    stream: cpal::Stream,
    sample_rate: u32,
    device_name: String,
    queue: FrameQueue,
}

impl std::fmt::Debug for CpalCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalCapture")
            .field("device_name", &self.device_name)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl CpalCapture {
    /// Starts audio capture from the default input device.
    ///
    /// This function:
    /// 1. Selects the default audio input device
    /// 2. Picks an f32 configuration close to 44.1 kHz, preferring mono
    /// 3. Publishes a `frame_size` window every `hop_ms` milliseconds
    ///
    /// # Arguments
    /// * `frame_size` - Samples per analysis frame
    /// * `hop_ms` - Milliseconds between published frames (the tick period)
    ///
    /// # Returns
    /// * `Ok(capture)` - A running capture
    /// * `Err(e)` - Error if no suitable device or format is available
    pub fn start(frame_size: usize, hop_ms: u64) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("No input device available"))?;
        let device_name = device.name()?;
        log::info!("Using audio input device: {}", device_name);

        let configs = device.supported_input_configs()?.collect::<Vec<_>>();
        let supported_config = find_supported_config(configs, TARGET_SAMPLE_RATE)
            .ok_or_else(|| anyhow!("No suitable f32 input format found"))?;

        let config = if supported_config.min_sample_rate().0 <= TARGET_SAMPLE_RATE
            && supported_config.max_sample_rate().0 >= TARGET_SAMPLE_RATE
        {
            supported_config.with_sample_rate(cpal::SampleRate(TARGET_SAMPLE_RATE))
        } else {
            supported_config.with_max_sample_rate()
        };
        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;
        let config: cpal::StreamConfig = config.into();
        log::info!("Selected sample rate: {} Hz, {} channel(s)", sample_rate, channels);

        let hop = (sample_rate as u64 * hop_ms / 1000).max(1) as usize;
        let mut assembler = FrameAssembler::new(frame_size, hop);

        // Every buffer is either in the pool, in `filled`, or briefly held by
        // one side; neither bounded channel ever grows.
        let (filled_tx, filled) = bounded::<Vec<f32>>(FRAME_POOL_SIZE);
        let (recycle, pool) = bounded::<Vec<f32>>(FRAME_POOL_SIZE);
        for _ in 0..FRAME_POOL_SIZE {
            let _ = recycle.try_send(Vec::with_capacity(frame_size));
        }
        let callback_recycle = recycle.clone();
        let (error_tx, errors) = bounded::<String>(FRAME_POOL_SIZE);
        let err_fn = move |err: cpal::StreamError| {
            log::error!("An error occurred on the audio stream: {}", err);
            let _ = error_tx.try_send(err.to_string());
        };

        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                assembler.push_interleaved(data, channels, |older, newer| {
                    // Never block the audio thread; with no free buffer the frame is dropped.
                    let Ok(mut buffer) = pool.try_recv() else {
                        return;
                    };
                    buffer.clear();
                    buffer.extend_from_slice(older);
                    buffer.extend_from_slice(newer);
                    if let Err(err) = filled_tx.try_send(buffer) {
                        let _ = callback_recycle.try_send(err.into_inner());
                    }
                });
            },
            err_fn,
            None,
        )?;
        stream.play()?;

        Ok(Self {
            stream,
            sample_rate,
            device_name,
            queue: FrameQueue {
                filled,
                recycle,
                errors,
            },
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Pauses the stream; it is closed when the capture is dropped.
    pub fn pause(&self) {
        if let Err(e) = self.stream.pause() {
            log::warn!("Error pausing stream: {}", e);
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.pause();
        log::info!("Audio capture from '{}' stopped", self.device_name);
    }
}

impl AudioCapture for CpalCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn get_buffer(&mut self) -> Result<Option<AudioFrame>, DeviceError> {
        self.queue.newest(self.sample_rate)
    }
}

/// Lists the names of the available input devices on the default host.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    Ok(host
        .input_devices()?
        .filter_map(|device| device.name().ok())
        .collect())
}

/// Finds the best supported audio configuration for the target sample rate.
///
/// Only 32-bit float formats qualify. Mono is preferred over multi-channel,
/// then the range closest to the target rate wins.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .min_by_key(|c| {
            let covers = c.min_sample_rate().0 <= target_rate && c.max_sample_rate().0 >= target_rate;
            let min_diff = (c.min_sample_rate().0 as i64 - target_rate as i64).abs();
            let max_diff = (c.max_sample_rate().0 as i64 - target_rate as i64).abs();
            let distance = if covers { 0 } else { min_diff.min(max_diff) };
            (c.channels() != 1, distance)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs the assembler and collects the published windows.
    fn assemble(assembler: &mut FrameAssembler, data: &[f32], channels: usize) -> Vec<Vec<f32>> {
        let mut frames = Vec::new();
        assembler.push_interleaved(data, channels, |older, newer| {
            frames.push([older, newer].concat());
        });
        frames
    }

    #[test]
    fn assembler_slides_by_hop() {
        let mut assembler = FrameAssembler::new(8, 4);
        let samples: Vec<f32> = (0..16).map(|i| i as f32).collect();

        let frames = assemble(&mut assembler, &samples[..6], 1);
        assert!(frames.is_empty());

        let frames = assemble(&mut assembler, &samples[6..], 1);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], (0..8).map(|i| i as f32).collect::<Vec<_>>());
        assert_eq!(frames[1], (4..12).map(|i| i as f32).collect::<Vec<_>>());
        assert_eq!(frames[2], (8..16).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn assembler_keeps_order_across_uneven_callbacks() {
        let mut assembler = FrameAssembler::new(5, 3);
        let samples: Vec<f32> = (0..20).map(|i| i as f32).collect();
        let mut frames = Vec::new();
        for chunk in samples.chunks(7) {
            frames.extend(assemble(&mut assembler, chunk, 1));
        }
        let starts: Vec<f32> = frames.iter().map(|frame| frame[0]).collect();
        assert_eq!(starts, vec![0.0, 3.0, 6.0, 9.0, 12.0, 15.0]);
        for frame in &frames {
            assert!(frame.windows(2).all(|pair| pair[1] == pair[0] + 1.0));
        }
    }

    #[test]
    fn assembler_downmixes_interleaved_channels() {
        let mut assembler = FrameAssembler::new(2, 2);
        let frames = assemble(&mut assembler, &[1.0, 3.0, -1.0, -3.0], 2);
        assert_eq!(frames, vec![vec![2.0, -2.0]]);
    }

    #[test]
    fn channel_capture_yields_frames_in_order() {
        let (tx, mut capture) = ChannelCapture::new(48_000);
        assert_eq!(capture.sample_rate(), 48_000);
        assert_eq!(capture.get_buffer(), Ok(None));

        tx.send(AudioFrame::new(vec![0.1; 4], 48_000)).unwrap();
        tx.send(AudioFrame::new(vec![0.2; 4], 48_000)).unwrap();
        assert_eq!(capture.get_buffer().unwrap().unwrap().samples()[0], 0.1);
        assert_eq!(capture.get_buffer().unwrap().unwrap().samples()[0], 0.2);

        drop(tx);
        assert!(capture.get_buffer().is_err());
    }

    #[test]
    fn queue_keeps_the_newest_frame_and_recycles_every_buffer() {
        let (filled_tx, filled) = bounded(4);
        let (recycle, pool) = bounded(4);
        let (err_tx, errors) = bounded(1);
        let queue = FrameQueue { filled, recycle, errors };

        for level in [0.1, 0.2, 0.3] {
            filled_tx.send(vec![level; 4]).unwrap();
        }
        let frame = queue.newest(44_100).unwrap().unwrap();
        assert_eq!(frame.samples(), &[0.3; 4]);
        assert_eq!(frame.sample_rate(), 44_100);
        assert_eq!(pool.try_iter().count(), 3);
        assert_eq!(queue.newest(44_100), Ok(None));

        err_tx.send("device unplugged".to_string()).unwrap();
        assert_eq!(
            queue.newest(44_100),
            Err(DeviceError::Disconnected("device unplugged".into()))
        );
        assert_eq!(queue.newest(44_100), Ok(None));

        drop(filled_tx);
        assert!(queue.newest(44_100).is_err());
    }
}
