//! Microphone capture and WAV output.
//!
//! Audio is captured on a dedicated worker thread in fixed-size interleaved
//! stereo blocks and appended to a shared, lock-protected block log. The
//! main thread only ever touches that log twice per session: never during
//! capture, and once to drain it at teardown. Stopping is an atomic flag the
//! worker polls every block, so cancellation is bounded by one block
//! (~23 ms).
//!
//! The captured track is written as an uncompressed WAV next to the video
//! file; the two are correlated by timestamp only, not muxed.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};

/// Capture/output sample rate.
pub const SAMPLE_RATE: u32 = 44_100;
/// Interleaved stereo.
pub const CHANNELS: u16 = 2;
/// Frames per capture block (~23 ms at 44.1 kHz).
pub const BLOCK_FRAMES: usize = 1024;
/// Samples per block across both channels.
pub const BLOCK_SAMPLES: usize = BLOCK_FRAMES * CHANNELS as usize;

/// Errors from audio capture setup.
#[derive(Debug)]
pub enum AudioError {
    /// No input device available on the default host
    NoInputDevice,
    /// Could not query or configure the input device
    ConfigFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::ConfigFailed(msg) => {
                write!(f, "Failed to configure audio input: {}", msg)
            }
        }
    }
}

impl std::error::Error for AudioError {}

/// Append-only log of captured sample blocks.
///
/// The capture worker appends; the main thread drains once at session stop.
/// Block order is preserved exactly.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    blocks: Mutex<Vec<Vec<i16>>>,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one block. Called only from the capture worker.
    pub fn append(&self, block: Vec<i16>) {
        if let Ok(mut blocks) = self.blocks.lock() {
            blocks.push(block);
        }
    }

    /// Total sample count across all blocks.
    pub fn total_samples(&self) -> usize {
        self.blocks
            .lock()
            .map(|blocks| blocks.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples() == 0
    }

    /// Concatenate all blocks in capture order, leaving the log empty.
    pub fn drain(&self) -> Vec<i16> {
        let mut blocks = match self.blocks.lock() {
            Ok(blocks) => blocks,
            Err(_) => return Vec::new(),
        };
        let total = blocks.iter().map(Vec::len).sum();
        let mut samples = Vec::with_capacity(total);
        for block in blocks.drain(..) {
            samples.extend_from_slice(&block);
        }
        samples
    }
}

/// Everything captured during one recording session.
#[derive(Debug)]
pub struct CapturedAudio {
    /// Interleaved stereo samples, blocks concatenated in capture order.
    pub samples: Vec<i16>,
    /// The rate the device actually captured at (normally [`SAMPLE_RATE`]).
    pub sample_rate: u32,
}

/// Name of the default input device, as a startup availability check.
///
/// # Errors
/// `AudioError::NoInputDevice` if the default host has no input device.
pub fn default_input_device_name() -> Result<String, AudioError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;
    Ok(device.name().unwrap_or_else(|_| "unknown".to_string()))
}

/// Names of all input devices on the default host.
pub fn list_input_devices() -> Result<Vec<String>, AudioError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| AudioError::ConfigFailed(e.to_string()))?;
    Ok(devices
        .map(|d| d.name().unwrap_or_else(|_| "unknown".to_string()))
        .collect())
}

/// A running microphone capture worker.
///
/// Created by [`AudioRecorder::start`], torn down by [`AudioRecorder::stop`].
/// The worker owns the cpal stream (streams are not `Send`, so the stream is
/// built and dropped entirely on the worker thread).
#[derive(Debug)]
pub struct AudioRecorder {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    buffer: Arc<AudioBuffer>,
    sample_rate: u32,
}

impl AudioRecorder {
    /// Start capturing into a fresh block log.
    ///
    /// # Errors
    /// `AudioError::NoInputDevice` / `AudioError::ConfigFailed` if no usable
    /// input exists. The caller decides whether that is fatal; a recording
    /// session downgrades to video-only.
    pub fn start() -> Result<Self, AudioError> {
        // Probe synchronously so the caller learns about a missing device
        // right away; device and stream handles are not freely movable
        // across threads, so the worker re-acquires its own.
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;
        let (config, _format) = pick_input_config(&device)?;

        let sample_rate = config.sample_rate.0;
        if sample_rate != SAMPLE_RATE {
            log::warn!(
                "audio: device does not support {} Hz, capturing at {} Hz",
                SAMPLE_RATE,
                sample_rate
            );
        }

        let stop = Arc::new(AtomicBool::new(false));
        let buffer = Arc::new(AudioBuffer::new());

        let worker_stop = Arc::clone(&stop);
        let worker_buffer = Arc::clone(&buffer);
        let worker = thread::spawn(move || {
            capture_worker(worker_stop, worker_buffer);
        });

        Ok(AudioRecorder {
            stop,
            worker: Some(worker),
            buffer,
            sample_rate,
        })
    }

    /// The shared block log (for inspection while capturing).
    pub fn buffer(&self) -> Arc<AudioBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Signal the worker, join it, and drain everything captured.
    pub fn stop(mut self) -> CapturedAudio {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        CapturedAudio {
            samples: self.buffer.drain(),
            sample_rate: self.sample_rate,
        }
    }
}

impl Drop for AudioRecorder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Prefer a config that can run at [`SAMPLE_RATE`], native i16 first; fall
/// back to the device default.
fn pick_input_config(device: &cpal::Device) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let mut chosen: Option<(StreamConfig, SampleFormat)> = None;

    if let Ok(ranges) = device.supported_input_configs() {
        for range in ranges {
            if range.channels() >= 1
                && range.min_sample_rate().0 <= SAMPLE_RATE
                && range.max_sample_rate().0 >= SAMPLE_RATE
            {
                let format = range.sample_format();
                let config = range.with_sample_rate(cpal::SampleRate(SAMPLE_RATE));
                chosen = Some((config.config(), format));
                if format == SampleFormat::I16 {
                    break;
                }
            }
        }
    }

    match chosen {
        Some(found) => Ok(found),
        None => {
            let default = device
                .default_input_config()
                .map_err(|e| AudioError::ConfigFailed(e.to_string()))?;
            Ok((default.config(), default.sample_format()))
        }
    }
}

/// Worker body: acquire the device, build the stream, run until stopped,
/// flush the remainder. The stream lives and dies on this thread.
fn capture_worker(stop: Arc<AtomicBool>, buffer: Arc<AudioBuffer>) {
    let host = cpal::default_host();
    let device = match host.default_input_device() {
        Some(device) => device,
        None => {
            log::error!("audio: input device disappeared; recording without audio");
            return;
        }
    };
    let (config, format) = match pick_input_config(&device) {
        Ok(picked) => picked,
        Err(e) => {
            log::error!("audio: {}; recording without audio", e);
            return;
        }
    };

    let channels = config.channels as usize;
    let pending: Arc<Mutex<Vec<i16>>> = Arc::new(Mutex::new(Vec::new()));

    let err_cb = |err: cpal::StreamError| log::warn!("audio stream error: {}", err);

    let stream = {
        let pending = Arc::clone(&pending);
        let buffer = Arc::clone(&buffer);
        let stop = Arc::clone(&stop);
        let result = match format {
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    let stereo = to_stereo(data, channels, |s| s);
                    push_samples(&pending, &buffer, &stereo);
                },
                err_cb,
                None,
            ),
            SampleFormat::U16 => device.build_input_stream(
                &config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    let stereo = to_stereo(data, channels, |s| (s as i32 - 32768) as i16);
                    push_samples(&pending, &buffer, &stereo);
                },
                err_cb,
                None,
            ),
            // f32 is the common case on modern hosts. An exotic native
            // format that rejects an f32 stream surfaces as a build error
            // below and the session proceeds without audio.
            _ => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    let stereo =
                        to_stereo(data, channels, |s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
                    push_samples(&pending, &buffer, &stereo);
                },
                err_cb,
                None,
            ),
        };
        match result {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("audio: failed to open input stream: {}", e);
                return;
            }
        }
    };

    if let Err(e) = stream.play() {
        log::error!("audio: failed to start input stream: {}", e);
        return;
    }

    let block_duration =
        Duration::from_millis(1_000 * BLOCK_FRAMES as u64 / u64::from(SAMPLE_RATE.max(1)));
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(block_duration);
    }

    // Dropping the stream stops callbacks; whatever is left in the partial
    // block is still real captured audio and must not be lost.
    drop(stream);
    let locked = pending.lock();
    if let Ok(mut rest) = locked {
        if !rest.is_empty() {
            buffer.append(std::mem::take(&mut *rest));
        }
    }
}

/// Convert an interleaved capture buffer of `channels` channels into
/// interleaved stereo i16: mono is duplicated, extra channels are dropped.
fn to_stereo<T: Copy>(data: &[T], channels: usize, convert: impl Fn(T) -> i16) -> Vec<i16> {
    if channels == 0 {
        return Vec::new();
    }
    let frames = data.len() / channels;
    let mut out = Vec::with_capacity(frames * 2);
    if channels == 1 {
        for &s in data {
            let v = convert(s);
            out.push(v);
            out.push(v);
        }
    } else {
        for frame in 0..frames {
            out.push(convert(data[frame * channels]));
            out.push(convert(data[frame * channels + 1]));
        }
    }
    out
}

/// Accumulate converted samples and emit full blocks to the shared log.
fn push_samples(pending: &Mutex<Vec<i16>>, buffer: &AudioBuffer, samples: &[i16]) {
    let mut pending = match pending.lock() {
        Ok(pending) => pending,
        Err(_) => return,
    };
    pending.extend_from_slice(samples);
    while pending.len() >= BLOCK_SAMPLES {
        let block: Vec<i16> = pending.drain(..BLOCK_SAMPLES).collect();
        buffer.append(block);
    }
}

/// Write captured samples as an uncompressed 16-bit stereo WAV file.
pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: CHANNELS,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()
}
