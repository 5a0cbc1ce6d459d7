//! Capture / distort / record pipeline.
//!
//! The pipeline owns the frame source, the active formula, and at most one
//! recording session, and exposes a single `tick()` entry point: pull one
//! frame, distort it, append it to the video sink when recording, keep it as
//! the current display frame. The UI (CLI here) is a caller, never an owner.
//!
//! Ticks are failure-contained: a camera miss skips the tick, and the only
//! error a tick surfaces is a sink write failure, which the caller handles
//! without the loop dying.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::audio::{self, AudioRecorder};
use crate::avi::AviWriter;
use crate::camera::{CameraError, Frame, FrameSource};
use crate::distortion;
use crate::formula::{Formula, FormulaError};
use crate::storage;

/// Rate stamped into recorded video, fixed regardless of the actual capture
/// cadence.
pub const RECORD_FPS: u32 = 30;

/// Errors from pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no output directory selected")]
    NoOutputDirectory,
    #[error("no frame captured yet")]
    NoFrameAvailable,
    #[error("a recording is already in progress")]
    AlreadyRecording,
    #[error("no recording in progress")]
    NotRecording,
    #[error("output directory {path:?} is not usable: {source}")]
    OutputDirUnusable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("sink write failed: {0}")]
    SinkWrite(#[source] std::io::Error),
}

/// One active recording: the open video sink plus the audio capture worker.
///
/// Both come into existence together in `start_recording` and are torn down
/// together in `stop_recording`. The audio side degrades to `None` when no
/// input device exists; the session then produces a video file only.
#[derive(Debug)]
struct RecordingSession {
    video: AviWriter,
    audio: Option<AudioRecorder>,
    dir: PathBuf,
}

/// What a finished recording produced.
#[derive(Debug)]
pub struct RecordingSummary {
    pub video_path: PathBuf,
    /// `None` when no audio was captured.
    pub audio_path: Option<PathBuf>,
    pub frames: u32,
    pub audio_samples: usize,
}

/// The capture/distort/record pipeline.
pub struct Pipeline<S: FrameSource> {
    source: S,
    formula: Formula,
    output_dir: Option<PathBuf>,
    session: Option<RecordingSession>,
    current: Option<Frame>,
}

impl<S: FrameSource> Pipeline<S> {
    /// Build a pipeline around a frame source, starting with the identity
    /// formula and no output directory.
    pub fn new(source: S) -> Self {
        Pipeline {
            source,
            formula: Formula::identity(),
            output_dir: None,
            session: None,
            current: None,
        }
    }

    /// The active formula.
    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    /// Compile and activate a new formula.
    ///
    /// # Errors
    /// `FormulaError` from validation; the previously active formula stays
    /// in effect.
    pub fn apply_formula(&mut self, text: &str) -> Result<(), FormulaError> {
        self.formula = Formula::compile(text)?;
        Ok(())
    }

    /// Reset to the identity formula (no distortion). Never fails.
    pub fn clear_formula(&mut self) {
        self.formula = Formula::identity();
    }

    /// Validate and set the output directory for recordings and photos.
    ///
    /// # Errors
    /// `PipelineError::OutputDirUnusable` if the writability probe fails;
    /// the previous directory stays in effect.
    pub fn set_output_dir(&mut self, dir: &Path) -> Result<(), PipelineError> {
        storage::validate_writable(dir).map_err(|e| PipelineError::OutputDirUnusable {
            path: dir.to_path_buf(),
            source: e,
        })?;
        self.output_dir = Some(dir.to_path_buf());
        Ok(())
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// The most recent distorted frame, for display or photos.
    pub fn current_frame(&self) -> Option<&Frame> {
        self.current.as_ref()
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Run one tick: capture, distort, record if a session is active.
    ///
    /// A camera read failure only skips this tick (logged, `Ok`).
    ///
    /// # Errors
    /// `PipelineError::SinkWrite` if appending to the video sink fails.
    pub fn tick(&mut self) -> Result<(), PipelineError> {
        let raw = match self.source.read() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("camera read failed, skipping tick: {}", e);
                return Ok(());
            }
        };

        self.current = Some(distortion::distort(&raw, &self.formula));

        if let (Some(session), Some(frame)) = (self.session.as_mut(), self.current.as_ref()) {
            session
                .video
                .write_frame(frame)
                .map_err(PipelineError::SinkWrite)?;
        }
        Ok(())
    }

    /// Open a video sink and start the audio worker.
    ///
    /// Returns the path of the video file being written.
    ///
    /// # Errors
    /// * `PipelineError::NoOutputDirectory` - no directory configured
    /// * `PipelineError::AlreadyRecording` - a session is active; it is left
    ///   untouched and no second sink is opened
    /// * `PipelineError::SinkWrite` - the video file could not be created
    pub fn start_recording(&mut self) -> Result<PathBuf, PipelineError> {
        if self.session.is_some() {
            return Err(PipelineError::AlreadyRecording);
        }
        let dir = self
            .output_dir
            .clone()
            .ok_or(PipelineError::NoOutputDirectory)?;

        let resolution = self.source.resolution();
        let path = storage::timestamped_path(&dir, "video", "avi");
        let video = AviWriter::create(&path, RECORD_FPS, resolution.width, resolution.height)
            .map_err(PipelineError::SinkWrite)?;

        let audio = match AudioRecorder::start() {
            Ok(recorder) => Some(recorder),
            Err(e) => {
                log::warn!("audio capture unavailable, recording video only: {}", e);
                None
            }
        };

        log::info!("recording to {}", path.display());
        self.session = Some(RecordingSession { video, audio, dir });
        Ok(path)
    }

    /// Stop the audio worker, finalize the video sink, and write the WAV
    /// file if any audio was captured.
    ///
    /// Teardown always completes: both sinks are released even when one of
    /// them fails, and the first failure is reported.
    ///
    /// # Errors
    /// * `PipelineError::NotRecording` - no session is active
    /// * `PipelineError::SinkWrite` - finalizing the video or writing the
    ///   audio file failed
    pub fn stop_recording(&mut self) -> Result<RecordingSummary, PipelineError> {
        let RecordingSession { video, audio, dir } =
            self.session.take().ok_or(PipelineError::NotRecording)?;

        let video_path = video.path().to_path_buf();
        let frames = video.frames_written();

        // Audio first: the worker exits within about one block.
        let captured = audio.map(AudioRecorder::stop);

        let mut first_error = video.finalize().map_err(PipelineError::SinkWrite).err();

        let mut audio_path = None;
        let mut audio_samples = 0;
        if let Some(captured) = captured {
            audio_samples = captured.samples.len();
            if !captured.samples.is_empty() {
                let path = storage::timestamped_path(&dir, "audio", "wav");
                match audio::write_wav(&path, &captured.samples, captured.sample_rate) {
                    Ok(()) => audio_path = Some(path),
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(PipelineError::SinkWrite(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                e.to_string(),
                            )));
                        }
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                log::info!(
                    "recording stopped: {} frames, {} audio samples",
                    frames,
                    audio_samples
                );
                Ok(RecordingSummary {
                    video_path,
                    audio_path,
                    frames,
                    audio_samples,
                })
            }
        }
    }

    /// Write the current distorted frame as a photo.
    ///
    /// # Errors
    /// * `PipelineError::NoFrameAvailable` - nothing captured yet
    /// * `PipelineError::NoOutputDirectory` - no directory configured
    /// * `PipelineError::SinkWrite` - the image could not be written
    pub fn take_photo(&mut self) -> Result<PathBuf, PipelineError> {
        let frame = self.current.as_ref().ok_or(PipelineError::NoFrameAvailable)?;
        let dir = self
            .output_dir
            .as_ref()
            .ok_or(PipelineError::NoOutputDirectory)?;

        let path = storage::timestamped_path(dir, "photo", "jpg");
        storage::save_photo(frame, &path).map_err(PipelineError::SinkWrite)?;
        log::info!("photo saved to {}", path.display());
        Ok(path)
    }
}

impl<S: FrameSource> Drop for Pipeline<S> {
    fn drop(&mut self) {
        if self.session.is_some() {
            // Sinks clean themselves up, but the audio track is lost.
            log::warn!("pipeline dropped while recording; audio track discarded");
        }
    }
}
