//! Camera device access.
//!
//! Wraps nokhwa behind a small `FrameSource` abstraction: the pipeline pulls
//! exactly one RGB frame per tick, and a read failure is a skippable,
//! per-tick condition rather than a fatal one. The camera is opened on the
//! thread that ticks it; nokhwa's `Camera` is not `Send`, and nothing here
//! needs it to be.

use nokhwa::pixel_format::RgbFormat;
use nokhwa::query;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
};
use nokhwa::Camera;
use std::fmt;

/// A captured or derived video frame: tightly packed RGB, 8 bits per
/// channel, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Bytes per pixel; frames are always RGB.
    pub const BYTES_PER_PIXEL: usize = 3;

    /// Build a frame from raw RGB bytes.
    ///
    /// Returns `None` if the buffer length does not match the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Option<Self> {
        if data.len() != width as usize * height as usize * Self::BYTES_PER_PIXEL {
            return None;
        }
        Some(Frame {
            data,
            width,
            height,
        })
    }

    /// Offset of pixel (row, col) into `data`.
    #[inline]
    pub fn pixel_offset(&self, row: usize, col: usize) -> usize {
        (row * self.width as usize + col) * Self::BYTES_PER_PIXEL
    }
}

/// Camera resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    /// 640x480, the capture size the tool has always used.
    fn default() -> Self {
        Resolution {
            width: 640,
            height: 480,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Settings used to open a camera.
#[derive(Debug, Clone, Copy)]
pub struct CameraSettings {
    /// Camera device index
    pub device_index: u32,
    /// Requested capture resolution
    pub resolution: Resolution,
    /// Requested capture rate
    pub fps: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        CameraSettings {
            device_index: 0,
            resolution: Resolution::default(),
            fps: 30,
        }
    }
}

/// Errors from camera operations.
#[derive(Debug)]
pub enum CameraError {
    /// No cameras found on the system
    NoDevices,
    /// Failed to query camera devices
    QueryFailed(String),
    /// Camera device not found at the given index
    DeviceNotFound(u32),
    /// Camera access denied by the OS
    PermissionDenied,
    /// Failed to open the camera or start its stream
    OpenFailed(String),
    /// Failed to read or decode a frame (transient; skip the tick)
    ReadFailed(String),
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraError::NoDevices => write!(f, "No cameras found"),
            CameraError::QueryFailed(msg) => write!(f, "Failed to query cameras: {}", msg),
            CameraError::DeviceNotFound(index) => {
                write!(
                    f,
                    "Camera device {} not found. Run 'list-cameras' to see available devices",
                    index
                )
            }
            CameraError::PermissionDenied => {
                write!(f, "Camera permission denied by the operating system")
            }
            CameraError::OpenFailed(msg) => write!(f, "Failed to open camera: {}", msg),
            CameraError::ReadFailed(msg) => write!(f, "Failed to read frame: {}", msg),
        }
    }
}

impl std::error::Error for CameraError {}

/// Information about an available camera device.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub index: u32,
    pub name: String,
    pub description: String,
}

impl fmt::Display for CameraInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.index, self.name, self.description)
    }
}

/// List all camera devices on the system.
///
/// An empty list is not an error; failing to query the backend is.
pub fn list_devices() -> Result<Vec<CameraInfo>, CameraError> {
    let devices = query(ApiBackend::Auto).map_err(|e| CameraError::QueryFailed(e.to_string()))?;

    Ok(devices
        .into_iter()
        .map(|d| CameraInfo {
            index: d.index().as_index().unwrap_or(0),
            name: d.human_name(),
            description: d.description().to_string(),
        })
        .collect())
}

/// Anything the pipeline can pull frames from.
///
/// The real implementation is [`CameraDevice`]; tests substitute synthetic
/// sources.
pub trait FrameSource {
    /// Pull one frame. A failure is transient: the caller skips the current
    /// tick and tries again on the next one.
    fn read(&mut self) -> Result<Frame, CameraError>;

    /// The resolution frames will have, used to size video sinks.
    fn resolution(&self) -> Resolution;
}

/// An open camera device streaming RGB frames.
pub struct CameraDevice {
    camera: Camera,
    settings: CameraSettings,
}

impl fmt::Debug for CameraDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraDevice")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CameraDevice {
    /// Open the camera and start its stream.
    ///
    /// Format negotiation tries MJPEG then YUYV at the requested size/rate,
    /// then falls back to whatever the camera offers; nokhwa decodes all of
    /// them to RGB.
    ///
    /// # Errors
    /// * `CameraError::DeviceNotFound` - no device at the requested index
    /// * `CameraError::PermissionDenied` - OS denied camera access
    /// * `CameraError::OpenFailed` - the stream could not be started
    pub fn open(settings: CameraSettings) -> Result<Self, CameraError> {
        let devices = list_devices()?;
        if devices.is_empty() {
            return Err(CameraError::NoDevices);
        }
        if !devices.iter().any(|d| d.index == settings.device_index) {
            return Err(CameraError::DeviceNotFound(settings.device_index));
        }

        let index = CameraIndex::Index(settings.device_index);
        let size =
            nokhwa::utils::Resolution::new(settings.resolution.width, settings.resolution.height);

        let attempts = [
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(CameraFormat::new(
                size,
                FrameFormat::MJPEG,
                settings.fps,
            ))),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(CameraFormat::new(
                size,
                FrameFormat::YUYV,
                settings.fps,
            ))),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        ];

        let mut camera = None;
        let mut last_error = None;
        for requested in attempts {
            match Camera::new(index.clone(), requested) {
                Ok(cam) => {
                    camera = Some(cam);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }

        let mut camera = match camera {
            Some(cam) => cam,
            None => {
                let e = last_error.expect("no camera and no error");
                let msg = e.to_string().to_lowercase();
                return Err(
                    if msg.contains("permission")
                        || msg.contains("denied")
                        || msg.contains("access")
                    {
                        CameraError::PermissionDenied
                    } else {
                        CameraError::OpenFailed(e.to_string())
                    },
                );
            }
        };

        camera
            .open_stream()
            .map_err(|e| CameraError::OpenFailed(e.to_string()))?;

        Ok(CameraDevice { camera, settings })
    }

    /// The settings this camera was opened with.
    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    /// The frame rate the camera actually runs at.
    pub fn fps(&self) -> u32 {
        self.camera.frame_rate()
    }
}

impl FrameSource for CameraDevice {
    fn read(&mut self) -> Result<Frame, CameraError> {
        let buffer = self
            .camera
            .frame()
            .map_err(|e| CameraError::ReadFailed(e.to_string()))?;
        let resolution = buffer.resolution();
        let decoded = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| CameraError::ReadFailed(e.to_string()))?;
        Frame::from_rgb(decoded.into_raw(), resolution.width(), resolution.height())
            .ok_or_else(|| CameraError::ReadFailed("decoded buffer has wrong size".to_string()))
    }

    fn resolution(&self) -> Resolution {
        let res = self.camera.resolution();
        Resolution {
            width: res.width(),
            height: res.height(),
        }
    }
}

impl Drop for CameraDevice {
    fn drop(&mut self) {
        let _ = self.camera.stop_stream();
    }
}
