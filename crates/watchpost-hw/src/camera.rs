//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{FrameSource, SourceError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Kernel buffers queued for streaming capture.
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("camera released")]
    Released,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel format requested from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    #[default]
    Yuyv,
    /// Motion JPEG, one JPEG per buffer.
    Mjpg,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    pub fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Mjpg => FourCC::new(b"MJPG"),
            PixelFormat::Grey => FourCC::new(b"GREY"),
        }
    }

    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        [PixelFormat::Yuyv, PixelFormat::Mjpg, PixelFormat::Grey]
            .into_iter()
            .find(|f| f.fourcc() == fourcc)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Mjpg => "MJPG",
            PixelFormat::Grey => "GREY",
        })
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "YUYV" => Ok(PixelFormat::Yuyv),
            "MJPG" | "MJPEG" => Ok(PixelFormat::Mjpg),
            "GREY" | "GRAY" => Ok(PixelFormat::Grey),
            other => Err(format!("unsupported fourcc: {other} (need YUYV, MJPG, or GREY)")),
        }
    }
}

/// Requested capture settings. The driver may adjust resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Streaming V4L2 camera.
pub struct Camera {
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub format: PixelFormat,
}

impl Camera {
    /// Open and configure a device, then start streaming.
    ///
    /// Fails if the device cannot deliver one initial frame.
    pub fn open(settings: &CaptureSettings) -> Result<Self, CameraError> {
        let device_path = settings.device.as_str();
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = settings.format.fourcc();
        fmt.width = settings.width;
        fmt.height = settings.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        // Drivers may substitute another supported format.
        let format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, MJPG, or GREY)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            %format,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        let mut camera = Self {
            stream: Some(stream),
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            format,
        };

        camera.capture_frame()?;
        Ok(camera)
    }

    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let stream = self.stream.as_mut().ok_or(CameraError::Released)?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;
        let image = decode_buffer(self.format, buf, self.width, self.height)?;
        Ok(Frame::new(image, sequence))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn read(&mut self) -> Result<Frame, SourceError> {
        Ok(self.capture_frame()?)
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!(device = %self.device_path, "camera released");
        }
    }
}

fn decode_buffer(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<image::RgbImage, CameraError> {
    match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        PixelFormat::Grey => frame::grey_to_rgb(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("GREY conversion failed: {e}"))),
        PixelFormat::Mjpg => image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
            .map(|img| img.to_rgb8())
            .map_err(|e| CameraError::CaptureFailed(format!("MJPG decode failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_parse() {
        assert_eq!("yuyv".parse::<PixelFormat>(), Ok(PixelFormat::Yuyv));
        assert_eq!("MJPEG".parse::<PixelFormat>(), Ok(PixelFormat::Mjpg));
        assert_eq!("gray".parse::<PixelFormat>(), Ok(PixelFormat::Grey));
        assert!("Y16".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_fourcc_round_trip() {
        for f in [PixelFormat::Yuyv, PixelFormat::Mjpg, PixelFormat::Grey] {
            assert_eq!(PixelFormat::from_fourcc(f.fourcc()), Some(f));
        }
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), None);
    }

    #[test]
    fn test_missing_device_is_not_found() {
        let settings = CaptureSettings {
            device: "/dev/does-not-exist-video".into(),
            width: 640,
            height: 480,
            format: PixelFormat::Yuyv,
        };
        assert!(matches!(Camera::open(&settings), Err(CameraError::DeviceNotFound(_))));
    }

    #[test]
    fn test_decode_grey_buffer() {
        let img = decode_buffer(PixelFormat::Grey, &[9, 9, 9, 9], 2, 2).unwrap();
        assert_eq!(img.get_pixel(1, 1).0, [9, 9, 9]);
        assert!(decode_buffer(PixelFormat::Mjpg, &[0, 1, 2], 2, 2).is_err());
    }
}
