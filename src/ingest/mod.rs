//! Frame ingestion sources.
//!
//! This module provides different sources for decoded frames:
//! - Synthetic `stub://` streams (testing, demos)
//! - HTTP MJPEG / JPEG snapshot cameras
//! - RTSP streams (feature: rtsp-gstreamer)
//! - Local capture devices by index (feature: ingest-v4l2)
//!
//! `SourceRouter` picks a backend from the locator. Every backend hands the
//! supervisor an open `FrameStream`; the supervisor owns its lifecycle and
//! calls `close` before dropping it.

pub mod mjpeg;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::error::{RegistryError, SourceError};
use crate::frame::Frame;

pub use mjpeg::MjpegStream;
pub use synthetic::SyntheticStream;

/// Where a stream's frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Locator {
    /// Local capture device index (e.g. `0` for `/dev/video0`).
    Device(u32),
    /// Network or synthetic stream URI.
    Uri(String),
}

impl Locator {
    /// Parse a user-supplied locator. All-digit strings are device indices.
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(RegistryError::InvalidConfig(
                "stream locator is required".to_string(),
            ));
        }
        if trimmed.bytes().all(|b| b.is_ascii_digit()) {
            let index = trimmed.parse::<u32>().map_err(|_| {
                RegistryError::InvalidConfig(format!("device index {} is out of range", trimmed))
            })?;
            return Ok(Self::Device(index));
        }
        Ok(Self::Uri(trimmed.to_string()))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Device(index) => write!(f, "{}", index),
            Locator::Uri(uri) => f.write_str(uri),
        }
    }
}

impl Serialize for Locator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Opens streams for locators.
pub trait FrameSource: Send + Sync {
    fn open(&self, locator: &Locator) -> Result<Box<dyn FrameStream>, SourceError>;
}

/// An open connection producing decoded frames.
pub trait FrameStream: Send {
    /// Block until the next frame is decoded.
    fn read(&mut self) -> Result<Frame, SourceError>;

    /// Release the underlying device or connection. Must be idempotent.
    fn close(&mut self) {}

    /// Handle that releases the stream from another thread while `read` is
    /// blocked. `None` when the backend cannot interrupt a read.
    fn closer(&self) -> Option<Arc<dyn StreamCloser>> {
        None
    }
}

/// Cross-thread release of an open stream.
///
/// May run concurrently with `FrameStream::read` and before or after
/// `FrameStream::close`; both must tolerate the other. A blocked read should
/// return an error promptly once this has been called.
pub trait StreamCloser: Send + Sync {
    fn close(&self);
}

/// Capture parameters shared by the built-in backends.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    /// Target frame rate hint (frames per second).
    pub target_fps: u32,
    /// Frame width for synthetic streams and requested device capture.
    pub width: u32,
    /// Frame height for synthetic streams and requested device capture.
    pub height: u32,
    /// Upper bound on a single blocking read.
    pub read_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            target_fps: 10,
            width: 640,
            height: 480,
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// Default `FrameSource`: dispatches on the locator scheme.
#[derive(Clone, Debug, Default)]
pub struct SourceRouter {
    options: SourceOptions,
}

impl SourceRouter {
    pub fn new(options: SourceOptions) -> Self {
        Self { options }
    }
}

impl FrameSource for SourceRouter {
    fn open(&self, locator: &Locator) -> Result<Box<dyn FrameStream>, SourceError> {
        match locator {
            Locator::Device(index) => open_device(*index, &self.options),
            Locator::Uri(uri) => {
                if uri.starts_with("stub://") {
                    return Ok(Box::new(SyntheticStream::open(uri, &self.options)));
                }
                let parsed = url::Url::parse(uri).map_err(|e| SourceError::connect(uri, e))?;
                match parsed.scheme() {
                    "http" | "https" => Ok(Box::new(MjpegStream::open(uri, &self.options)?)),
                    "rtsp" | "rtsps" => open_rtsp(uri, &self.options),
                    other => Err(SourceError::connect(
                        uri,
                        format!("unsupported scheme '{}'", other),
                    )),
                }
            }
        }
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(index: u32, options: &SourceOptions) -> Result<Box<dyn FrameStream>, SourceError> {
    Ok(Box::new(v4l2::V4l2Stream::open(index, options)?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(index: u32, _options: &SourceOptions) -> Result<Box<dyn FrameStream>, SourceError> {
    Err(SourceError::connect(
        index,
        "local device capture requires the ingest-v4l2 feature",
    ))
}

#[cfg(feature = "rtsp-gstreamer")]
fn open_rtsp(uri: &str, options: &SourceOptions) -> Result<Box<dyn FrameStream>, SourceError> {
    Ok(Box::new(rtsp::RtspStream::open(uri, options)?))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn open_rtsp(uri: &str, _options: &SourceOptions) -> Result<Box<dyn FrameStream>, SourceError> {
    Err(SourceError::connect(
        uri,
        "RTSP requires the rtsp-gstreamer feature",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_locators_are_devices() {
        assert_eq!(Locator::parse("0").unwrap(), Locator::Device(0));
        assert_eq!(Locator::parse(" 12 ").unwrap(), Locator::Device(12));
    }

    #[test]
    fn other_locators_are_uris() {
        assert_eq!(
            Locator::parse("rtsp://10.0.0.2/stream").unwrap(),
            Locator::Uri("rtsp://10.0.0.2/stream".to_string())
        );
        assert_eq!(
            Locator::parse("-1").unwrap(),
            Locator::Uri("-1".to_string())
        );
    }

    #[test]
    fn blank_locator_is_invalid() {
        assert!(matches!(
            Locator::parse("   "),
            Err(RegistryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn oversized_device_index_is_invalid() {
        assert!(matches!(
            Locator::parse("99999999999"),
            Err(RegistryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn router_opens_stub_streams() {
        let router = SourceRouter::new(SourceOptions {
            width: 8,
            height: 6,
            ..SourceOptions::default()
        });
        let mut stream = router
            .open(&Locator::Uri("stub://front".to_string()))
            .unwrap();
        let frame = stream.read().unwrap();
        assert_eq!((frame.width, frame.height), (8, 6));
        stream.close();
    }

    #[test]
    fn router_rejects_unknown_schemes() {
        let router = SourceRouter::default();
        let err = router
            .open(&Locator::Uri("ftp://camera/stream".to_string()))
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::Connect { .. }));
    }

    #[test]
    fn router_rejects_unparseable_uris() {
        let router = SourceRouter::default();
        assert!(router
            .open(&Locator::Uri("not a url".to_string()))
            .is_err());
    }
}
