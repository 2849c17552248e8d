//! V4L2 capture device source.
//!
//! A numeric locator `N` maps to `/dev/videoN`. Frames are requested as
//! RGB24; if the driver refuses the format the negotiated one is kept and a
//! length mismatch surfaces as a read error.

use anyhow::Context;
use ouroboros::self_referencing;

use super::{FrameStream, SourceOptions};
use crate::error::SourceError;
use crate::frame::Frame;

pub struct V4l2Stream {
    device_path: String,
    state: Option<DeviceState>,
    width: u32,
    height: u32,
    frame_count: u64,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Stream {
    pub fn open(index: u32, options: &SourceOptions) -> Result<Self, SourceError> {
        let device_path = format!("/dev/video{}", index);
        let (state, width, height) = connect(&device_path, options)
            .map_err(|e| SourceError::connect(&device_path, format!("{:#}", e)))?;
        log::info!(
            "V4l2Stream: connected to {} ({}x{})",
            device_path,
            width,
            height
        );
        Ok(Self {
            device_path,
            state: Some(state),
            width,
            height,
            frame_count: 0,
        })
    }
}

fn connect(device_path: &str, options: &SourceOptions) -> anyhow::Result<(DeviceState, u32, u32)> {
    use v4l::buffer::Type;
    use v4l::video::Capture;

    let device = v4l::Device::with_path(device_path)
        .with_context(|| format!("open v4l2 device {}", device_path))?;
    let mut format = device.format().context("read v4l2 format")?;
    format.width = options.width;
    format.height = options.height;
    format.fourcc = v4l::FourCC::new(b"RGB3");

    let format = match device.set_format(&format) {
        Ok(format) => format,
        Err(err) => {
            log::warn!(
                "V4l2Stream: failed to set format on {}: {}",
                device_path,
                err
            );
            device
                .format()
                .context("read v4l2 format after set failure")?
        }
    };

    if options.target_fps > 0 {
        let params = v4l::video::capture::Parameters::with_fps(options.target_fps);
        if let Err(err) = device.set_params(&params) {
            log::warn!("V4l2Stream: failed to set fps on {}: {}", device_path, err);
        }
    }

    let state = DeviceStateTryBuilder {
        device,
        stream_builder: |device| {
            v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
        },
    }
    .try_build()?;

    Ok((state, format.width, format.height))
}

impl FrameStream for V4l2Stream {
    fn read(&mut self) -> Result<Frame, SourceError> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| SourceError::read("v4l2 device closed"))?;
        let pixels = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| SourceError::read(format!("capture v4l2 frame: {}", err)))?;

        self.frame_count += 1;
        Frame::from_rgb(pixels, self.width, self.height)
    }

    fn close(&mut self) {
        if self.state.take().is_some() {
            log::info!(
                "V4l2Stream: closed {} after {} frames",
                self.device_path,
                self.frame_count
            );
        }
    }
}
