//! RTSP frame source using GStreamer.
//!
//! Pipeline: rtspsrc ! decodebin ! videoconvert ! appsink (RGB, 1 buffer, drop).
//! The appsink keeps only the newest decoded frame, which matches the
//! supervisor's most-recent-wins read pattern.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gstreamer::prelude::*;

use super::{FrameStream, SourceOptions, StreamCloser};
use crate::error::SourceError;
use crate::frame::Frame;

pub struct RtspStream {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_timeout: Duration,
    frame_count: u64,
    closed: bool,
}

/// Setting the pipeline to Null flushes the appsink, which wakes a pending
/// `try_pull_sample`.
struct RtspCloser {
    url: String,
    pipeline: gstreamer::Pipeline,
}

impl StreamCloser for RtspCloser {
    fn close(&self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspStream: failed to stop pipeline for {}: {}", self.url, err);
        }
    }
}

impl RtspStream {
    pub fn open(url: &str, options: &SourceOptions) -> Result<Self, SourceError> {
        let stream =
            Self::build(url, options).map_err(|e| SourceError::connect(url, format!("{:#}", e)))?;
        stream
            .pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| SourceError::connect(url, format!("set pipeline to Playing: {}", e)))?;
        log::info!("RtspStream: connected to {}", url);
        Ok(stream)
    }

    fn build(url: &str, options: &SourceOptions) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            url: url.to_string(),
            pipeline,
            appsink,
            frame_timeout: options.read_timeout,
            frame_count: 0,
            closed: false,
        })
    }

    /// Surface asynchronous pipeline errors as read failures.
    fn poll_bus(&self) -> Result<(), SourceError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(SourceError::read(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )));
                }
                MessageView::Eos(..) => return Err(SourceError::EndOfStream),
                _ => {}
            }
        }
        Ok(())
    }
}

impl FrameStream for RtspStream {
    fn read(&mut self) -> Result<Frame, SourceError> {
        self.poll_bus()?;

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout.as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| SourceError::read("RTSP stream stalled"))?;

        let (pixels, width, height) =
            sample_to_pixels(&sample).map_err(|e| SourceError::read(format!("{:#}", e)))?;
        self.frame_count += 1;
        Frame::from_rgb(pixels, width, height)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspStream: failed to stop pipeline for {}: {}", self.url, err);
        }
        log::info!(
            "RtspStream: closed {} after {} frames",
            self.url,
            self.frame_count
        );
    }

    fn closer(&self) -> Option<Arc<dyn StreamCloser>> {
        Some(Arc::new(RtspCloser {
            url: self.url.clone(),
            pipeline: self.pipeline.clone(),
        }))
    }
}

impl Drop for RtspStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("RTSP buffer shorter than frame")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
