//! HTTP camera source.
//!
//! Supports the two shapes cheap IP cameras expose over HTTP:
//! - `multipart/x-mixed-replace` MJPEG streams, split on JPEG SOI/EOI markers
//! - single JPEG snapshots, re-fetched on every read

use std::io::Read;

use super::{FrameStream, SourceOptions};
use crate::error::SourceError;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK_BYTES: usize = 8192;

pub struct MjpegStream {
    url: String,
    agent: ureq::Agent,
    body: Option<MultipartBody>,
    frame_count: u64,
}

impl MjpegStream {
    /// Issue the initial request and detect the stream shape.
    pub fn open(url: &str, options: &SourceOptions) -> Result<Self, SourceError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(options.read_timeout)
            .timeout_read(options.read_timeout)
            .build();
        let response = agent
            .get(url)
            .call()
            .map_err(|e| SourceError::connect(url, e))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        let body = if content_type.contains("multipart") {
            Some(MultipartBody::new(response.into_reader()))
        } else {
            None
        };
        log::info!(
            "MjpegStream: connected to {} ({})",
            url,
            if body.is_some() { "mjpeg" } else { "snapshot" }
        );
        Ok(Self {
            url: url.to_string(),
            agent,
            body,
            frame_count: 0,
        })
    }

    fn fetch_snapshot(&self) -> Result<Vec<u8>, SourceError> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .map_err(|e| SourceError::read(format!("fetch jpeg snapshot: {}", e)))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .map_err(|e| SourceError::read(format!("read jpeg snapshot: {}", e)))?;
        if bytes.is_empty() {
            return Err(SourceError::read("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl FrameStream for MjpegStream {
    fn read(&mut self) -> Result<Frame, SourceError> {
        let jpeg = match self.body.as_mut() {
            Some(body) => body.read_next_jpeg()?,
            None => self.fetch_snapshot()?,
        };
        let frame = Frame::decode_jpeg(&jpeg)?;
        self.frame_count += 1;
        Ok(frame)
    }

    fn close(&mut self) {
        if self.body.take().is_some() {
            log::info!(
                "MjpegStream: closed {} after {} frames",
                self.url,
                self.frame_count
            );
        }
    }
}

struct MultipartBody {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MultipartBody {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>, SourceError> {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self
                .reader
                .read(&mut chunk)
                .map_err(|e| SourceError::read(format!("read mjpeg chunk: {}", e)))?;
            if read == 0 {
                return Err(SourceError::EndOfStream);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

/// Locate the first complete SOI..EOI JPEG in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
