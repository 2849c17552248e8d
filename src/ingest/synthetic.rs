//! Synthetic frame source (`stub://`).
//!
//! Generates a moving test pattern so the full pipeline can run without a
//! camera. `stub://…?frames=N` ends the stream after N frames, which makes
//! the reconnect path observable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{FrameStream, SourceOptions, StreamCloser};
use crate::error::SourceError;
use crate::frame::Frame;

pub struct SyntheticStream {
    uri: String,
    width: u32,
    height: u32,
    frame_limit: Option<u64>,
    frame_count: u64,
    /// Simulated scene state, changes every 50 frames.
    scene_state: u8,
    pacing: Duration,
    closed: Arc<AtomicBool>,
}

struct SyntheticCloser(Arc<AtomicBool>);

impl StreamCloser for SyntheticCloser {
    fn close(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl SyntheticStream {
    pub fn open(uri: &str, options: &SourceOptions) -> Self {
        log::info!("SyntheticStream: connected to {}", uri);
        let pacing = if options.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis((1000 / options.target_fps as u64).max(1))
        };
        Self {
            uri: uri.to_string(),
            width: options.width.max(1),
            height: options.height.max(1),
            frame_limit: frame_limit(uri),
            frame_count: 0,
            scene_state: 0,
            pacing,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn generate_pixels(&mut self) -> Result<Vec<u8>, SourceError> {
        let pixel_count = self
            .width
            .checked_mul(self.height)
            .and_then(|n| n.checked_mul(3))
            .ok_or_else(|| {
                SourceError::read(format!(
                    "{}x{} frame is too large",
                    self.width, self.height
                ))
            })? as usize;

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        Ok(pixels)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl FrameStream for SyntheticStream {
    fn read(&mut self) -> Result<Frame, SourceError> {
        if self.is_closed() {
            return Err(SourceError::read("synthetic stream closed"));
        }
        if let Some(limit) = self.frame_limit {
            if self.frame_count >= limit {
                return Err(SourceError::EndOfStream);
            }
        }
        if !self.pacing.is_zero() && self.frame_count > 0 {
            std::thread::sleep(self.pacing);
            if self.is_closed() {
                return Err(SourceError::read("synthetic stream closed"));
            }
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels()?;
        Frame::from_rgb(pixels, self.width, self.height)
    }

    fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::info!(
                "SyntheticStream: closed {} after {} frames",
                self.uri,
                self.frame_count
            );
        }
    }

    fn closer(&self) -> Option<Arc<dyn StreamCloser>> {
        Some(Arc::new(SyntheticCloser(Arc::clone(&self.closed))))
    }
}

fn frame_limit(uri: &str) -> Option<u64> {
    let query = uri.split_once('?')?.1;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "frames")
        .and_then(|(_, v)| v.parse().ok())
}
