#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use scene_monitor::{
    Broadcaster, Clock, Collaborators, Frame, FrameSource, FrameStream, InferError,
    InferenceClient, Locator, SourceError, StreamCloser, StreamEvent, Subscription,
    SupervisorSettings,
};

/// What one `open` call does.
#[derive(Clone, Debug)]
pub enum Script {
    FailOpen,
    /// Yield N frames, then end the stream.
    Frames(u64),
    Endless,
    PanicOnRead,
    /// Every read blocks for the given time before returning a frame. A
    /// close from another thread cuts the wait short.
    BlockRead(Duration),
    /// Like `BlockRead`, but the stream offers no closer.
    StuckRead(Duration),
}

/// Scripted `FrameSource` that counts opens and closes.
pub struct FakeSource {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    locators: Mutex<Vec<Locator>>,
}

impl FakeSource {
    pub fn scripted(scripts: Vec<Script>, fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            locators: Mutex::new(Vec::new()),
        })
    }

    pub fn endless() -> Arc<Self> {
        Self::scripted(Vec::new(), Script::Endless)
    }

    pub fn failing() -> Arc<Self> {
        Self::scripted(Vec::new(), Script::FailOpen)
    }

    /// First connection yields `n` frames; every later open fails.
    pub fn frames_then_fail(n: u64) -> Arc<Self> {
        Self::scripted(vec![Script::Frames(n)], Script::FailOpen)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn locators(&self) -> Vec<Locator> {
        self.locators.lock().unwrap().clone()
    }
}

impl FrameSource for FakeSource {
    fn open(&self, locator: &Locator) -> Result<Box<dyn FrameStream>, SourceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.locators.lock().unwrap().push(locator.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if let Script::FailOpen = script {
            return Err(SourceError::connect(locator, "camera unreachable"));
        }
        Ok(Box::new(FakeStream {
            script,
            produced: 0,
            release: Arc::new(Release {
                closed: AtomicBool::new(false),
                closes: Arc::clone(&self.closes),
            }),
        }))
    }
}

/// Close state shared by a stream and its closer; counts one close per stream.
struct Release {
    closed: AtomicBool,
    closes: Arc<AtomicUsize>,
}

impl Release {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl StreamCloser for Release {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct FakeStream {
    script: Script,
    produced: u64,
    release: Arc<Release>,
}

impl FakeStream {
    /// Sleep up to `delay`, returning early if the stream is closed.
    fn block(&self, delay: Duration) -> Result<(), SourceError> {
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline {
            if self.release.is_closed() {
                return Err(SourceError::read("closed"));
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

impl FrameStream for FakeStream {
    fn read(&mut self) -> Result<Frame, SourceError> {
        if self.release.is_closed() {
            return Err(SourceError::read("closed"));
        }
        match self.script {
            Script::Frames(limit) if self.produced >= limit => {
                return Err(SourceError::EndOfStream)
            }
            Script::PanicOnRead => panic!("decoder crashed"),
            Script::BlockRead(delay) => self.block(delay)?,
            Script::StuckRead(delay) => thread::sleep(delay),
            _ => {}
        }
        self.produced += 1;
        Ok(test_frame(self.produced as u8))
    }

    fn close(&mut self) {
        StreamCloser::close(self.release.as_ref());
    }

    fn closer(&self) -> Option<Arc<dyn StreamCloser>> {
        match self.script {
            Script::StuckRead(_) => None,
            _ => Some(Arc::clone(&self.release) as Arc<dyn StreamCloser>),
        }
    }
}

pub fn test_frame(shade: u8) -> Frame {
    Frame::from_rgb(vec![shade; 8 * 4 * 3], 8, 4).unwrap()
}

/// `InferenceClient` that counts calls and can be slow or failing.
pub struct FakeInference {
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeInference {
    pub fn ok() -> Arc<Self> {
        Self::build(Duration::ZERO, false)
    }

    /// Waits `delay`, then reports a timeout.
    pub fn timing_out(delay: Duration) -> Arc<Self> {
        Self::build(delay, true)
    }

    fn build(delay: Duration, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceClient for FakeInference {
    fn infer(&self, jpeg: &[u8], _prompt: &str, timeout: Duration) -> Result<String, InferError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(jpeg.starts_with(&[0xFF, 0xD8]), "analysis input must be JPEG");
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail {
            Err(InferError::Timeout(timeout))
        } else {
            Ok(format!("scene {}", n))
        }
    }
}

pub fn collaborators(
    source: Arc<FakeSource>,
    inference: Arc<FakeInference>,
    clock: Arc<dyn Clock>,
) -> Collaborators {
    Collaborators {
        source,
        inference,
        broadcaster: Broadcaster::new(256),
        clock,
    }
}

/// Short real-time intervals so wall-clock tests finish quickly.
pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        frame_interval: Duration::from_millis(5),
        stop_timeout: Duration::from_secs(2),
        ..SupervisorSettings::default()
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Receive events until `done` says so or `timeout` elapses.
pub fn collect_until(
    sub: &Subscription,
    timeout: Duration,
    mut done: impl FnMut(&[StreamEvent]) -> bool,
) -> Vec<StreamEvent> {
    let deadline = Instant::now() + timeout;
    let mut events = Vec::new();
    while !done(&events) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if let Some(event) = sub.recv_timeout(remaining.min(Duration::from_millis(50))) {
            events.push(event);
        }
    }
    events
}

pub fn count_frames(events: &[StreamEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Frame(_)))
        .count()
}

pub fn count_analyses(events: &[StreamEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Analysis(_)))
        .count()
}
