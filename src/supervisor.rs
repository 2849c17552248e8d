//! Per-stream capture and analysis supervisor.
//!
//! One supervisor owns one stream: it connects through a `FrameSource`,
//! reads frames on a dedicated thread, broadcasts each frame, and hands a
//! frame to the `InferenceClient` at most once per analysis interval.
//!
//! ```text
//!            open ok                     read ok
//!  Connecting ───────► Streaming ◄──────────────┐
//!      ▲  │                 │  └───────────────┘
//!      │  │ open failed     │ read failed
//!      │  ▼                 ▼
//!   Disconnected ◄──────────┘
//!      │ retry ceiling reached
//!      ▼
//!    Failed (cooldown, counter reset) ──► Connecting
//!
//!  any state ── stop() ──► Stopped
//! ```
//!
//! Each loop iteration runs inside a fault boundary: an error or panic from a
//! collaborator releases the connection and the loop carries on.
//!
//! The loop thread owns the open `FrameStream` and reads it without holding
//! any lock. Only the stream's `StreamCloser` is shared, so `stop()` can
//! release a connection whose read is blocked.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;

use crate::broadcast::{
    AnalysisEvent, Broadcaster, FrameEvent, LinkStatus, StatusEvent, StreamEvent,
};
use crate::clock::{Clock, StopSignal};
use crate::error::{InferError, SourceError, SupervisorError};
use crate::frame::Frame;
use crate::inference::{InferenceClient, DEFAULT_PROMPT};
use crate::ingest::{FrameSource, FrameStream, Locator, StreamCloser};

/// Timing and encoding knobs for a supervisor.
#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    /// Consecutive connect failures before entering cooldown.
    pub retry_ceiling: u32,
    pub retry_backoff: Duration,
    pub cooldown: Duration,
    pub analysis_interval: Duration,
    /// Pause after every frame; caps the read rate.
    pub frame_interval: Duration,
    pub stop_timeout: Duration,
    pub max_display_width: u32,
    pub display_jpeg_quality: u8,
    pub analysis_jpeg_quality: u8,
    pub inference_timeout: Duration,
    pub prompt: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            retry_ceiling: 3,
            retry_backoff: Duration::from_secs(5),
            cooldown: Duration::from_secs(10),
            analysis_interval: Duration::from_secs(3),
            frame_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(5),
            max_display_width: 640,
            display_jpeg_quality: 75,
            analysis_jpeg_quality: 85,
            inference_timeout: Duration::from_secs(30),
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

/// Everything a supervisor talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn FrameSource>,
    pub inference: Arc<dyn InferenceClient>,
    pub broadcaster: Arc<Broadcaster>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamConfig {
    pub id: String,
    pub locator: Locator,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Streaming,
    Failed,
    Stopped,
}

/// Point-in-time copy of a stream's state.
#[derive(Clone, Debug, Serialize)]
pub struct StreamState {
    #[serde(flatten)]
    pub config: StreamConfig,
    pub status: ConnectionStatus,
    /// True from `start()` until the read loop has exited and released its
    /// connection.
    pub active: bool,
    #[serde(skip)]
    pub last_frame: Option<Arc<Frame>>,
    pub last_analysis: Option<String>,
    /// Milliseconds since the UNIX epoch.
    pub last_analysis_ms: Option<u64>,
    pub frames_captured: u64,
    /// Most recent connection problem, if any.
    pub detail: Option<String>,
}

impl StreamState {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            status: ConnectionStatus::Disconnected,
            active: false,
            last_frame: None,
            last_analysis: None,
            last_analysis_ms: None,
            frames_captured: 0,
            detail: None,
        }
    }
}

/// State shared between the supervisor handle, its loop and analysis jobs.
struct Shared {
    state: Mutex<StreamState>,
    /// Interrupts the loop's open stream from another thread.
    closer: Mutex<Option<Arc<dyn StreamCloser>>>,
    stop: StopSignal,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closer(&self) -> MutexGuard<'_, Option<Arc<dyn StreamCloser>>> {
        self.closer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Once stop is raised only `Stopped` may be recorded.
    fn set_status(&self, status: ConnectionStatus, detail: Option<String>) {
        if self.stop.is_raised() && status != ConnectionStatus::Stopped {
            return;
        }
        let mut state = self.state();
        state.status = status;
        state.detail = detail;
    }
}

enum WorkerSlot {
    Idle,
    Running(Worker),
    Finished,
}

struct Worker {
    /// Disconnects when the loop thread exits.
    done: Receiver<()>,
    join: JoinHandle<()>,
}

pub struct StreamSupervisor {
    config: StreamConfig,
    settings: Arc<SupervisorSettings>,
    deps: Collaborators,
    shared: Arc<Shared>,
    worker: Mutex<WorkerSlot>,
}

impl StreamSupervisor {
    pub fn new(config: StreamConfig, settings: SupervisorSettings, deps: Collaborators) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(StreamState::new(config.clone())),
            closer: Mutex::new(None),
            stop: StopSignal::new(),
        });
        Self {
            config,
            settings: Arc::new(settings),
            deps,
            shared,
            worker: Mutex::new(WorkerSlot::Idle),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Launch the read loop. Returns immediately.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut slot = self.worker_slot();
        match *slot {
            WorkerSlot::Idle => {}
            WorkerSlot::Running(_) => return Err(SupervisorError::AlreadyRunning(self.id().into())),
            WorkerSlot::Finished => return Err(SupervisorError::Stopped(self.id().into())),
        }

        {
            let mut state = self.shared.state();
            state.status = ConnectionStatus::Connecting;
            state.active = true;
        }

        let (done_tx, done_rx) = crossbeam_channel::bounded(0);
        let capture = CaptureLoop {
            config: self.config.clone(),
            settings: Arc::clone(&self.settings),
            deps: self.deps.clone(),
            shared: Arc::clone(&self.shared),
            stream: None,
            retries: 0,
            sequence: 0,
            last_dispatch: None,
            _done: done_tx,
        };
        let join = thread::Builder::new()
            .name(format!("capture-{}", self.id()))
            .spawn(move || capture.run())
            .map_err(|e| {
                let mut state = self.shared.state();
                state.status = ConnectionStatus::Disconnected;
                state.active = false;
                SupervisorError::Spawn(e.to_string())
            })?;

        *slot = WorkerSlot::Running(Worker {
            done: done_rx,
            join,
        });
        log::info!(
            "started stream {}: {} ({})",
            self.config.id,
            self.config.name,
            self.config.locator
        );
        Ok(())
    }

    /// Stop the read loop and release the connection. Idempotent.
    ///
    /// Waits at most `stop_timeout` for the loop. After that the connection is
    /// force-released through its `StreamCloser` and the loop thread is
    /// detached; it exits as soon as the interrupted read returns. `active`
    /// stays true until it does.
    pub fn stop(&self) {
        self.shared.stop.raise();
        let worker = match std::mem::replace(&mut *self.worker_slot(), WorkerSlot::Finished) {
            WorkerSlot::Running(worker) => Some(worker),
            WorkerSlot::Idle | WorkerSlot::Finished => None,
        };

        if let Some(worker) = worker {
            match worker.done.recv_timeout(self.settings.stop_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.join.join().is_err() {
                        log::error!("capture thread for {} panicked", self.config.id);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "stream {} did not stop within {:?}; releasing its connection",
                        self.config.id,
                        self.settings.stop_timeout
                    );
                    let closer = self.shared.closer().take();
                    match closer {
                        Some(closer) => closer.close(),
                        None => log::warn!(
                            "connection for {} cannot be interrupted; it closes when the blocked read returns",
                            self.config.id
                        ),
                    }
                }
            }
            log::info!("stopped stream {}", self.config.id);
        }

        self.shared.set_status(ConnectionStatus::Stopped, None);
    }

    pub fn snapshot(&self) -> StreamState {
        self.shared.state().clone()
    }

    /// Broadcast the stored frame again, e.g. for a viewer that just joined.
    pub fn republish_last_frame(&self) -> bool {
        let Some(frame) = self.shared.state().last_frame.clone() else {
            return false;
        };
        match publish_frame(
            &self.deps.broadcaster,
            &self.settings,
            &self.config.id,
            &frame,
        ) {
            Ok(()) => true,
            Err(err) => {
                log::warn!(
                    "failed to republish frame for {}: {:#}",
                    self.config.id,
                    err
                );
                false
            }
        }
    }

    fn worker_slot(&self) -> MutexGuard<'_, WorkerSlot> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        self.shared.stop.raise();
    }
}

struct CaptureLoop {
    config: StreamConfig,
    settings: Arc<SupervisorSettings>,
    deps: Collaborators,
    shared: Arc<Shared>,
    stream: Option<Box<dyn FrameStream>>,
    retries: u32,
    sequence: u64,
    last_dispatch: Option<Instant>,
    _done: Sender<()>,
}

impl CaptureLoop {
    fn run(mut self) {
        log::debug!("capture loop for {} running", self.config.id);
        while !self.shared.stop.is_raised() {
            let fault = match panic::catch_unwind(AssertUnwindSafe(|| self.step())) {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{:#}", err),
                Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
            };
            self.recover(fault);
        }

        self.release_stream();
        let mut state = self.shared.state();
        state.status = ConnectionStatus::Stopped;
        state.active = false;
        log::debug!("capture loop for {} exited", self.config.id);
    }

    fn step(&mut self) -> anyhow::Result<()> {
        if self.stream.is_none() && !self.connect() {
            return Ok(());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        let result = stream.read();
        // A stop may have interrupted this read; run() releases the stream.
        if self.shared.stop.is_raised() {
            return Ok(());
        }
        let frame = match result {
            Ok(frame) => frame,
            Err(err) => {
                self.on_read_failure(err);
                return Ok(());
            }
        };

        self.sequence += 1;
        let frame = Arc::new(frame.with_sequence(self.sequence));
        {
            let mut state = self.shared.state();
            state.last_frame = Some(Arc::clone(&frame));
            state.frames_captured += 1;
        }

        publish_frame(
            &self.deps.broadcaster,
            &self.settings,
            &self.config.id,
            &frame,
        )?;
        self.maybe_dispatch_analysis(&frame);

        self.deps
            .clock
            .sleep(self.settings.frame_interval, &self.shared.stop);
        Ok(())
    }

    /// Returns true once a connection is open.
    fn connect(&mut self) -> bool {
        self.shared.set_status(ConnectionStatus::Connecting, None);
        log::info!(
            "connecting to {} at {}",
            self.config.name,
            self.config.locator
        );

        let err = match self.deps.source.open(&self.config.locator) {
            Ok(mut stream) => {
                *self.shared.closer() = stream.closer();
                if self.shared.stop.is_raised() {
                    self.shared.closer().take();
                    stream.close();
                    return false;
                }
                self.stream = Some(stream);
                self.retries = 0;
                self.shared.set_status(ConnectionStatus::Streaming, None);
                self.publish_status(LinkStatus::Connected, None);
                return true;
            }
            Err(err) => err,
        };

        self.retries += 1;
        log::warn!(
            "failed to open stream {} ({}/{}): {}",
            self.config.id,
            self.retries,
            self.settings.retry_ceiling,
            err
        );
        if self.retries >= self.settings.retry_ceiling {
            let detail = format!(
                "connection failed after {} attempts: {}",
                self.retries, err
            );
            self.shared
                .set_status(ConnectionStatus::Failed, Some(detail.clone()));
            self.publish_status(LinkStatus::Failed, Some(detail));
            self.deps
                .clock
                .sleep(self.settings.cooldown, &self.shared.stop);
            self.retries = 0;
        } else {
            self.shared
                .set_status(ConnectionStatus::Disconnected, Some(err.to_string()));
            self.deps
                .clock
                .sleep(self.settings.retry_backoff, &self.shared.stop);
        }
        false
    }

    fn on_read_failure(&mut self, err: SourceError) {
        log::warn!("failed to read frame from {}: {}", self.config.name, err);
        self.release_stream();
        let detail = err.to_string();
        self.shared
            .set_status(ConnectionStatus::Disconnected, Some(detail.clone()));
        self.publish_status(LinkStatus::Reconnecting, Some(detail));
    }

    fn recover(&mut self, fault: String) {
        log::error!(
            "error in capture loop for {}: {}",
            self.config.name,
            fault
        );
        self.release_stream();
        self.shared
            .set_status(ConnectionStatus::Disconnected, Some(fault));
        self.deps
            .clock
            .sleep(self.settings.retry_backoff, &self.shared.stop);
    }

    fn maybe_dispatch_analysis(&mut self, frame: &Arc<Frame>) {
        let now = self.deps.clock.now();
        let due = match self.last_dispatch {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.settings.analysis_interval,
        };
        if !due {
            return;
        }
        // Recorded at dispatch so a slow call cannot trigger back-to-back requests.
        self.last_dispatch = Some(now);

        let job = AnalysisJob {
            stream_id: self.config.id.clone(),
            frame: Arc::clone(frame),
            settings: Arc::clone(&self.settings),
            inference: Arc::clone(&self.deps.inference),
            broadcaster: Arc::clone(&self.deps.broadcaster),
            shared: Arc::clone(&self.shared),
        };
        if let Err(err) = thread::Builder::new()
            .name(format!("analysis-{}", self.config.id))
            .spawn(move || job.run())
        {
            log::warn!(
                "failed to spawn analysis for {}: {}",
                self.config.id,
                err
            );
        }
    }

    fn release_stream(&mut self) {
        self.shared.closer().take();
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }

    fn publish_status(&self, status: LinkStatus, detail: Option<String>) {
        if self.shared.stop.is_raised() {
            return;
        }
        self.deps
            .broadcaster
            .publish(StreamEvent::Status(StatusEvent {
                stream_id: self.config.id.clone(),
                status,
                detail,
            }));
    }
}

struct AnalysisJob {
    stream_id: String,
    frame: Arc<Frame>,
    settings: Arc<SupervisorSettings>,
    inference: Arc<dyn InferenceClient>,
    broadcaster: Arc<Broadcaster>,
    shared: Arc<Shared>,
}

impl AnalysisJob {
    fn run(self) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.describe()))
            .unwrap_or_else(|payload| {
                Err(InferError::Transport(format!(
                    "inference client panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

        let (text, failed) = match outcome {
            Ok(text) => {
                log::info!(
                    "analysis for {}: {}...",
                    self.stream_id,
                    text.chars().take(50).collect::<String>()
                );
                (text, false)
            }
            Err(err) => {
                log::warn!("analysis failed for {}: {}", self.stream_id, err);
                (format!("Analysis error: {}", err), true)
            }
        };

        let timestamp_ms = epoch_millis();
        {
            let mut state = self.shared.state();
            state.last_analysis = Some(text.clone());
            state.last_analysis_ms = Some(timestamp_ms);
        }
        self.broadcaster
            .publish(StreamEvent::Analysis(AnalysisEvent {
                stream_id: self.stream_id,
                text,
                timestamp_ms,
                failed,
            }));
    }

    fn describe(&self) -> Result<String, InferError> {
        let jpeg = self
            .frame
            .encode_jpeg(self.settings.analysis_jpeg_quality)
            .map_err(|e| InferError::Encode(e.to_string()))?;
        self.inference
            .infer(&jpeg, &self.settings.prompt, self.settings.inference_timeout)
    }
}

fn publish_frame(
    broadcaster: &Broadcaster,
    settings: &SupervisorSettings,
    stream_id: &str,
    frame: &Frame,
) -> anyhow::Result<()> {
    let encoded = frame
        .encode_display(settings.max_display_width, settings.display_jpeg_quality)
        .context("encode display frame")?;
    log::debug!(
        "frame {} for {}: {}x{}, {} bytes",
        frame.sequence,
        stream_id,
        encoded.width,
        encoded.height,
        encoded.jpeg.len()
    );
    broadcaster.publish(StreamEvent::Frame(FrameEvent {
        stream_id: stream_id.to_string(),
        sequence: frame.sequence,
        width: encoded.width,
        height: encoded.height,
        jpeg: Arc::from(encoded.jpeg),
    }));
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
