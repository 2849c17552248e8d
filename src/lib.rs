//! Scene monitor
//!
//! Supervises live camera streams, republishes their frames to in-process
//! subscribers, and periodically asks a vision model to describe the scene.
//!
//! # Architecture
//!
//! ```text
//!   FrameSource ──► StreamSupervisor ──► Broadcaster ──► Subscription(s)
//!                        │                    ▲
//!                        └─► InferenceClient ─┘  (separate thread, rate limited)
//! ```
//!
//! `StreamRegistry` owns the set of supervisors and hands out stream ids.
//! Every timed wait goes through a `Clock` so tests can run on virtual time.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (synthetic, HTTP MJPEG, RTSP, V4L2)
//! - `frame`: decoded RGB frames and JPEG encoding
//! - `inference`: vision-model client
//! - `broadcast`: drop-oldest publish/subscribe hub
//! - `supervisor`: per-stream connection and analysis lifecycle
//! - `registry`: add/remove/list streams
//! - `clock`: time source and stop signal
//! - `config`: daemon configuration from file and environment

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod error;
pub mod frame;
pub mod inference;
pub mod ingest;
pub mod registry;
pub mod supervisor;

pub use broadcast::{
    AnalysisEvent, Broadcaster, FrameEvent, LinkStatus, StatusEvent, StreamEvent, Subscription,
};
pub use clock::{Clock, ManualClock, StopSignal, SystemClock};
pub use config::MonitorConfig;
pub use error::{InferError, RegistryError, SourceError, SupervisorError};
pub use frame::Frame;
pub use inference::{ChatCompletionsClient, ChatSettings, InferenceClient};
pub use ingest::{FrameSource, FrameStream, Locator, SourceOptions, SourceRouter, StreamCloser};
pub use registry::{NewStream, StreamRegistry};
pub use supervisor::{
    Collaborators, ConnectionStatus, StreamConfig, StreamState, StreamSupervisor,
    SupervisorSettings,
};
