use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::broadcast::DEFAULT_SUBSCRIBER_CAPACITY;
use crate::inference::{ChatSettings, DEFAULT_PROMPT};
use crate::ingest::SourceOptions;
use crate::registry::NewStream;
use crate::supervisor::SupervisorSettings;

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080";
const DEFAULT_MAX_TOKENS: u32 = 150;
const DEFAULT_TEMPERATURE: f32 = 0.1;
const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRY_CEILING: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 5_000;
const DEFAULT_COOLDOWN_MS: u64 = 10_000;
const DEFAULT_ANALYSIS_INTERVAL_MS: u64 = 3_000;
const DEFAULT_FRAME_INTERVAL_MS: u64 = 100;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_DISPLAY_WIDTH: u32 = 640;
const DEFAULT_DISPLAY_QUALITY: u8 = 75;
const DEFAULT_ANALYSIS_QUALITY: u8 = 85;
const DEFAULT_SOURCE_FPS: u32 = 10;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;
const MAX_SOURCE_DIMENSION: u32 = 8192;

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    inference: Option<InferenceConfigFile>,
    supervisor: Option<SupervisorConfigFile>,
    broadcast: Option<BroadcastConfigFile>,
    source: Option<SourceConfigFile>,
    streams: Option<Vec<StreamConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceConfigFile {
    endpoint: Option<String>,
    prompt: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SupervisorConfigFile {
    retry_ceiling: Option<u32>,
    retry_backoff_ms: Option<u64>,
    cooldown_ms: Option<u64>,
    analysis_interval_ms: Option<u64>,
    frame_interval_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
    max_display_width: Option<u32>,
    display_jpeg_quality: Option<u8>,
    analysis_jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct BroadcastConfigFile {
    subscriber_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    read_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamConfigFile {
    locator: String,
    name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub inference: ChatSettings,
    pub supervisor: SupervisorSettings,
    pub subscriber_capacity: usize,
    pub source: SourceOptions,
    /// Streams registered at startup.
    pub streams: Vec<NewStream>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_file(MonitorConfigFile::default())
    }
}

impl MonitorConfig {
    /// Defaults, then the file named by `SCENE_CONFIG`, then `SCENE_*` env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SCENE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit file instead of `SCENE_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let inference = file.inference.unwrap_or_default();
        let supervisor = file.supervisor.unwrap_or_default();
        let source = file.source.unwrap_or_default();

        let chat = ChatSettings {
            endpoint: inference
                .endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            max_tokens: inference.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: inference.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        };
        let settings = SupervisorSettings {
            retry_ceiling: supervisor.retry_ceiling.unwrap_or(DEFAULT_RETRY_CEILING),
            retry_backoff: millis(supervisor.retry_backoff_ms, DEFAULT_RETRY_BACKOFF_MS),
            cooldown: millis(supervisor.cooldown_ms, DEFAULT_COOLDOWN_MS),
            analysis_interval: millis(
                supervisor.analysis_interval_ms,
                DEFAULT_ANALYSIS_INTERVAL_MS,
            ),
            frame_interval: millis(supervisor.frame_interval_ms, DEFAULT_FRAME_INTERVAL_MS),
            stop_timeout: millis(supervisor.stop_timeout_ms, DEFAULT_STOP_TIMEOUT_MS),
            max_display_width: supervisor
                .max_display_width
                .unwrap_or(DEFAULT_MAX_DISPLAY_WIDTH),
            display_jpeg_quality: supervisor
                .display_jpeg_quality
                .unwrap_or(DEFAULT_DISPLAY_QUALITY),
            analysis_jpeg_quality: supervisor
                .analysis_jpeg_quality
                .unwrap_or(DEFAULT_ANALYSIS_QUALITY),
            inference_timeout: Duration::from_secs(
                inference
                    .timeout_secs
                    .unwrap_or(DEFAULT_INFERENCE_TIMEOUT_SECS),
            ),
            prompt: inference
                .prompt
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
        };
        let source = SourceOptions {
            target_fps: source.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
            width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
            height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
            read_timeout: millis(source.read_timeout_ms, DEFAULT_READ_TIMEOUT_MS),
        };
        let streams = file
            .streams
            .unwrap_or_default()
            .into_iter()
            .map(|stream| NewStream {
                locator: stream.locator,
                name: stream.name,
            })
            .collect();

        Self {
            inference: chat,
            supervisor: settings,
            subscriber_capacity: file
                .broadcast
                .and_then(|broadcast| broadcast.subscriber_capacity)
                .unwrap_or(DEFAULT_SUBSCRIBER_CAPACITY),
            source,
            streams,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(endpoint) = std::env::var("SCENE_INFERENCE_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.inference.endpoint = endpoint.trim().to_string();
            }
        }
        if let Ok(timeout) = std::env::var("SCENE_INFERENCE_TIMEOUT_SECS") {
            let seconds: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("SCENE_INFERENCE_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.supervisor.inference_timeout = Duration::from_secs(seconds);
        }
        if let Ok(interval) = std::env::var("SCENE_ANALYSIS_INTERVAL_MS") {
            let ms: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("SCENE_ANALYSIS_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.supervisor.analysis_interval = Duration::from_millis(ms);
        }
        if let Ok(streams) = std::env::var("SCENE_STREAMS") {
            let parsed = split_csv(&streams);
            if !parsed.is_empty() {
                self.streams = parsed.into_iter().map(NewStream::new).collect();
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.supervisor.retry_ceiling == 0 {
            return Err(anyhow!("supervisor.retry_ceiling must be at least 1"));
        }
        if self.supervisor.frame_interval.is_zero() {
            return Err(anyhow!("supervisor.frame_interval_ms must be greater than zero"));
        }
        if self.subscriber_capacity == 0 {
            return Err(anyhow!("broadcast.subscriber_capacity must be at least 1"));
        }
        if self.supervisor.max_display_width == 0 {
            return Err(anyhow!("supervisor.max_display_width must be at least 1"));
        }
        for (field, quality) in [
            ("display_jpeg_quality", self.supervisor.display_jpeg_quality),
            ("analysis_jpeg_quality", self.supervisor.analysis_jpeg_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(anyhow!("supervisor.{} must be within 1..=100", field));
            }
        }
        for (field, value) in [("width", self.source.width), ("height", self.source.height)] {
            if !(1..=MAX_SOURCE_DIMENSION).contains(&value) {
                return Err(anyhow!(
                    "source.{} must be within 1..={}",
                    field,
                    MAX_SOURCE_DIMENSION
                ));
            }
        }
        url::Url::parse(&self.inference.endpoint).with_context(|| {
            format!("inference.endpoint {} is not a valid URL", self.inference.endpoint)
        })?;
        for stream in &self.streams {
            if stream.locator.trim().is_empty() {
                return Err(anyhow!("stream locator must not be empty"));
            }
        }
        Ok(())
    }
}

fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default))
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
