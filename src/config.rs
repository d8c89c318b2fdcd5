use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::codec::CodecKind;
use crate::infer::ModelBackend;

const DEFAULT_CHANNEL: &str = "13SIM1:Pva1:Image";
const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:5075";
const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 10.0;
const DEFAULT_MBSZ: usize = 1024;
const DEFAULT_PSZ: usize = 15;
const DEFAULT_WORKERS: usize = 1;
const DEFAULT_MIN_INTENSITY: f32 = 100.0;
const DEFAULT_MIN_PEAK_EXTENT: usize = 3;
const DEFAULT_IDLE_INTERVAL_SECS: f64 = 600.0;
const DEFAULT_ARCHIVE_PATH: &str = "results/bragg_peaks.sqlite";
const DEFAULT_BROADCAST_TOPIC: &str = "edge_bragg/results";
const DEFAULT_BROADCAST_CLIENT_ID: &str = "edge-bragg";
const DEFAULT_LIVE_CHANNEL: &str = "edge_bragg:peaks";
const DEFAULT_LIVE_BIND_ADDR: &str = "127.0.0.1:5076";
const DEFAULT_LIVE_FREQ: f64 = 10.0;
const DEFAULT_LIVE_SETUP_DELAY_SECS: f64 = 1.0;

const DEFAULT_SIM_CHANNEL: &str = "simulation:pva:test";
const DEFAULT_SIM_FRAME_RATE: f64 = 20.0;
const DEFAULT_SIM_NX: usize = 256;
const DEFAULT_SIM_NY: usize = 256;
const DEFAULT_SIM_RUNTIME_SECS: f64 = 300.0;
const DEFAULT_SIM_START_DELAY_SECS: f64 = 3.0;
const DEFAULT_SIM_REPORT_FREQUENCY: u64 = 1;

// ----------------------------------------------------------------------------
// File layout
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    channel: Option<String>,
    server_addr: Option<String>,
    connect_timeout_secs: Option<f64>,
    mbsz: Option<usize>,
    psz: Option<usize>,
    workers: Option<usize>,
    min_intensity: Option<f32>,
    min_peak_extent: Option<usize>,
    idle_interval_secs: Option<f64>,
    flush_on_shutdown: Option<bool>,
    high_watermark: Option<usize>,
    model: Option<ModelConfigFile>,
    archive: Option<ArchiveConfigFile>,
    broadcast: Option<BroadcastConfigFile>,
    live: Option<LiveConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    backend: Option<String>,
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ArchiveConfigFile {
    enabled: Option<bool>,
    path: Option<PathBuf>,
    compression: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct BroadcastConfigFile {
    broker: Option<String>,
    topic: Option<String>,
    client_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LiveConfigFile {
    channel: Option<String>,
    bind_addr: Option<String>,
    freq: Option<f64>,
    setup_delay_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct SimulatorConfigFile {
    channel: Option<String>,
    bind_addr: Option<String>,
    input_directory: Option<PathBuf>,
    frame_rate: Option<f64>,
    nx: Option<usize>,
    ny: Option<usize>,
    runtime_secs: Option<f64>,
    start_delay_secs: Option<f64>,
    report_frequency: Option<u64>,
    codec: Option<String>,
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub channel: String,
    pub server_addr: String,
    pub connect_timeout: Duration,
    pub mbsz: usize,
    pub psz: usize,
    pub workers: usize,
    pub min_intensity: f32,
    pub min_peak_extent: usize,
    pub idle_interval: Duration,
    pub flush_on_shutdown: bool,
    pub high_watermark: Option<usize>,
    pub model: ModelSettings,
    pub archive: Option<ArchiveSettings>,
    pub broadcast: Option<BroadcastSettings>,
    pub live: Option<LiveSettings>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelSettings {
    pub backend: ModelBackend,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    pub path: PathBuf,
    pub compression: bool,
}

#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    pub broker: String,
    pub topic: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub channel: String,
    pub bind_addr: String,
    pub freq: f64,
    pub setup_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            connect_timeout: Duration::from_secs_f64(DEFAULT_CONNECT_TIMEOUT_SECS),
            mbsz: DEFAULT_MBSZ,
            psz: DEFAULT_PSZ,
            workers: DEFAULT_WORKERS,
            min_intensity: DEFAULT_MIN_INTENSITY,
            min_peak_extent: DEFAULT_MIN_PEAK_EXTENT,
            idle_interval: Duration::from_secs_f64(DEFAULT_IDLE_INTERVAL_SECS),
            flush_on_shutdown: false,
            high_watermark: None,
            model: ModelSettings::default(),
            archive: Some(ArchiveSettings {
                path: PathBuf::from(DEFAULT_ARCHIVE_PATH),
                compression: false,
            }),
            broadcast: None,
            live: None,
        }
    }
}

impl LiveSettings {
    pub fn with_channel(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            bind_addr: DEFAULT_LIVE_BIND_ADDR.to_string(),
            freq: DEFAULT_LIVE_FREQ,
            setup_delay: Duration::from_secs_f64(DEFAULT_LIVE_SETUP_DELAY_SECS),
        }
    }
}

impl BroadcastSettings {
    pub fn with_broker(broker: &str) -> Self {
        Self {
            broker: broker.to_string(),
            topic: DEFAULT_BROADCAST_TOPIC.to_string(),
            client_id: DEFAULT_BROADCAST_CLIENT_ID.to_string(),
        }
    }
}

impl PipelineConfig {
    /// File named by `EDGE_BRAGG_CONFIG` (JSON, or TOML by extension), then
    /// environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("EDGE_BRAGG_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(channel) = file.channel {
            cfg.channel = channel;
        }
        if let Some(addr) = file.server_addr {
            cfg.server_addr = addr;
        }
        if let Some(secs) = file.connect_timeout_secs {
            cfg.connect_timeout = secs_to_duration(secs, "connect_timeout_secs")?;
        }
        cfg.mbsz = file.mbsz.unwrap_or(cfg.mbsz);
        cfg.psz = file.psz.unwrap_or(cfg.psz);
        cfg.workers = file.workers.unwrap_or(cfg.workers);
        cfg.min_intensity = file.min_intensity.unwrap_or(cfg.min_intensity);
        cfg.min_peak_extent = file.min_peak_extent.unwrap_or(cfg.min_peak_extent);
        if let Some(secs) = file.idle_interval_secs {
            cfg.idle_interval = secs_to_duration(secs, "idle_interval_secs")?;
        }
        cfg.flush_on_shutdown = file.flush_on_shutdown.unwrap_or(false);
        cfg.high_watermark = file.high_watermark;

        if let Some(model) = file.model {
            if let Some(backend) = model.backend {
                cfg.model.backend = backend.parse()?;
            }
            cfg.model.path = model.path;
        }

        if let Some(archive) = file.archive {
            cfg.archive = if archive.enabled.unwrap_or(true) {
                Some(ArchiveSettings {
                    path: archive
                        .path
                        .unwrap_or_else(|| PathBuf::from(DEFAULT_ARCHIVE_PATH)),
                    compression: archive.compression.unwrap_or(false),
                })
            } else {
                None
            };
        }

        if let Some(broadcast) = file.broadcast {
            if let Some(broker) = broadcast.broker {
                let mut settings = BroadcastSettings::with_broker(&broker);
                if let Some(topic) = broadcast.topic {
                    settings.topic = topic;
                }
                if let Some(client_id) = broadcast.client_id {
                    settings.client_id = client_id;
                }
                cfg.broadcast = Some(settings);
            }
        }

        if let Some(live) = file.live {
            let mut settings =
                LiveSettings::with_channel(live.channel.as_deref().unwrap_or(DEFAULT_LIVE_CHANNEL));
            if let Some(addr) = live.bind_addr {
                settings.bind_addr = addr;
            }
            if let Some(freq) = live.freq {
                settings.freq = freq;
            }
            if let Some(secs) = live.setup_delay_secs {
                settings.setup_delay = secs_to_duration(secs, "live.setup_delay_secs")?;
            }
            cfg.live = Some(settings);
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(channel) = env_string("EDGE_BRAGG_CHANNEL") {
            self.channel = channel;
        }
        if let Some(addr) = env_string("EDGE_BRAGG_SERVER_ADDR") {
            self.server_addr = addr;
        }
        if let Some(mbsz) = env_parse("EDGE_BRAGG_MBSZ")? {
            self.mbsz = mbsz;
        }
        if let Some(psz) = env_parse("EDGE_BRAGG_PSZ")? {
            self.psz = psz;
        }
        if let Some(workers) = env_parse("EDGE_BRAGG_WORKERS")? {
            self.workers = workers;
        }
        if let Some(secs) = env_parse::<f64>("EDGE_BRAGG_IDLE_SECS")? {
            self.idle_interval = secs_to_duration(secs, "EDGE_BRAGG_IDLE_SECS")?;
        }
        if let Some(backend) = env_parse("EDGE_BRAGG_MODEL_BACKEND")? {
            self.model.backend = backend;
        }
        if let Some(path) = env_string("EDGE_BRAGG_MODEL_PATH") {
            self.model.path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_string("EDGE_BRAGG_ARCHIVE_PATH") {
            let compression = self.archive.as_ref().is_some_and(|a| a.compression);
            self.archive = Some(ArchiveSettings {
                path: PathBuf::from(path),
                compression,
            });
        }
        if let Some(broker) = env_string("EDGE_BRAGG_MQTT_BROKER") {
            match self.broadcast.as_mut() {
                Some(broadcast) => broadcast.broker = broker,
                None => self.broadcast = Some(BroadcastSettings::with_broker(&broker)),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(anyhow!("channel name must not be empty"));
        }
        if self.mbsz == 0 {
            return Err(anyhow!("batch size (mbsz) must be greater than zero"));
        }
        if self.psz == 0 || self.psz % 2 == 0 {
            return Err(anyhow!("patch size (psz) must be a positive odd number, got {}", self.psz));
        }
        if self.workers == 0 {
            return Err(anyhow!("worker count must be greater than zero"));
        }
        if !self.min_intensity.is_finite() {
            return Err(anyhow!("min_intensity must be finite"));
        }
        if self.idle_interval.is_zero() {
            return Err(anyhow!("idle interval must be greater than zero"));
        }
        if self.high_watermark == Some(0) {
            return Err(anyhow!("high watermark must be greater than zero when set"));
        }
        if let Some(broadcast) = &self.broadcast {
            if broadcast.topic.trim().is_empty() {
                return Err(anyhow!("broadcast topic must not be empty"));
            }
        }
        if let Some(live) = &self.live {
            if live.channel.trim().is_empty() {
                return Err(anyhow!("live channel name must not be empty"));
            }
            if !(live.freq > 0.0 && live.freq.is_finite()) {
                return Err(anyhow!("live republish rate must be positive, got {}", live.freq));
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Simulator
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub channel: String,
    pub bind_addr: String,
    /// Replay images from here; random frames when unset.
    pub input_directory: Option<PathBuf>,
    /// Frames per second; zero publishes as fast as possible.
    pub frame_rate: f64,
    pub nx: usize,
    pub ny: usize,
    pub runtime: Duration,
    pub start_delay: Duration,
    /// Log every n-th publish; zero disables reporting.
    pub report_frequency: u64,
    pub codec: CodecKind,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_SIM_CHANNEL.to_string(),
            bind_addr: DEFAULT_SERVER_ADDR.to_string(),
            input_directory: None,
            frame_rate: DEFAULT_SIM_FRAME_RATE,
            nx: DEFAULT_SIM_NX,
            ny: DEFAULT_SIM_NY,
            runtime: Duration::from_secs_f64(DEFAULT_SIM_RUNTIME_SECS),
            start_delay: Duration::from_secs_f64(DEFAULT_SIM_START_DELAY_SECS),
            report_frequency: DEFAULT_SIM_REPORT_FREQUENCY,
            codec: CodecKind::None,
        }
    }
}

impl SimulatorConfig {
    /// File named by `AD_SIM_CONFIG`, then environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("AD_SIM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SimulatorConfigFile) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(channel) = file.channel {
            cfg.channel = channel;
        }
        if let Some(addr) = file.bind_addr {
            cfg.bind_addr = addr;
        }
        cfg.input_directory = file.input_directory;
        cfg.frame_rate = file.frame_rate.unwrap_or(cfg.frame_rate);
        cfg.nx = file.nx.unwrap_or(cfg.nx);
        cfg.ny = file.ny.unwrap_or(cfg.ny);
        if let Some(secs) = file.runtime_secs {
            cfg.runtime = secs_to_duration(secs, "runtime_secs")?;
        }
        if let Some(secs) = file.start_delay_secs {
            cfg.start_delay = secs_to_duration(secs, "start_delay_secs")?;
        }
        cfg.report_frequency = file.report_frequency.unwrap_or(cfg.report_frequency);
        if let Some(codec) = file.codec {
            cfg.codec = CodecKind::from_name(&codec);
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(channel) = env_string("AD_SIM_CHANNEL") {
            self.channel = channel;
        }
        if let Some(addr) = env_string("AD_SIM_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(dir) = env_string("AD_SIM_INPUT_DIR") {
            self.input_directory = Some(PathBuf::from(dir));
        }
        if let Some(rate) = env_parse("AD_SIM_FRAME_RATE")? {
            self.frame_rate = rate;
        }
        if let Some(secs) = env_parse::<f64>("AD_SIM_RUNTIME_SECS")? {
            self.runtime = secs_to_duration(secs, "AD_SIM_RUNTIME_SECS")?;
        }
        if let Some(codec) = env_string("AD_SIM_CODEC") {
            self.codec = CodecKind::from_name(&codec);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(anyhow!("channel name must not be empty"));
        }
        if !(self.frame_rate >= 0.0 && self.frame_rate.is_finite()) {
            return Err(anyhow!("frame rate must be zero or positive, got {}", self.frame_rate));
        }
        if self.input_directory.is_none() && (self.nx == 0 || self.ny == 0) {
            return Err(anyhow!("random frames need nx and ny greater than zero"));
        }
        if let CodecKind::Unsupported(name) = &self.codec {
            return Err(anyhow!("unsupported simulator codec '{}'", name));
        }
        Ok(())
    }

    /// Inter-frame period, `None` when unpaced.
    pub fn period(&self) -> Option<Duration> {
        if self.frame_rate > 0.0 {
            Some(Duration::from_secs_f64(1.0 / self.frame_rate))
        } else {
            None
        }
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn read_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("{} is invalid: {}", key, e)),
        None => Ok(None),
    }
}

fn secs_to_duration(secs: f64, name: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds, got {}", name, secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults_validate() {
        let cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.mbsz, 1024);
        assert_eq!(cfg.psz, 15);
        assert_eq!(cfg.idle_interval, Duration::from_secs(600));
        assert!(!cfg.flush_on_shutdown);
    }

    #[test]
    fn even_patch_size_is_rejected() {
        let cfg = PipelineConfig {
            psz: 16,
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = PipelineConfig {
            mbsz: 0,
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn simulator_period_follows_frame_rate() {
        let cfg = SimulatorConfig::default();
        assert_eq!(cfg.period(), Some(Duration::from_millis(50)));
        let unpaced = SimulatorConfig {
            frame_rate: 0.0,
            ..SimulatorConfig::default()
        };
        unpaced.validate().unwrap();
        assert_eq!(unpaced.period(), None);
        let negative = SimulatorConfig {
            frame_rate: -1.0,
            ..SimulatorConfig::default()
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn negative_seconds_are_rejected() {
        assert!(secs_to_duration(-1.0, "x").is_err());
        assert_eq!(secs_to_duration(0.5, "x").unwrap(), Duration::from_millis(500));
    }
}
