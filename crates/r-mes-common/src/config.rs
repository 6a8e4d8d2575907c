//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Shared primitives and utilities for the integration engine."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::address::{PhysicalAddress, Protocol};
use crate::logging::LogFormat;
use crate::production::LineId;
use crate::signal::DataKind;

fn default_site() -> String {
    "plant".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

fn default_true() -> bool {
    true
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_staleness_window() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_queue_capacity() -> usize {
    256
}

fn default_sample_every() -> u32 {
    5
}

fn default_max_rework() -> u32 {
    2
}

fn default_verdict_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_pass_rate_floor() -> f64 {
    95.0
}

fn default_pass_rate_min_samples() -> usize {
    20
}

fn default_cycle_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_quality_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_fault_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_stall_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_disconnect_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_vibration_threshold() -> f64 {
    5.0
}

fn default_write_latency_budget() -> Duration {
    Duration::from_millis(250)
}

fn default_evaluation_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_reorder_threshold() -> u64 {
    10
}

fn default_per_unit() -> u64 {
    1
}

fn default_persistence_directory() -> PathBuf {
    PathBuf::from("target/r-mes")
}

fn default_event_log_file() -> String {
    "events.log".to_owned()
}

/// Immutable configuration for the integration engine.
///
/// Built once at startup and handed to each component; nothing mutates it
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_site")]
    pub site: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub tags: Vec<TagConfig>,
    #[serde(default)]
    pub lines: IndexMap<String, LineConfig>,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub alarms: AlarmConfig,
    #[serde(default)]
    pub inventory: IndexMap<String, MaterialConfig>,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "R_MES_CONFIG";

    /// Load configuration from disk, respecting the `R_MES_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the path it came from.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path.to_path_buf(),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn line(&self, line: &LineId) -> Option<&LineConfig> {
        self.lines.get(line.as_str())
    }

    pub fn line_ids(&self) -> Vec<LineId> {
        self.lines.keys().map(|id| LineId::new(id.as_str())).collect()
    }

    pub fn tag(&self, name: &str) -> Option<&TagConfig> {
        self.tags.iter().find(|tag| tag.name == name)
    }

    /// Sampling interval for a line, honouring per-line overrides.
    pub fn sample_every(&self, line: &LineId) -> u32 {
        self.line(line)
            .and_then(|cfg| cfg.sample_every)
            .unwrap_or(self.quality.sample_every)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.lines.is_empty() {
            return Err(anyhow!("configuration must declare at least one line"));
        }

        let mut names = HashSet::new();
        for tag in &self.tags {
            if !names.insert(tag.name.as_str()) {
                return Err(anyhow!("duplicate tag name '{}'", tag.name));
            }
            let endpoint = self.bridge.endpoints.get(&tag.endpoint).ok_or_else(|| {
                anyhow!(
                    "tag '{}' refers to unknown endpoint '{}'",
                    tag.name,
                    tag.endpoint
                )
            })?;
            if tag.address.protocol() != endpoint.protocol {
                return Err(anyhow!(
                    "tag '{}' address {} does not belong to {} endpoint '{}'",
                    tag.name,
                    tag.address,
                    endpoint.protocol,
                    tag.endpoint
                ));
            }
            if tag.writable && !tag.address.space().is_writable() {
                return Err(anyhow!(
                    "tag '{}' is declared writable but {} is a read-only address space",
                    tag.name,
                    tag.address
                ));
            }
        }

        for (line_id, line) in &self.lines {
            line.validate(line_id, self)?;
        }

        for (signal, band) in &self.quality.tolerances {
            if band.min > band.max {
                return Err(anyhow!(
                    "tolerance band for '{}' has min {} above max {}",
                    signal,
                    band.min,
                    band.max
                ));
            }
        }
        for signal in self.alarms.signal_thresholds.keys() {
            match self.tag(signal) {
                Some(tag) if tag.kind == DataKind::Float => {}
                Some(tag) => {
                    return Err(anyhow!(
                        "alarm threshold for '{}' needs a float signal, found {}",
                        signal,
                        tag.kind
                    ))
                }
                None => {
                    return Err(anyhow!(
                        "alarm threshold refers to unknown signal '{}'",
                        signal
                    ))
                }
            }
        }
        if self.quality.sample_every == 0 {
            return Err(anyhow!("quality.sample_every must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.bridge.backoff.jitter) {
            return Err(anyhow!("bridge.backoff.jitter must be within [0, 1)"));
        }
        if self.bridge.queue_capacity == 0 {
            return Err(anyhow!("bridge.queue_capacity must be positive"));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            site: default_site(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            bridge: BridgeConfig::default(),
            tags: Vec::new(),
            lines: IndexMap::new(),
            quality: QualityConfig::default(),
            scheduling: SchedulingConfig::default(),
            alarms: AlarmConfig::default(),
            inventory: IndexMap::new(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Filter directive used when `R_MES_LOG` is unset.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: LogFormat::default(),
            file_prefix: None,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_metrics_listen(),
        }
    }
}

/// Field connection settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub endpoints: IndexMap<String, EndpointConfig>,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Default staleness window, in seconds.
    #[serde(default = "default_staleness_window")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub staleness_window: Duration,
    /// Device poll period, in milliseconds.
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    /// Capacity of each per-line signal queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoints: IndexMap::new(),
            backoff: BackoffConfig::default(),
            staleness_window: default_staleness_window(),
            poll_interval: default_poll_interval(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    pub protocol: Protocol,
    /// `host:port` for Modbus, `opc.tcp://...` for OPC UA.
    pub address: String,
}

/// Reconnect backoff, durations in milliseconds.
#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base: Duration,
    #[serde(default = "default_backoff_cap")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cap: Duration,
    /// Relative jitter applied symmetrically (0.2 = ±20%).
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: default_backoff_base(),
            cap: default_backoff_cap(),
            jitter: default_backoff_jitter(),
        }
    }
}

/// Signals marked `low` are the first dropped under backpressure.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignalPriority {
    #[default]
    High,
    Low,
}

/// Binding of a logical signal to a physical address.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    pub name: String,
    pub endpoint: String,
    pub address: PhysicalAddress,
    pub kind: DataKind,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub priority: SignalPriority,
    /// Per-signal staleness override, in seconds.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub staleness_window: Option<Duration>,
}

/// Signals a conveyor line is bound to, by role.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LineConfig {
    #[serde(default)]
    pub description: Option<String>,
    pub running: String,
    pub fault: String,
    pub unit_count: String,
    #[serde(default)]
    pub speed: Option<String>,
    #[serde(default)]
    pub speed_setpoint: Option<String>,
    #[serde(default)]
    pub vibration: Option<String>,
    #[serde(default)]
    pub measurements: Vec<String>,
    /// Overrides `quality.sample_every` for this line.
    #[serde(default)]
    pub sample_every: Option<u32>,
}

impl LineConfig {
    /// Every signal this line consumes.
    pub fn signals(&self) -> Vec<String> {
        let mut signals = vec![
            self.running.clone(),
            self.fault.clone(),
            self.unit_count.clone(),
        ];
        signals.extend(self.speed.iter().cloned());
        signals.extend(self.speed_setpoint.iter().cloned());
        signals.extend(self.vibration.iter().cloned());
        signals.extend(self.measurements.iter().cloned());
        signals
    }

    fn validate(&self, line_id: &str, config: &AppConfig) -> Result<()> {
        let expect = |signal: &str, kind: Option<DataKind>| -> Result<()> {
            let tag = config.tag(signal).ok_or_else(|| {
                anyhow!("line '{line_id}' refers to unregistered signal '{signal}'")
            })?;
            if let Some(kind) = kind {
                if tag.kind != kind {
                    return Err(anyhow!(
                        "line '{line_id}' expects '{signal}' to be {kind}, tag declares {}",
                        tag.kind
                    ));
                }
            }
            Ok(())
        };
        expect(&self.running, Some(DataKind::Boolean))?;
        expect(&self.fault, Some(DataKind::Boolean))?;
        expect(&self.unit_count, Some(DataKind::Integer))?;
        if let Some(speed) = &self.speed {
            expect(speed, None)?;
        }
        if let Some(setpoint) = &self.speed_setpoint {
            expect(setpoint, None)?;
            if !config.tag(setpoint).map(|tag| tag.writable).unwrap_or(false) {
                return Err(anyhow!(
                    "line '{line_id}' speed setpoint '{setpoint}' must be writable"
                ));
            }
        }
        if let Some(vibration) = &self.vibration {
            expect(vibration, Some(DataKind::Float))?;
        }
        for measurement in &self.measurements {
            expect(measurement, None)?;
        }
        if self.sample_every == Some(0) {
            return Err(anyhow!("line '{line_id}' sample_every must be at least 1"));
        }
        Ok(())
    }
}

/// Inclusive acceptance band for one measurement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ToleranceBand {
    pub min: f64,
    pub max: f64,
}

impl ToleranceBand {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Every Nth unit is tested.
    #[serde(default = "default_sample_every")]
    pub sample_every: u32,
    /// Reworks allowed before a failing order is scrapped.
    #[serde(default = "default_max_rework")]
    pub max_rework: u32,
    /// Seconds to wait for a verdict before faulting the order.
    #[serde(default = "default_verdict_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub verdict_timeout: Duration,
    /// Tolerance bands keyed by measurement signal name.
    #[serde(default)]
    pub tolerances: IndexMap<String, ToleranceBand>,
    /// Pass-rate percentage below which a line alarm is raised.
    #[serde(default = "default_pass_rate_floor")]
    pub pass_rate_floor: f64,
    #[serde(default = "default_pass_rate_min_samples")]
    pub pass_rate_min_samples: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sample_every: default_sample_every(),
            max_rework: default_max_rework(),
            verdict_timeout: default_verdict_timeout(),
            tolerances: IndexMap::new(),
            pass_rate_floor: default_pass_rate_floor(),
            pass_rate_min_samples: default_pass_rate_min_samples(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Period of the per-line scheduling cycle, in milliseconds.
    #[serde(default = "default_cycle_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cycle_interval: Duration,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            cycle_interval: default_cycle_interval(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    #[serde(default = "default_quality_grace")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub quality_grace: Duration,
    #[serde(default = "default_fault_grace")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub fault_grace: Duration,
    #[serde(default = "default_stall_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stall_timeout: Duration,
    #[serde(default = "default_disconnect_grace")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub disconnect_grace: Duration,
    #[serde(default = "default_vibration_threshold")]
    pub vibration_threshold: f64,
    /// Upper limits for other float signals, keyed by signal name.
    #[serde(default)]
    pub signal_thresholds: IndexMap<String, f64>,
    /// Sink append latency budget, in milliseconds.
    #[serde(default = "default_write_latency_budget")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub write_latency_budget: Duration,
    #[serde(default = "default_evaluation_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub evaluation_interval: Duration,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            quality_grace: default_quality_grace(),
            fault_grace: default_fault_grace(),
            stall_timeout: default_stall_timeout(),
            disconnect_grace: default_disconnect_grace(),
            vibration_threshold: default_vibration_threshold(),
            signal_thresholds: IndexMap::new(),
            write_latency_budget: default_write_latency_budget(),
            evaluation_interval: default_evaluation_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaterialConfig {
    pub on_hand: u64,
    #[serde(default = "default_reorder_threshold")]
    pub reorder_threshold: u64,
    #[serde(default = "default_per_unit")]
    pub per_unit: u64,
    /// Quantity added automatically when the item drops below its threshold.
    #[serde(default)]
    pub auto_restock: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_persistence_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_event_log_file")]
    pub file_name: String,
    /// fsync after every append.
    #[serde(default = "default_true")]
    pub sync_on_append: bool,
}

impl PersistenceConfig {
    pub fn event_log_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            directory: default_persistence_directory(),
            file_name: default_event_log_file(),
            sync_on_append: true,
        }
    }
}
