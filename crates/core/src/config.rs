use std::env;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PerfwatchError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectorConfig {
    pub enabled: bool,
    pub sampling: SamplingConfig,
    pub retention: RetentionConfig,
    pub detector: DetectorConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingConfig {
    /// Rate in effect at startup and whenever adaptive sampling is off.
    pub base_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub adaptive: bool,
    pub target_traces_per_sec: f64,
    pub memory_ceiling_bytes: u64,
    pub adjust_interval: Duration,
    /// Fraction of the gap to the goal rate covered per adjustment tick.
    pub smoothing: f64,
    /// Error rate at which throughput-driven rate cuts are suspended.
    pub error_rate_boost_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    pub max_completed_traces: usize,
    /// Pending traces older than this are reaped as abandoned. `None` keeps
    /// them until they complete.
    pub pending_ttl: Option<Duration>,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectorConfig {
    pub slow_span: Duration,
    pub slow_trace: Duration,
    pub repeat_threshold: usize,
    pub error_rate_window: usize,
    pub error_rate_min_samples: usize,
    pub error_rate_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsConfig {
    pub capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling: SamplingConfig::default(),
            retention: RetentionConfig::default(),
            detector: DetectorConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            base_rate: 1.0,
            min_rate: 0.01,
            max_rate: 1.0,
            adaptive: false,
            target_traces_per_sec: 100.0,
            memory_ceiling_bytes: 512 * 1024 * 1024,
            adjust_interval: Duration::from_secs(5),
            smoothing: 0.5,
            error_rate_boost_threshold: 0.5,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_completed_traces: 1000,
            pending_ttl: None,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            slow_span: Duration::from_millis(500),
            slow_trace: Duration::from_secs(2),
            repeat_threshold: 5,
            error_rate_window: 100,
            error_rate_min_samples: 20,
            error_rate_threshold: 0.25,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl CollectorConfig {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        let config_path = config_file_path();
        if let Some(file_overrides) = load_file_overrides(&config_path)? {
            apply_overrides(&mut cfg, file_overrides, "config file")?;
        }
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.sampling;
        validate_rate("sampling.base_rate", s.base_rate)?;
        validate_rate("sampling.min_rate", s.min_rate)?;
        validate_rate("sampling.max_rate", s.max_rate)?;
        if s.min_rate > s.max_rate {
            return Err(PerfwatchError::Config(format!(
                "sampling.min_rate ({}) must not exceed sampling.max_rate ({})",
                s.min_rate, s.max_rate
            )));
        }
        if s.base_rate < s.min_rate || s.base_rate > s.max_rate {
            return Err(PerfwatchError::Config(format!(
                "sampling.base_rate ({}) must lie within [{}, {}]",
                s.base_rate, s.min_rate, s.max_rate
            )));
        }
        if !(s.smoothing > 0.0 && s.smoothing <= 1.0) {
            return Err(PerfwatchError::Config(format!(
                "sampling.smoothing must be in (0, 1], got {}",
                s.smoothing
            )));
        }
        if !(s.target_traces_per_sec.is_finite() && s.target_traces_per_sec > 0.0) {
            return Err(PerfwatchError::Config(format!(
                "sampling.target_traces_per_sec must be positive, got {}",
                s.target_traces_per_sec
            )));
        }
        validate_fraction(
            "sampling.error_rate_boost_threshold",
            s.error_rate_boost_threshold,
        )?;
        require_nonzero_duration("sampling.adjust_interval", s.adjust_interval)?;

        let r = &self.retention;
        if r.max_completed_traces == 0 {
            return Err(PerfwatchError::Config(
                "retention.max_completed_traces must be at least 1".to_string(),
            ));
        }
        if let Some(ttl) = r.pending_ttl {
            require_nonzero_duration("retention.pending_ttl", ttl)?;
        }
        require_nonzero_duration("retention.sweep_interval", r.sweep_interval)?;

        let d = &self.detector;
        require_nonzero_duration("detector.slow_span", d.slow_span)?;
        require_nonzero_duration("detector.slow_trace", d.slow_trace)?;
        if d.repeat_threshold == 0 {
            return Err(PerfwatchError::Config(
                "detector.repeat_threshold must be at least 1".to_string(),
            ));
        }
        if d.error_rate_window == 0 {
            return Err(PerfwatchError::Config(
                "detector.error_rate_window must be at least 1".to_string(),
            ));
        }
        if d.error_rate_min_samples == 0 || d.error_rate_min_samples > d.error_rate_window {
            return Err(PerfwatchError::Config(format!(
                "detector.error_rate_min_samples must be in [1, {}], got {}",
                d.error_rate_window, d.error_rate_min_samples
            )));
        }
        validate_fraction("detector.error_rate_threshold", d.error_rate_threshold)?;

        if self.events.capacity == 0 {
            return Err(PerfwatchError::Config(
                "events.capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_rate(field: &str, rate: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&rate) {
        return Err(PerfwatchError::Config(format!(
            "{field} must be in [0, 1], got {rate}"
        )));
    }
    Ok(())
}

fn validate_fraction(field: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(PerfwatchError::Config(format!(
            "{field} must be in (0, 1], got {value}"
        )));
    }
    Ok(())
}

fn require_nonzero_duration(field: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(PerfwatchError::Config(format!("{field} must be non-zero")));
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    enabled: Option<bool>,
    sample_rate: Option<f64>,
    min_sample_rate: Option<f64>,
    max_sample_rate: Option<f64>,
    adaptive_sampling: Option<bool>,
    target_traces_per_sec: Option<f64>,
    memory_ceiling_bytes: Option<u64>,
    adjust_interval: Option<String>,
    smoothing: Option<f64>,
    max_traces: Option<usize>,
    pending_ttl: Option<String>,
    sweep_interval: Option<String>,
    slow_span: Option<String>,
    slow_trace: Option<String>,
    repeat_threshold: Option<usize>,
    error_rate_threshold: Option<f64>,
    event_capacity: Option<usize>,
}

fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("PERFWATCH_CONFIG") {
        return PathBuf::from(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".config"));
    config_home.join("perfwatch/config.toml")
}

fn load_file_overrides(path: &Path) -> Result<Option<ConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| PerfwatchError::Io(format!("failed reading {}: {e}", path.display())))?;
    let parsed: ConfigOverrides = toml::from_str(&raw)
        .map_err(|e| PerfwatchError::Config(format!("failed parsing {}: {e}", path.display())))?;
    Ok(Some(parsed))
}

fn load_env_overrides() -> Result<ConfigOverrides> {
    env_overrides_from(|key| env::var(key).ok())
}

fn env_overrides_from<F>(lookup: F) -> Result<ConfigOverrides>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(ConfigOverrides {
        enabled: parse_env(&lookup, "PERFWATCH_ENABLED")?,
        sample_rate: parse_env(&lookup, "PERFWATCH_SAMPLE_RATE")?,
        min_sample_rate: parse_env(&lookup, "PERFWATCH_MIN_SAMPLE_RATE")?,
        max_sample_rate: parse_env(&lookup, "PERFWATCH_MAX_SAMPLE_RATE")?,
        adaptive_sampling: parse_env(&lookup, "PERFWATCH_ADAPTIVE_SAMPLING")?,
        target_traces_per_sec: parse_env(&lookup, "PERFWATCH_TARGET_TPS")?,
        memory_ceiling_bytes: parse_env(&lookup, "PERFWATCH_MEMORY_CEILING_BYTES")?,
        adjust_interval: None,
        smoothing: None,
        max_traces: parse_env(&lookup, "PERFWATCH_MAX_TRACES")?,
        pending_ttl: lookup("PERFWATCH_PENDING_TTL"),
        sweep_interval: None,
        slow_span: lookup("PERFWATCH_SLOW_SPAN"),
        slow_trace: lookup("PERFWATCH_SLOW_TRACE"),
        repeat_threshold: parse_env(&lookup, "PERFWATCH_REPEAT_THRESHOLD")?,
        error_rate_threshold: None,
        event_capacity: None,
    })
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| PerfwatchError::Config(format!("bad {key} in environment: {e}"))),
        None => Ok(None),
    }
}

fn parse_duration(field: &str, value: &str, source: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| {
        PerfwatchError::Config(format!("bad {field} in {source}: {e} (value={value})"))
    })
}

fn apply_overrides(cfg: &mut CollectorConfig, overrides: ConfigOverrides, source: &str) -> Result<()> {
    if let Some(v) = overrides.enabled {
        cfg.enabled = v;
    }
    if let Some(v) = overrides.sample_rate {
        cfg.sampling.base_rate = v;
    }
    if let Some(v) = overrides.min_sample_rate {
        cfg.sampling.min_rate = v;
    }
    if let Some(v) = overrides.max_sample_rate {
        cfg.sampling.max_rate = v;
    }
    if let Some(v) = overrides.adaptive_sampling {
        cfg.sampling.adaptive = v;
    }
    if let Some(v) = overrides.target_traces_per_sec {
        cfg.sampling.target_traces_per_sec = v;
    }
    if let Some(v) = overrides.memory_ceiling_bytes {
        cfg.sampling.memory_ceiling_bytes = v;
    }
    if let Some(v) = overrides.adjust_interval {
        cfg.sampling.adjust_interval = parse_duration("adjust_interval", &v, source)?;
    }
    if let Some(v) = overrides.smoothing {
        cfg.sampling.smoothing = v;
    }
    if let Some(v) = overrides.max_traces {
        cfg.retention.max_completed_traces = v;
    }
    if let Some(v) = overrides.pending_ttl {
        cfg.retention.pending_ttl = match v.trim() {
            "" | "off" | "none" => None,
            other => Some(parse_duration("pending_ttl", other, source)?),
        };
    }
    if let Some(v) = overrides.sweep_interval {
        cfg.retention.sweep_interval = parse_duration("sweep_interval", &v, source)?;
    }
    if let Some(v) = overrides.slow_span {
        cfg.detector.slow_span = parse_duration("slow_span", &v, source)?;
    }
    if let Some(v) = overrides.slow_trace {
        cfg.detector.slow_trace = parse_duration("slow_trace", &v, source)?;
    }
    if let Some(v) = overrides.repeat_threshold {
        cfg.detector.repeat_threshold = v;
    }
    if let Some(v) = overrides.error_rate_threshold {
        cfg.detector.error_rate_threshold = v;
    }
    if let Some(v) = overrides.event_capacity {
        cfg.events.capacity = v;
    }
    Ok(())
}
