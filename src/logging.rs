//! Tracing setup shared by the coordinator and agent binaries.
//!
//! Logs always go to stderr; stdout is reserved for results.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::Subscriber;
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level (trace, debug, info, warn, error, off).
    pub level: String,
    pub format: LogFormat,
    /// Per-target level overrides.
    pub targets: BTreeMap<String, String>,
    pub with_target: bool,
    pub with_thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            targets: BTreeMap::new(),
            with_target: false,
            with_thread_ids: false,
        }
    }
}

impl LogConfig {
    /// Read `VIRTBENCH_LOG_LEVEL`, `VIRTBENCH_LOG_FORMAT` (pretty|json|compact)
    /// and `VIRTBENCH_LOG_TARGETS` (comma-separated `target=level`).
    pub fn from_env(default_level: &str) -> Self {
        let mut config = Self {
            level: std::env::var("VIRTBENCH_LOG_LEVEL").unwrap_or_else(|_| default_level.to_string()),
            ..Self::default()
        };
        if let Some(format) = std::env::var("VIRTBENCH_LOG_FORMAT")
            .ok()
            .and_then(|f| LogFormat::parse(&f))
        {
            config.format = format;
        }
        if let Ok(targets) = std::env::var("VIRTBENCH_LOG_TARGETS") {
            config.targets = parse_target_overrides(&targets);
        }
        config
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// The effective filter; `RUST_LOG` wins when set and valid.
    pub fn env_filter(&self) -> EnvFilter {
        if std::env::var_os("RUST_LOG").is_some() {
            if let Ok(filter) = EnvFilter::try_from_default_env() {
                return filter;
            }
        }
        let mut filter = self.level.clone();
        for (target, level) in &self.targets {
            filter.push_str(&format!(",{target}={level}"));
        }
        EnvFilter::new(filter)
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let builder = fmt::Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_env_filter(config.env_filter());
    match config.format {
        LogFormat::Pretty => finish(builder.pretty().finish()),
        LogFormat::Json => finish(builder.with_ansi(false).json().finish()),
        LogFormat::Compact => finish(builder.compact().finish()),
    }
}

fn finish<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    match subscriber.try_init() {
        Ok(()) => Ok(()),
        Err(err) if err.to_string().contains("already") => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn parse_target_overrides(value: &str) -> BTreeMap<String, String> {
    value
        .split(',')
        .filter_map(|entry| entry.split_once('='))
        .map(|(target, level)| (target.trim(), level.trim().to_lowercase()))
        .filter(|(target, level)| !target.is_empty() && is_valid_level(level))
        .map(|(target, level)| (target.to_string(), level))
        .collect()
}

fn is_valid_level(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error" | "off")
}
