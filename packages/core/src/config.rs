use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cli::Cli;
use crate::error::AppError;
use crate::ledger::DEFAULT_CAPACITY;
use crate::source::SourceConfig;

/// Runtime knobs for the refresh engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    pub initial_sync: bool,
    /// `None` waits for a rate-limit token indefinitely.
    pub max_rate_limit_wait: Option<Duration>,
    pub ledger_capacity_per_source: usize,
    pub cache_sweep_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            initial_sync: true,
            max_rate_limit_wait: None,
            ledger_capacity_per_source: DEFAULT_CAPACITY,
            cache_sweep_interval: Some(Duration::from_secs(10 * 60)),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("{} must be a valid number", name)),
        Err(_) => Ok(None),
    }
}

fn parse_bool(name: &str) -> Result<Option<bool>, String> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            other => Err(format!("Invalid {}: {}", name, other)),
        },
        Err(_) => Ok(None),
    }
}

impl EngineConfig {
    /// Defaults overridden by any `ENGINE_*` variables that are set.
    /// A sweep interval of `0` disables the sweeper.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64>("ENGINE_TICK_SECONDS")? {
            if secs == 0 {
                return Err("ENGINE_TICK_SECONDS must be greater than zero".into());
            }
            config.tick_interval = Duration::from_secs(secs);
        }
        if let Some(initial_sync) = parse_bool("ENGINE_INITIAL_SYNC")? {
            config.initial_sync = initial_sync;
        }
        if let Some(ms) = parse_var::<u64>("ENGINE_MAX_RATE_LIMIT_WAIT_MS")? {
            config.max_rate_limit_wait = Some(Duration::from_millis(ms));
        }
        if let Some(capacity) = parse_var::<usize>("ENGINE_LEDGER_CAPACITY")? {
            config.ledger_capacity_per_source = capacity;
        }
        if let Some(secs) = parse_var::<u64>("ENGINE_CACHE_SWEEP_SECONDS")? {
            config.cache_sweep_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        Ok(config)
    }
}

fn default_health_path() -> String {
    "health".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

/// One entry of the sources file: adapter settings plus scheduling config.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDefinition {
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(flatten)]
    pub config: SourceConfig,
}

pub fn parse_source_definitions(raw: &str) -> Result<Vec<SourceDefinition>, AppError> {
    serde_json::from_str(raw).map_err(|err| AppError::Parse(err.to_string()))
}

pub fn load_source_definitions(path: &Path) -> Result<Vec<SourceDefinition>, AppError> {
    let raw = std::fs::read_to_string(path)?;
    parse_source_definitions(&raw)
}

/// Settings for the `gov-data-sync` binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub sources_file: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            sources_file: env::var("SOURCES_FILE").ok().map(PathBuf::from),
            engine: EngineConfig::from_env()?,
        })
    }

    /// CLI flags win over environment values.
    pub fn apply_cli(mut self, cli: &Cli) -> Result<Self, String> {
        if let Some(bind) = &cli.bind {
            self.bind_addr = bind.clone();
        }
        if let Some(path) = &cli.sources {
            self.sources_file = Some(path.clone());
        }
        if let Some(secs) = cli.tick_seconds {
            if secs == 0 {
                return Err("--tick-seconds must be greater than zero".into());
            }
            self.engine.tick_interval = Duration::from_secs(secs);
        }
        if cli.no_initial_sync {
            self.engine.initial_sync = false;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{Priority, UpdateFrequency};
    use clap::Parser;

    #[test]
    fn engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert!(config.initial_sync);
        assert_eq!(config.max_rate_limit_wait, None);
        assert_eq!(config.ledger_capacity_per_source, 1_000);
        assert_eq!(config.cache_sweep_interval, Some(Duration::from_secs(600)));
    }

    #[test]
    fn source_definitions_parse_with_defaults() {
        let raw = r#"[
            {
                "name": "boc",
                "base_url": "https://www.bankofcanada.ca/valet",
                "rate_limit": { "requests": 30, "window_seconds": 60 },
                "update_frequency": "daily",
                "priority": "critical",
                "sync_targets": [
                    { "endpoint": "observations/FXUSDCAD/json", "params": { "recent": "1" } }
                ]
            },
            {
                "name": "statcan",
                "base_url": "https://www150.statcan.gc.ca/t1/wds/rest",
                "health_path": "getAllCubesListLite",
                "timeout_ms": 2500,
                "rate_limit": { "requests": 10, "window_seconds": 1 },
                "update_frequency": "monthly",
                "priority": "high",
                "retry_on_failure": false
            }
        ]"#;

        let defs = parse_source_definitions(raw).unwrap();
        assert_eq!(defs.len(), 2);

        assert_eq!(defs[0].health_path, "health");
        assert_eq!(defs[0].timeout_ms, 10_000);
        assert_eq!(defs[0].config.priority, Priority::Critical);
        assert_eq!(defs[0].config.update_frequency, UpdateFrequency::Daily);
        assert!(defs[0].config.retry_on_failure);
        assert_eq!(defs[0].config.sync_targets[0].params["recent"], "1");

        assert_eq!(defs[1].timeout_ms, 2_500);
        assert!(!defs[1].config.retry_on_failure);
        assert!(defs[1].config.sync_targets.is_empty());
    }

    #[test]
    fn malformed_sources_file_is_a_parse_error() {
        let err = parse_source_definitions("[{\"name\": \"boc\"}]").unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }

    #[test]
    fn cli_overrides_app_config() {
        let base = AppConfig {
            bind_addr: "0.0.0.0:8080".into(),
            sources_file: None,
            engine: EngineConfig::default(),
        };
        let cli = Cli::parse_from([
            "gov-data-sync",
            "--bind",
            "127.0.0.1:9000",
            "--sources",
            "sources.json",
            "--tick-seconds",
            "15",
            "--no-initial-sync",
        ]);

        let config = base.apply_cli(&cli).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.sources_file, Some(PathBuf::from("sources.json")));
        assert_eq!(config.engine.tick_interval, Duration::from_secs(15));
        assert!(!config.engine.initial_sync);
    }

    #[test]
    fn zero_tick_from_cli_is_rejected() {
        let base = AppConfig {
            bind_addr: "0.0.0.0:8080".into(),
            sources_file: None,
            engine: EngineConfig::default(),
        };
        let cli = Cli::parse_from(["gov-data-sync", "--tick-seconds", "0"]);
        assert!(base.apply_cli(&cli).is_err());
    }
}
