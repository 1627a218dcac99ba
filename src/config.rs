use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Whether a CONFIRMED booking may still be cancelled once its start has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancellationPolicy {
    /// Only bookings starting in the future can be cancelled.
    #[default]
    FutureOnly,
    Anytime,
}

impl FromStr for CancellationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "future-only" | "future_only" | "future" => Ok(CancellationPolicy::FutureOnly),
            "anytime" | "always" => Ok(CancellationPolicy::Anytime),
            other => Err(format!("unknown cancellation policy: {other}")),
        }
    }
}

/// Knobs the engine itself consults on the mutation path.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max wait for a resource's exclusive section, per attempt.
    pub lock_timeout: Duration,
    pub cancellation_policy: CancellationPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(2000),
            cancellation_policy: CancellationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key → value source. Missing keys keep their
    /// default; unparseable values keep their default and log a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let lock_timeout_ms = parse_or(
            &lookup,
            "RESERVD_LOCK_TIMEOUT_MS",
            defaults.engine.lock_timeout.as_millis() as u64,
        );
        Self {
            bind: lookup("RESERVD_BIND").unwrap_or(defaults.bind),
            port: parse_or(&lookup, "RESERVD_PORT", defaults.port),
            data_dir: lookup("RESERVD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parse_or(&lookup, "RESERVD_MAX_CONNECTIONS", defaults.max_connections),
            compact_threshold: parse_or(&lookup, "RESERVD_COMPACT_THRESHOLD", defaults.compact_threshold),
            metrics_port: parse_opt(&lookup, "RESERVD_METRICS_PORT"),
            engine: EngineConfig {
                lock_timeout: Duration::from_millis(lock_timeout_ms),
                cancellation_policy: parse_or(
                    &lookup,
                    "RESERVD_CANCELLATION_POLICY",
                    defaults.engine.cancellation_policy,
                ),
            },
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservd.wal")
    }
}

fn parse_opt<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring invalid {key}={raw:?}");
            None
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    parse_opt(lookup, key).unwrap_or(default)
}
