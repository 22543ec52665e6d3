//! Configuration system for the Fulcrum client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/fulcrum/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};

use crate::chat::delay::SimulatedDelays;
use crate::engine::EngineConfig;
use crate::sync::feed::ResubscribeConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    lifecycle: LifecycleFileConfig,
    feed: FeedFileConfig,
    ui: UiFileConfig,
}

/// `[lifecycle]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LifecycleFileConfig {
    ack_delay_ms: Option<u64>,
    think_min_ms: Option<u64>,
    think_jitter_ms: Option<u64>,
}

/// `[feed]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct FeedFileConfig {
    channel_capacity: Option<usize>,
    event_buffer: Option<usize>,
    resubscribe_initial_ms: Option<u64>,
    resubscribe_max_ms: Option<u64>,
    resubscribe_multiplier: Option<u32>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Lifecycle --
    /// Pause before the user message is marked `sent`.
    pub ack_delay: Duration,
    /// Minimum assistant think time.
    pub think_min: Duration,
    /// Upper bound of the random jitter added to `think_min`.
    pub think_jitter: Duration,

    // -- Feed --
    /// Capacity of the merge loop's input channel.
    pub channel_capacity: usize,
    /// Capacity of the store event channel.
    pub event_buffer: usize,
    /// Feed resubscription backoff.
    pub resubscribe: ResubscribeConfig,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let delays = SimulatedDelays::default();
        let engine = EngineConfig::default();
        Self {
            ack_delay: delays.ack,
            think_min: delays.think_min,
            think_jitter: delays.think_jitter,
            channel_capacity: engine.channel_capacity,
            event_buffer: engine.event_buffer,
            resubscribe: engine.resubscribe,
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/fulcrum/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let ms = Duration::from_millis;

        Self {
            ack_delay: cli
                .ack_delay_ms
                .or(file.lifecycle.ack_delay_ms)
                .map_or(defaults.ack_delay, ms),
            think_min: cli
                .think_min_ms
                .or(file.lifecycle.think_min_ms)
                .map_or(defaults.think_min, ms),
            think_jitter: file
                .lifecycle
                .think_jitter_ms
                .map_or(defaults.think_jitter, ms),
            channel_capacity: file
                .feed
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            event_buffer: file.feed.event_buffer.unwrap_or(defaults.event_buffer),
            resubscribe: ResubscribeConfig {
                initial_delay: file
                    .feed
                    .resubscribe_initial_ms
                    .map_or(defaults.resubscribe.initial_delay, ms),
                max_delay: file
                    .feed
                    .resubscribe_max_ms
                    .map_or(defaults.resubscribe.max_delay, ms),
                multiplier: file
                    .feed
                    .resubscribe_multiplier
                    .unwrap_or(defaults.resubscribe.multiplier),
            },
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .filter(|format| {
                    let valid = is_valid_timestamp_format(format);
                    if !valid {
                        tracing::warn!(%format, "invalid timestamp format, using default");
                    }
                    valid
                })
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// Engine sizing and retry settings.
    #[must_use]
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            channel_capacity: self.channel_capacity,
            event_buffer: self.event_buffer,
            resubscribe: self.resubscribe.clone(),
        }
    }

    /// Exchange pacing.
    #[must_use]
    pub const fn to_delays(&self) -> SimulatedDelays {
        SimulatedDelays {
            ack: self.ack_delay,
            think_min: self.think_min,
            think_jitter: self.think_jitter,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Chat with a simulated assistant over a reconciled message store")]
pub struct CliArgs {
    /// Path to config file (default: `~/.config/fulcrum/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Delay before a sent message is acknowledged, in milliseconds.
    #[arg(long, env = "FULCRUM_ACK_DELAY_MS")]
    pub ack_delay_ms: Option<u64>,

    /// Minimum assistant think time, in milliseconds.
    #[arg(long, env = "FULCRUM_THINK_MIN_MS")]
    pub think_min_ms: Option<u64>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "FULCRUM_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/fulcrum.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Whether `format` parses as a chrono strftime string.
fn is_valid_timestamp_format(format: &str) -> bool {
    StrftimeItems::new(format).all(|item| !matches!(item, Item::Error))
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("fulcrum").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
