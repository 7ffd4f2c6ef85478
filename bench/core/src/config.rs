//! TOML Configuration File Support
//!
//! Configuration for the bench, from `~/.config/armbench/bench.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! ip = "0.0.0.0"
//! port = 19738
//!
//! [scheduler]
//! interval_ms = 250
//!
//! [[selection]]
//! arm = 1
//! attribute = "is_selected"
//! value = "true"
//!
//! [[selection]]
//! arm = 3
//! attribute = "instrument_type"
//! value = "change"
//! ```
//!
//! The port stays text until the server starts, so a bad port is reported
//! by the start attempt itself.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attributes::{attribute, Selection, NUM_ARMS};
use crate::scheduler::{parse_interval, DEFAULT_INTERVAL};

/// Default listen address
pub const DEFAULT_IP: &str = "127.0.0.1";

/// Default listen port
pub const DEFAULT_PORT: &str = "19738";

/// Environment variable overriding the listen address
pub const ENV_IP: &str = "ARMBENCH_IP";

/// Environment variable overriding the listen port
pub const ENV_PORT: &str = "ARMBENCH_PORT";

/// Environment variable overriding the scheduler interval (ms)
pub const ENV_INTERVAL_MS: &str = "ARMBENCH_INTERVAL_MS";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Attribute Selections
// =============================================================================

/// A pre-enabled attribute selection, `ARM:ATTRIBUTE=VALUE`
///
/// The arm is 1-based here, as the operator sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionSpec {
    /// Arm number, `1..=NUM_ARMS`
    pub arm: usize,
    /// Attribute name
    pub attribute: String,
    /// `change`, `random`, or a literal value
    pub value: String,
}

/// A [`SelectionSpec`] checked against the attribute catalog
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSelection {
    /// Zero-based arm index
    pub arm: usize,
    /// Canonical attribute name
    pub attribute: &'static str,
    /// Parsed selection
    pub selection: Selection,
}

impl SelectionSpec {
    /// Check arm, attribute and value
    pub fn resolve(&self) -> Result<ResolvedSelection, ConfigError> {
        if !(1..=NUM_ARMS).contains(&self.arm) {
            return Err(ConfigError::ValidationError(format!(
                "arm {} out of range 1..={NUM_ARMS}",
                self.arm
            )));
        }
        let (_, attr) =
            attribute(&self.attribute).map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        let selection = Selection::parse(attr, &self.value)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(ResolvedSelection {
            arm: self.arm - 1,
            attribute: attr.name(),
            selection,
        })
    }
}

impl FromStr for SelectionSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ConfigError::ValidationError(format!(
                "expected ARM:ATTRIBUTE=VALUE, got {s:?}"
            ))
        };
        let (arm, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (attribute, value) = rest.split_once('=').ok_or_else(invalid)?;
        let arm = arm.trim().parse().map_err(|_| invalid())?;

        let spec = Self {
            arm,
            attribute: attribute.trim().to_string(),
            value: value.trim().to_string(),
        };
        spec.resolve()?;
        Ok(spec)
    }
}

impl fmt::Display for SelectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}={}", self.arm, self.attribute, self.value)
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// A port written either as a number or as a string
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortToml {
    /// `port = 19738`
    Number(i64),
    /// `port = "19738"`
    Text(String),
}

impl fmt::Display for PortToml {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address
    pub ip: Option<String>,

    /// Listen port
    pub port: Option<PortToml>,
}

/// Scheduler section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerToml {
    /// Auto-send and swap-pedal-auto interval in milliseconds
    pub interval_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchToml {
    /// Server section
    pub server: ServerToml,

    /// Scheduler section
    pub scheduler: SchedulerToml,

    /// Attribute selections enabled at startup
    pub selection: Vec<SelectionSpec>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Effective bench configuration
#[derive(Clone, Debug)]
pub struct BenchConfig {
    /// Listen address
    pub ip: String,

    /// Listen port, as text
    pub port: String,

    /// Scheduler interval
    pub interval: Duration,

    /// Attribute selections enabled at startup
    pub selections: Vec<SelectionSpec>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            ip: DEFAULT_IP.to_string(),
            port: DEFAULT_PORT.to_string(),
            interval: DEFAULT_INTERVAL,
            selections: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl BenchConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Resolve every configured selection against the catalog
    pub fn resolved_selections(&self) -> Result<Vec<ResolvedSelection>, ConfigError> {
        self.selections.iter().map(SelectionSpec::resolve).collect()
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/armbench/bench.toml` or
/// `~/.config/armbench/bench.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("armbench").join("bench.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<BenchConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read, parsed or
/// validated.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<BenchConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration from a path, then variables read through `lookup`
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env<F>(
    path: Option<PathBuf>,
    lookup: F,
) -> Result<BenchConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = load_file_config(path)?;
    apply_env_config(&mut config, lookup);
    Ok(config)
}

/// Defaults overlaid with the TOML file, without the environment
fn load_file_config(path: Option<PathBuf>) -> Result<BenchConfig, ConfigError> {
    let mut config = BenchConfig::default();

    let Some(config_path) = path else {
        return Ok(config);
    };
    if !config_path.exists() {
        tracing::debug!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return Ok(config);
    }

    let toml_content =
        std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
            path: config_path.clone(),
            source: e,
        })?;

    let toml_config: BenchToml = toml::from_str(&toml_content)?;
    apply_toml_config(&mut config, toml_config)?;
    config.config_file_path = Some(config_path.clone());
    config.source = ConfigSource::File;

    tracing::info!(
        path = %config_path.display(),
        "Loaded configuration from file"
    );
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut BenchConfig, toml: BenchToml) -> Result<(), ConfigError> {
    if let Some(ip) = toml.server.ip {
        config.ip = ip;
    }
    if let Some(port) = toml.server.port {
        config.port = port.to_string();
    }
    if let Some(ms) = toml.scheduler.interval_ms {
        if ms == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.interval_ms must be positive".to_string(),
            ));
        }
        config.interval = Duration::from_millis(ms);
    }
    for selection in &toml.selection {
        selection.resolve()?;
    }
    config.selections = toml.selection;
    Ok(())
}

/// Apply environment variable overrides to the config
///
/// `lookup` reads one variable; tests pass a map instead of the process
/// environment.
fn apply_env_config<F>(config: &mut BenchConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(ip) = lookup(ENV_IP) {
        config.ip = ip;
        config.source = ConfigSource::Env;
    }
    if let Some(port) = lookup(ENV_PORT) {
        config.port = port;
        config.source = ConfigSource::Env;
    }
    if let Some(interval) = lookup(ENV_INTERVAL_MS) {
        config.interval = interval_or_default(&interval, ENV_INTERVAL_MS);
        config.source = ConfigSource::Env;
    }
}

fn interval_or_default(text: &str, origin: &str) -> Duration {
    parse_interval(text).unwrap_or_else(|| {
        tracing::warn!(
            origin,
            value = %text,
            default_ms = %DEFAULT_INTERVAL.as_millis(),
            "Invalid interval, using default"
        );
        DEFAULT_INTERVAL
    })
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub ip: Option<String>,

    /// Listen port override
    pub port: Option<String>,

    /// Interval override, as operator text in milliseconds
    pub interval_ms: Option<String>,

    /// Extra selections, applied after the file's
    pub selections: Vec<SelectionSpec>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_ip(mut self, ip: String) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Set listen port override
    #[must_use]
    pub fn with_port(mut self, port: String) -> Self {
        self.port = Some(port);
        self
    }

    /// Set interval override
    #[must_use]
    pub fn with_interval_ms(mut self, interval_ms: String) -> Self {
        self.interval_ms = Some(interval_ms);
        self
    }

    /// Add a selection
    #[must_use]
    pub fn with_selection(mut self, selection: SelectionSpec) -> Self {
        self.selections.push(selection);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut BenchConfig) {
        if self.ip.is_some()
            || self.port.is_some()
            || self.interval_ms.is_some()
            || !self.selections.is_empty()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref ip) = self.ip {
            config.ip = ip.clone();
        }
        if let Some(ref port) = self.port {
            config.port = port.clone();
        }
        if let Some(ref interval) = self.interval_ms {
            config.interval = interval_or_default(interval, "--interval-ms");
        }
        config.selections.extend(self.selections.iter().cloned());
    }
}

// =============================================================================
// Tests
// =============================================================================
