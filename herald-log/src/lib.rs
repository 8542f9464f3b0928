//! Herald Logging
//!
//! Installs a `tracing` subscriber for Herald services, driven by the
//! `HERALD_*` environment variables. Library crates in the workspace only
//! emit through the `tracing` macros; binaries and tests call [`init`] once.
//!
//! # Usage
//!
//! ```rust,no_run
//! herald_log::init();
//! tracing::info!(topic = "user-events", "Listener started");
//! ```
//!
//! # Environment Variables
//!
//! - `HERALD_DEBUG=1` - Enable debug logging
//! - `HERALD_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//! - `HERALD_LOG_FORMAT=pretty|json|compact` - Set output format
//! - `HERALD_LOG_COLOR=1|0` - Enable/disable colors
//!
//! `RUST_LOG`, when set, overrides the level with a full filter directive.

use herald_config::{EnvLoader, Vars};
use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

// ============================================================================
// Log Levels
// ============================================================================

/// Log level for Herald logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Trace level (most verbose)
    Trace = 0,
    /// Debug level
    Debug = 1,
    /// Info level
    Info = 2,
    /// Warning level
    Warn = 3,
    /// Error level (least verbose)
    Error = 4,
    /// Off (no logging)
    Off = 5,
}

impl Level {
    /// Get level from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "off" | "none" => Some(Level::Off),
            _ => None,
        }
    }

    /// Filter directive understood by `EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Off => "off",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_directive().to_uppercase())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Multi-line human readable output
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for structured logging
    Json,
}

impl Format {
    /// Get format from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Some(Format::Pretty),
            "compact" => Some(Format::Compact),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Whether debug mode is enabled
    pub debug: bool,
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether colors are enabled
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: Level::Info,
            format: Format::Json,
            color: false,
        }
    }
}

impl LogConfig {
    /// Create config from `HERALD_*` environment variables.
    pub fn from_env() -> Self {
        let vars = EnvLoader::with_prefix("HERALD").load().unwrap_or_default();
        Self::from_vars(&vars)
    }

    /// Create config from already-loaded variables (prefix stripped).
    ///
    /// Unparseable values fall back to the defaults instead of failing
    /// startup.
    pub fn from_vars(vars: &Vars) -> Self {
        let debug = vars.flag("debug").ok().flatten().unwrap_or(false);

        let level = vars
            .get("log_level")
            .and_then(Level::parse)
            .unwrap_or(if debug { Level::Debug } else { Level::Info });

        let format = vars
            .get("log_format")
            .and_then(Format::parse)
            .unwrap_or(Format::Json);

        let color = vars
            .flag("log_color")
            .ok()
            .flatten()
            .unwrap_or(format == Format::Pretty);

        Self {
            debug,
            level,
            format,
            color,
        }
    }

    /// Filter used when `RUST_LOG` is absent.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_directive()))
    }
}

// ============================================================================
// Public API
// ============================================================================

static INSTALLED: OnceCell<LogConfig> = OnceCell::new();

/// Initialize logging from the environment.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    init_with(LogConfig::from_env());
}

/// Initialize logging with an explicit configuration.
pub fn init_with(config: LogConfig) {
    INSTALLED.get_or_init(|| {
        let filter = config.filter();
        let registry = tracing_subscriber::registry().with(filter);

        // Another subscriber may already be installed (for example by a test
        // harness); that is not an error for us.
        let _ = match config.format {
            Format::Json => registry
                .with(fmt::layer().json().with_current_span(true))
                .try_init(),
            Format::Compact => registry
                .with(fmt::layer().compact().with_ansi(config.color))
                .try_init(),
            Format::Pretty => registry
                .with(fmt::layer().pretty().with_ansi(config.color))
                .try_init(),
        };

        config
    });
}

/// Configuration installed by the first [`init`] call, if any.
pub fn installed() -> Option<&'static LogConfig> {
    INSTALLED.get()
}
