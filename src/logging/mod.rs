//! Logging infrastructure - structured tracing for the allocators
//!
//! Design: The allocators emit `tracing` events (`event = "heap_alloc"`, ...)
//! and never install a subscriber themselves. Applications either bring their
//! own subscriber or call [`init`] once:
//! - `trace` for every allocation, free, reset and context switch
//! - `debug` for allocator lifetime and realloc decisions
//! - `error` right before a fatal allocator failure
//!
//! Zero-cost when disabled; `RUST_LOG` overrides the configured level.

use std::io;
use std::str::FromStr;

use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Target prefix of every event emitted by this crate
pub const TARGET: &str = "typheus_memory";

static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level applied to this crate's events
    pub level: Level,
    pub format: LogFormat,
    /// Emit span open/close events
    pub span_events: bool,
    /// Extra filter directives, e.g. `"typheus_memory::heap=trace"`
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `TYPHEUS_MEM_LOG_LEVEL`, `TYPHEUS_MEM_LOG_FORMAT` and
    /// `TYPHEUS_MEM_LOG_SPANS`; unset or unparsable values keep the default
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        // trace, debug, info, warn, error
        if let Some(level) = var("TYPHEUS_MEM_LOG_LEVEL").and_then(|s| Level::from_str(&s).ok()) {
            config.level = level;
        }

        // pretty, compact, json
        if let Some(format) = var("TYPHEUS_MEM_LOG_FORMAT").and_then(|s| s.parse().ok()) {
            config.format = format;
        }

        config.span_events = var("TYPHEUS_MEM_LOG_SPANS")
            .map(|val| val == "1" || val.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        config
    }

    /// Errors only
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Every allocator event, human-readable
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            format: LogFormat::Pretty,
            span_events: true,
            filter: None,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn directives(&self) -> String {
        let base = format!("{}={}", TARGET, self.level.as_str().to_lowercase());
        match &self.filter {
            Some(extra) => format!("{},{}", base, extra),
            None => base,
        }
    }
}

/// Initialize logging from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Install a global subscriber for `config`.
///
/// Only the first call has an effect. If the application already installed
/// its own subscriber, that one is kept.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.directives()));

        let span_events = if config.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let layer = fmt::layer()
            .with_writer(io::stderr)
            .with_span_events(span_events)
            .with_target(true)
            .with_thread_ids(cfg!(debug_assertions));

        let layer = match config.format {
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Json => layer.json().boxed(),
        };

        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!(event = "logging_skipped", "Global subscriber already set");
        }
    });
}

pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}
