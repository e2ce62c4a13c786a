//! Library configuration.
//!
//! Loaded once from a JSON file (default `~/.ubiq/configuration`,
//! overridable via `UBIQ_CONFIGURATION_FILE_PATH`) and immutable
//! afterwards. A missing file means defaults; a malformed file is an
//! error; unknown keys are ignored.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Unit to which usage-event timestamps are floored before reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampGranularity {
    #[default]
    Micros,
    Millis,
    Seconds,
    Minutes,
    Hours,
    HalfDays,
    Days,
}

impl TimestampGranularity {
    /// Case-insensitive parse; anything unrecognized falls back to
    /// microseconds, matching the server's default.
    pub fn from_name(name: &str) -> Self {
        match name.to_uppercase().as_str() {
            "MILLIS" => TimestampGranularity::Millis,
            "SECONDS" => TimestampGranularity::Seconds,
            "MINUTES" => TimestampGranularity::Minutes,
            "HOURS" => TimestampGranularity::Hours,
            "HALF_DAYS" => TimestampGranularity::HalfDays,
            "DAYS" => TimestampGranularity::Days,
            _ => TimestampGranularity::Micros,
        }
    }

    /// Granule width in microseconds. `HALF_DAYS` floors from UTC
    /// midnight, so 12h granules land on hour 0 or hour 12.
    pub(crate) fn granule_micros(self) -> i64 {
        match self {
            TimestampGranularity::Micros => 1,
            TimestampGranularity::Millis => 1_000,
            TimestampGranularity::Seconds => 1_000_000,
            TimestampGranularity::Minutes => 60 * 1_000_000,
            TimestampGranularity::Hours => 3_600 * 1_000_000,
            TimestampGranularity::HalfDays => 43_200 * 1_000_000,
            TimestampGranularity::Days => 86_400 * 1_000_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventReporting {
    /// Seconds between wake-ups of the background worker.
    pub wake_interval: u64,
    /// Queued-event count that triggers an early flush.
    pub minimum_count: usize,
    /// Seconds after which a flush happens regardless of count.
    pub flush_interval: u64,
    /// Swallow (and log) flush errors instead of surfacing them.
    pub trap_exceptions: bool,
    pub timestamp_granularity: TimestampGranularity,
    /// Flush inline from the calling thread instead of a worker.
    pub synchronous: bool,
}

impl Default for EventReporting {
    fn default() -> Self {
        EventReporting {
            wake_interval: 10,
            minimum_count: 50,
            flush_interval: 90,
            trap_exceptions: false,
            timestamp_granularity: TimestampGranularity::Micros,
            synchronous: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Logging {
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct KeyCaching {
    pub unstructured: bool,
    pub structured: bool,
    /// Store wrapped blobs only; unwrap on every retrieval.
    pub encrypt: bool,
    pub ttl_seconds: u64,
}

impl Default for KeyCaching {
    fn default() -> Self {
        KeyCaching {
            unstructured: true,
            structured: true,
            encrypt: false,
            ttl_seconds: 1800,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub event_reporting: EventReporting,
    pub logging: Logging,
    pub key_caching: KeyCaching,
}

// Wire shape of the configuration file: every section and key optional
// so partial files merge onto the defaults.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    event_reporting: Option<EventReportingFile>,
    logging: Option<LoggingFile>,
    key_caching: Option<KeyCachingFile>,
}

#[derive(Debug, Default, Deserialize)]
struct EventReportingFile {
    wake_interval: Option<u64>,
    minimum_count: Option<usize>,
    flush_interval: Option<u64>,
    trap_exceptions: Option<bool>,
    timestamp_granularity: Option<String>,
    synchronous: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingFile {
    verbose: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct KeyCachingFile {
    unstructured: Option<bool>,
    structured: Option<bool>,
    encrypt: Option<bool>,
    ttl_seconds: Option<u64>,
}

impl Configuration {
    /// Load from the given file, or from the conventional location when
    /// `path` is `None`. A nonexistent file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path(),
        };

        if !path.exists() {
            return Ok(Configuration::default());
        }

        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Parse a configuration document, merging onto the defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(text)
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        let mut cfg = Configuration::default();
        if let Some(er) = file.event_reporting {
            if let Some(v) = er.wake_interval {
                cfg.event_reporting.wake_interval = v;
            }
            if let Some(v) = er.minimum_count {
                cfg.event_reporting.minimum_count = v;
            }
            if let Some(v) = er.flush_interval {
                cfg.event_reporting.flush_interval = v;
            }
            if let Some(v) = er.trap_exceptions {
                cfg.event_reporting.trap_exceptions = v;
            }
            if let Some(v) = er.timestamp_granularity {
                cfg.event_reporting.timestamp_granularity =
                    TimestampGranularity::from_name(&v);
            }
            if let Some(v) = er.synchronous {
                cfg.event_reporting.synchronous = v;
            }
        }
        if let Some(lg) = file.logging {
            if let Some(v) = lg.verbose {
                cfg.logging.verbose = v;
            }
        }
        if let Some(kc) = file.key_caching {
            if let Some(v) = kc.unstructured {
                cfg.key_caching.unstructured = v;
            }
            if let Some(v) = kc.structured {
                cfg.key_caching.structured = v;
            }
            if let Some(v) = kc.encrypt {
                cfg.key_caching.encrypt = v;
            }
            if let Some(v) = kc.ttl_seconds {
                cfg.key_caching.ttl_seconds = v;
            }
        }
        Ok(cfg)
    }
}

fn default_config_path() -> PathBuf {
    if let Ok(p) = std::env::var("UBIQ_CONFIGURATION_FILE_PATH") {
        return PathBuf::from(p);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ubiq")
        .join("configuration")
}
