//! Event severities and per-severity base rates.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::check_fraction;
use crate::error::Result;

/// Severity of a candidate telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    /// All severities in ascending order.
    pub const ALL: [Severity; 5] = [
        Severity::Debug,
        Severity::Info,
        Severity::Warn,
        Severity::Error,
        Severity::Fatal,
    ];

    /// Position of this severity in [`Severity::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Error and fatal events bypass every sampling gate.
    pub fn is_always_recorded(self) -> bool {
        self >= Severity::Error
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base sampling probability for each severity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelRates {
    #[serde(default = "default_debug_rate")]
    pub debug: f64,
    #[serde(default = "default_rate")]
    pub info: f64,
    #[serde(default = "default_rate")]
    pub warn: f64,
    #[serde(default = "default_rate")]
    pub error: f64,
    #[serde(default = "default_rate")]
    pub fatal: f64,
}

impl Default for LevelRates {
    fn default() -> Self {
        Self {
            debug: default_debug_rate(),
            info: default_rate(),
            warn: default_rate(),
            error: default_rate(),
            fatal: default_rate(),
        }
    }
}

fn default_debug_rate() -> f64 {
    0.1
}

fn default_rate() -> f64 {
    1.0
}

impl LevelRates {
    pub fn get(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Debug => self.debug,
            Severity::Info => self.info,
            Severity::Warn => self.warn,
            Severity::Error => self.error,
            Severity::Fatal => self.fatal,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for severity in Severity::ALL {
            check_fraction(&format!("sampling.rates.{severity}"), self.get(severity))?;
        }
        Ok(())
    }
}
