//! Tollgate - Telemetry Governance Layer
//!
//! This crate decides which log and trace events a service records, redacts
//! sensitive content before events leave the process, and continuously tunes
//! its own cost (sampling ceiling, exporter batch and buffer sizes) against
//! measured system load.

pub mod config;
pub mod error;
pub mod event;
pub mod governor;
pub mod optimizer;
pub mod sampling;
pub mod security;

pub use config::TollgateConfig;
pub use error::{Result, TollgateError};
pub use event::{Attributes, Event, GovernedEvent};
pub use governor::{Governor, GovernorStats};
pub use sampling::Severity;
