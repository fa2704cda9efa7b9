//! MPRTP CLI Library
//!
//! Shared functionality for the MPRTP command-line tools.

pub mod config;
pub mod sim;
pub mod stats;

pub use config::{Config, ConfigError, FeedbackSetting, FlowConfig};
pub use sim::{generate_trace, run, SimReport, Simulator, TracePacket};
pub use stats::{compact_report, display_report, format_delay, format_duration, format_percent};
