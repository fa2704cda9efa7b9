//! MPRTP Multipath Estimation
//!
//! This crate implements loss estimation across concurrent flows: per-flow
//! arrival windows, the cross-path state machine, and the dual-timer
//! cross-path estimator.

pub mod cross_path;
pub mod flow;
pub mod state;

pub use cross_path::{CrossPathConfig, CrossPathDiagnostics, CrossPathEstimator};
pub use flow::{ArrivalRecord, Flow, FlowStats, FlowTable, FlowUpdate};
pub use state::{CrossPathState, Trigger};
