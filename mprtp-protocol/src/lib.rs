//! MPRTP Loss Estimation Core
//!
//! This crate implements the single-path half of the loss-detection engine:
//! wraparound sequence arithmetic, interval predictors, per-sequence loss
//! bookkeeping, the estimator capability shared with the multipath estimator,
//! the single-path predictive estimator, and negotiated session capabilities.

pub mod estimator;
pub mod loss;
pub mod predictor;
pub mod sequence;
pub mod session;
pub mod single_path;

pub use estimator::{
    future_deadline, Action, Arrival, Estimator, EstimatorDiagnostics, EstimatorEvent,
    FlowPosition, TimerKey,
};
pub use loss::{LossStatistics, LossStatisticsTracker, PacketStatus, Reception};
pub use predictor::{Ar2, MovingAverage, Predictor, PredictorConfig, PredictorKind};
pub use sequence::SeqNumber;
pub use session::{ConfigError, EstimatorKind, FeedbackMode, SessionCapabilities};
pub use single_path::{SinglePathConfig, SinglePathEstimator, SinglePathState};
