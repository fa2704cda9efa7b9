//! MPRTP - Multipath RTP loss detection
//!
//! High-level API over the loss-detection engine: estimator selection, the
//! timer-driving event loop glue, and receiver feedback bookkeeping.

pub use mprtp_io as io;
pub use mprtp_multipath as multipath;
pub use mprtp_protocol as protocol;

pub mod any;
pub mod driver;
pub mod feedback;

pub use any::AnyEstimator;
pub use driver::{EstimatorDriver, EventHandler};
pub use feedback::{
    ComparisonEvent, FeedbackError, FeedbackHandle, FeedbackManager, FeedbackStats,
    PendingFeedback, RtxOutcome,
};

// Re-export commonly used types
pub use protocol::{Arrival, EstimatorEvent, SeqNumber, SessionCapabilities};
pub use io::Timestamp;
