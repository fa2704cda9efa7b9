//! Negotiated session capabilities
//!
//! The facts the loss-detection engine consumes from offer/answer
//! negotiation: which feedback types the peer understands, whether
//! retransmission is enabled, and how the estimators are configured.

use crate::predictor::PredictorConfig;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default age after which a retransmission is considered late
pub const DEFAULT_RTX_LATE_AFTER: Duration = Duration::from_millis(500);

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Unknown predictor: {0}")]
    UnknownPredictor(String),

    #[error("Unknown estimator: {0}")]
    UnknownEstimator(String),

    #[error("History size must be positive, got {0}")]
    InvalidHistorySize(usize),

    #[error("Bias sample count must be positive, got {0}")]
    InvalidBiasSamples(usize),

    #[error("Premature timeout probability must lie in (0, 1), got {0}")]
    InvalidProbability(f64),

    #[error("Comparison estimator requires NACK feedback with retransmission")]
    ComparisonWithoutNack,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Loss estimator strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorKind {
    /// One predictive timer over the global sequence space
    SinglePath,
    /// Dual-timer estimator across concurrent flows
    CrossPath,
}

impl EstimatorKind {
    /// Canonical configuration name
    pub fn as_str(self) -> &'static str {
        match self {
            EstimatorKind::SinglePath => "single-path",
            EstimatorKind::CrossPath => "cross-path",
        }
    }
}

impl fmt::Display for EstimatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EstimatorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single-path" | "single_path" | "single" | "basic" => Ok(EstimatorKind::SinglePath),
            "cross-path" | "cross_path" | "cross" | "multipath" => Ok(EstimatorKind::CrossPath),
            _ => Err(ConfigError::UnknownEstimator(s.to_string())),
        }
    }
}

/// Feedback mode selected from the negotiated capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackMode {
    /// Predictive loss detection feeding NACKs
    Nack,
    /// Positive acknowledgement of every received sequence number
    Ack,
    /// No receiver feedback
    None,
}

/// Negotiated session facts
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCapabilities {
    /// Peer accepts generic NACK feedback
    pub nack: bool,
    /// Peer accepts ACK feedback
    pub ack: bool,
    /// Retransmission stream negotiated
    pub rtx: bool,
    /// Estimator driving real feedback
    pub primary: EstimatorKind,
    /// Estimator run alongside for comparison only
    pub comparison: Option<EstimatorKind>,
    /// Predictor used by every estimator role
    pub predictor: PredictorConfig,
    /// Retransmissions arriving later than this after the request are late
    pub rtx_late_after: Duration,
}

impl SessionCapabilities {
    /// NACK with retransmission and a single-path estimator
    pub fn nack_with_rtx() -> Self {
        SessionCapabilities {
            nack: true,
            ack: false,
            rtx: true,
            primary: EstimatorKind::SinglePath,
            comparison: None,
            predictor: PredictorConfig::default(),
            rtx_late_after: DEFAULT_RTX_LATE_AFTER,
        }
    }

    /// NACK with retransmission and the cross-path estimator
    pub fn multipath_nack() -> Self {
        SessionCapabilities {
            primary: EstimatorKind::CrossPath,
            ..Self::nack_with_rtx()
        }
    }

    /// ACK feedback only
    pub fn ack_only() -> Self {
        SessionCapabilities {
            nack: false,
            ack: true,
            rtx: false,
            ..Self::nack_with_rtx()
        }
    }

    /// Feedback mode implied by the negotiated facts
    pub fn feedback_mode(&self) -> FeedbackMode {
        if self.nack && self.rtx {
            FeedbackMode::Nack
        } else if self.ack {
            FeedbackMode::Ack
        } else {
            FeedbackMode::None
        }
    }

    /// Check the capabilities for contradictions
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feedback_mode() == FeedbackMode::Nack {
            self.predictor.validate()?;
        } else if self.comparison.is_some() {
            return Err(ConfigError::ComparisonWithoutNack);
        }
        Ok(())
    }
}

impl Default for SessionCapabilities {
    fn default() -> Self {
        Self::nack_with_rtx()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_mode_selection() {
        assert_eq!(SessionCapabilities::nack_with_rtx().feedback_mode(), FeedbackMode::Nack);
        assert_eq!(SessionCapabilities::ack_only().feedback_mode(), FeedbackMode::Ack);

        // NACK without RTX falls back to ACK when available
        let caps = SessionCapabilities {
            rtx: false,
            ack: true,
            ..SessionCapabilities::nack_with_rtx()
        };
        assert_eq!(caps.feedback_mode(), FeedbackMode::Ack);

        let caps = SessionCapabilities {
            rtx: false,
            ..SessionCapabilities::nack_with_rtx()
        };
        assert_eq!(caps.feedback_mode(), FeedbackMode::None);
    }

    #[test]
    fn test_estimator_kind_parsing() {
        assert_eq!("cross-path".parse::<EstimatorKind>().unwrap(), EstimatorKind::CrossPath);
        assert_eq!("Single".parse::<EstimatorKind>().unwrap(), EstimatorKind::SinglePath);
        assert!(matches!(
            "random".parse::<EstimatorKind>(),
            Err(ConfigError::UnknownEstimator(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(SessionCapabilities::multipath_nack().validate().is_ok());

        let caps = SessionCapabilities {
            comparison: Some(EstimatorKind::SinglePath),
            ..SessionCapabilities::ack_only()
        };
        assert_eq!(caps.validate(), Err(ConfigError::ComparisonWithoutNack));

        let mut caps = SessionCapabilities::nack_with_rtx();
        caps.predictor.premature_timeout_probability = 0.0;
        assert!(matches!(caps.validate(), Err(ConfigError::InvalidProbability(_))));
    }
}
