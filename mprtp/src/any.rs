//! Closed set of estimator strategies
//!
//! The strategy is chosen once from the session configuration; everything
//! downstream talks to it through the [`Estimator`] capability.

use mprtp_io::Timestamp;
use mprtp_multipath::{CrossPathConfig, CrossPathEstimator};
use mprtp_protocol::{
    Action, Arrival, ConfigError, Estimator, EstimatorDiagnostics, EstimatorKind, LossStatistics,
    PredictorConfig, SeqNumber, SinglePathConfig, SinglePathEstimator, TimerKey,
};

/// Either estimator strategy
#[derive(Debug)]
pub enum AnyEstimator {
    SinglePath(SinglePathEstimator),
    CrossPath(CrossPathEstimator),
}

impl AnyEstimator {
    /// Build `kind` with default estimator constants
    pub fn build(kind: EstimatorKind, predictor: &PredictorConfig) -> Result<Self, ConfigError> {
        Self::with_configs(
            kind,
            predictor,
            SinglePathConfig::default(),
            CrossPathConfig::default(),
        )
    }

    /// Build `kind`, taking its constants from the matching config
    pub fn with_configs(
        kind: EstimatorKind,
        predictor: &PredictorConfig,
        single: SinglePathConfig,
        cross: CrossPathConfig,
    ) -> Result<Self, ConfigError> {
        Ok(match kind {
            EstimatorKind::SinglePath => {
                AnyEstimator::SinglePath(SinglePathEstimator::new(predictor, single)?)
            }
            EstimatorKind::CrossPath => {
                AnyEstimator::CrossPath(CrossPathEstimator::new(predictor, cross)?)
            }
        })
    }

    /// Strategy of this estimator
    pub fn kind(&self) -> EstimatorKind {
        match self {
            AnyEstimator::SinglePath(_) => EstimatorKind::SinglePath,
            AnyEstimator::CrossPath(_) => EstimatorKind::CrossPath,
        }
    }

    pub fn as_single_path(&self) -> Option<&SinglePathEstimator> {
        match self {
            AnyEstimator::SinglePath(e) => Some(e),
            AnyEstimator::CrossPath(_) => None,
        }
    }

    pub fn as_cross_path(&self) -> Option<&CrossPathEstimator> {
        match self {
            AnyEstimator::CrossPath(e) => Some(e),
            AnyEstimator::SinglePath(_) => None,
        }
    }

    fn inner(&self) -> &dyn Estimator {
        match self {
            AnyEstimator::SinglePath(e) => e,
            AnyEstimator::CrossPath(e) => e,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Estimator {
        match self {
            AnyEstimator::SinglePath(e) => e,
            AnyEstimator::CrossPath(e) => e,
        }
    }
}

impl Estimator for AnyEstimator {
    fn on_packet_arrival(&mut self, now: Timestamp, arrival: &Arrival, actions: &mut Vec<Action>) {
        self.inner_mut().on_packet_arrival(now, arrival, actions)
    }

    fn on_rtx_packet_arrival(&mut self, now: Timestamp, arrival: &Arrival, actions: &mut Vec<Action>) {
        self.inner_mut().on_rtx_packet_arrival(now, arrival, actions)
    }

    fn on_timeout(&mut self, now: Timestamp, key: TimerKey, actions: &mut Vec<Action>) {
        self.inner_mut().on_timeout(now, key, actions)
    }

    fn note_false_positive_removed(&mut self, seq: SeqNumber) {
        self.inner_mut().note_false_positive_removed(seq)
    }

    fn reset(&mut self, actions: &mut Vec<Action>) {
        self.inner_mut().reset(actions)
    }

    fn stop(&mut self, actions: &mut Vec<Action>) {
        self.inner_mut().stop(actions)
    }

    fn diagnostics(&self) -> EstimatorDiagnostics {
        self.inner().diagnostics()
    }

    fn loss_statistics(&self) -> LossStatistics {
        self.inner().loss_statistics()
    }

    fn log_statistics(&self) {
        self.inner().log_statistics()
    }

    fn name(&self) -> &'static str {
        self.inner().name()
    }
}
