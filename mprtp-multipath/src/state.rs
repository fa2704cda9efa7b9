//! Cross-path estimator state machine
//!
//! The state graph is a pure function of `(state, trigger)`. The estimator
//! decides which trigger an arrival or expiry amounts to; this module decides
//! whether that trigger moves the machine.

use std::fmt;

/// Cross-path estimator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrossPathState {
    /// Collecting samples on every flow to rank them
    LearnFlowOrder,
    /// Waiting for a reference arrival on the fastest flow
    LearnPathDifference,
    /// Waiting for the sequence after the reference on another flow
    LearnAwaitingAlternate,
    /// Waiting for a fastest-flow arrival with both predictors ready
    EstAwaitingFastest,
    /// Running; last arrival refined the delta model
    EstRunningA,
    /// Running; last arrival refined the cross-path model
    EstRunningB,
}

/// Event classes that can move the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Flow ranking completed
    FlowOrderLearned,
    /// Reference arrival recorded on the fastest flow
    ReferenceAnchored,
    /// The awaited sequence arrived on another flow
    AlternateArrived,
    /// Fastest-flow arrival with both predictors ready
    PredictorsReady,
    /// Arrival that refined the delta model
    DeltaSample,
    /// Arrival that refined the cross-path model
    CrossSample,
    /// Loss on the reference flow or of the awaited sequence
    ReferenceLost,
}

impl CrossPathState {
    /// Canonical state name
    pub fn as_str(self) -> &'static str {
        match self {
            CrossPathState::LearnFlowOrder => "LEARN_FLOW_ORDER",
            CrossPathState::LearnPathDifference => "LEARN_PATH_DIFFERENCE",
            CrossPathState::LearnAwaitingAlternate => "LEARN_AWAITING_ALTERNATE",
            CrossPathState::EstAwaitingFastest => "EST_AWAITING_FASTEST",
            CrossPathState::EstRunningA => "EST_RUNNING_A",
            CrossPathState::EstRunningB => "EST_RUNNING_B",
        }
    }

    /// Whether the dual timers are active
    pub fn is_running(self) -> bool {
        matches!(self, CrossPathState::EstRunningA | CrossPathState::EstRunningB)
    }

    /// Whether the flow order is known
    pub fn has_flow_order(self) -> bool {
        self != CrossPathState::LearnFlowOrder
    }

    /// Successor state for `trigger`, `None` if the trigger does not apply
    pub fn next(self, trigger: Trigger) -> Option<CrossPathState> {
        use CrossPathState::*;
        match (self, trigger) {
            (LearnFlowOrder, Trigger::FlowOrderLearned) => Some(LearnPathDifference),
            (LearnPathDifference, Trigger::ReferenceAnchored) => Some(LearnAwaitingAlternate),
            (LearnAwaitingAlternate, Trigger::AlternateArrived) => Some(EstAwaitingFastest),
            (EstAwaitingFastest, Trigger::PredictorsReady) => Some(EstRunningA),
            (EstRunningA | EstRunningB, Trigger::DeltaSample) => Some(EstRunningA),
            (EstRunningA | EstRunningB, Trigger::CrossSample) => Some(EstRunningB),
            (
                LearnAwaitingAlternate | EstAwaitingFastest | EstRunningA | EstRunningB,
                Trigger::ReferenceLost,
            ) => Some(LearnPathDifference),
            _ => None,
        }
    }
}

impl fmt::Display for CrossPathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CrossPathState::*;

    #[test]
    fn test_learning_path_is_linear() {
        let mut state = LearnFlowOrder;
        for trigger in [
            Trigger::FlowOrderLearned,
            Trigger::ReferenceAnchored,
            Trigger::AlternateArrived,
            Trigger::PredictorsReady,
        ] {
            state = state.next(trigger).unwrap();
        }
        assert_eq!(state, EstRunningA);
    }

    #[test]
    fn test_no_state_skipping() {
        assert_eq!(LearnFlowOrder.next(Trigger::PredictorsReady), None);
        assert_eq!(LearnPathDifference.next(Trigger::AlternateArrived), None);
        assert_eq!(LearnFlowOrder.next(Trigger::ReferenceLost), None);
        assert_eq!(EstAwaitingFastest.next(Trigger::CrossSample), None);
    }

    #[test]
    fn test_running_alternates() {
        assert_eq!(EstRunningA.next(Trigger::CrossSample), Some(EstRunningB));
        assert_eq!(EstRunningB.next(Trigger::DeltaSample), Some(EstRunningA));
        assert_eq!(EstRunningB.next(Trigger::CrossSample), Some(EstRunningB));
    }

    #[test]
    fn test_regression_targets_path_difference() {
        for state in [LearnAwaitingAlternate, EstAwaitingFastest, EstRunningA, EstRunningB] {
            assert_eq!(state.next(Trigger::ReferenceLost), Some(LearnPathDifference));
        }
    }

    #[test]
    fn test_names() {
        assert_eq!(EstRunningB.to_string(), "EST_RUNNING_B");
        assert!(EstRunningA.is_running());
        assert!(!EstAwaitingFastest.is_running());
        assert!(!LearnFlowOrder.has_flow_order());
    }
}
