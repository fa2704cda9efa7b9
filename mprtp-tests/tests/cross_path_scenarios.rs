//! Cross-path estimator scenarios on two interleaved flows
//!
//! Even sequence numbers travel on flow 0 and odd ones on flow 1, one packet
//! every 10ms overall. Each loss must be declared exactly once: by the long
//! timer once the estimator runs, from the flow's own numbering before that.

use mprtp::{AnyEstimator, EstimatorEvent};
use mprtp_multipath::{CrossPathConfig, CrossPathEstimator, CrossPathState};
use mprtp_protocol::{Estimator, EstimatorKind, FlowPosition, PredictorConfig, TimerKey};
use mprtp_tests::{interleaved, ms, seq, Replay};

fn quick() -> CrossPathEstimator {
    let predictor = PredictorConfig {
        bias_samples: 2,
        ..PredictorConfig::default()
    };
    let config = CrossPathConfig {
        min_flow_samples: 2,
        ..CrossPathConfig::default()
    };
    CrossPathEstimator::new(&predictor, config).unwrap()
}

fn default_estimator() -> CrossPathEstimator {
    CrossPathEstimator::new(&PredictorConfig::default(), CrossPathConfig::default()).unwrap()
}

#[test]
fn test_equal_offsets_first_flow_fastest() {
    let mut replay = Replay::new(default_estimator());
    replay.feed(&interleaved(0..12, 0, &[]));

    let est = replay.driver.estimator();
    assert!(est.state().is_running());
    assert_eq!(est.fastest_flow(), Some(0));
    assert_eq!(est.flow_order(), &[0, 1]);
    assert!(replay.lost().is_empty());
    assert!(replay.driver.has_timer(&TimerKey::Short));
}

#[test]
fn test_slow_path_not_chosen_as_fastest() {
    let mut replay = Replay::new(default_estimator());
    replay.feed(&interleaved(0..16, 30, &[]));

    let est = replay.driver.estimator();
    assert_eq!(est.fastest_flow(), Some(0));
    assert_eq!(est.flow_order(), &[0, 1]);
}

#[test]
fn test_slow_flow_loss_declared_by_long_timer() {
    let mut replay = Replay::new(quick());
    replay.feed(&interleaved(0..7, 0, &[]));
    assert!(replay.driver.estimator().state().is_running());

    replay.feed(&interleaved(7..20, 0, &[7]));

    let events = replay.events();
    assert_eq!(events.len(), 1);
    let (at, event) = events[0];
    assert_eq!(
        event,
        EstimatorEvent::Lost {
            seq: seq(7),
            flow: None
        }
    );
    assert!(at > ms(70));
    assert!(at <= ms(75));
}

#[test]
fn test_consistently_late_path_is_not_lossy() {
    let mut replay = Replay::new(quick());
    replay.feed(&interleaved(0..60, 4, &[]));

    assert!(replay.lost().is_empty());
    assert!(replay.false_positives().is_empty());
    assert_eq!(replay.driver.estimator().long_timer_count(), 0);
}

#[test]
fn test_each_loss_reported_once() {
    let mut replay = Replay::new(quick());
    replay.feed(&interleaved(0..40, 3, &[13, 14, 15, 27]));
    assert_eq!(replay.lost(), vec![13, 14, 15, 27]);
    assert!(replay.false_positives().is_empty());
}

#[test]
fn test_default_config_detects_loss() {
    let mut replay = Replay::new(default_estimator());
    replay.feed(&interleaved(0..16, 0, &[]));
    assert!(replay.driver.estimator().state().is_running());

    replay.feed(&interleaved(16..30, 0, &[21]));
    assert_eq!(replay.lost(), vec![21]);
}

#[test]
fn test_default_config_reports_loss_before_running() {
    let mut replay = Replay::new(default_estimator());
    replay.feed(&interleaved(0..20, 0, &[7]));

    assert!(replay.driver.estimator().state().is_running());
    assert_eq!(replay.lost(), vec![7]);
    assert!(replay.false_positives().is_empty());

    // No cross delay: declared once flow 1's next packet shows the gap,
    // one flow interval after 7 was due
    let events = replay.events();
    assert_eq!(events.len(), 1);
    let (at, event) = events[0];
    assert_eq!(
        event,
        EstimatorEvent::Lost {
            seq: seq(7),
            flow: Some(FlowPosition {
                flow: 1,
                flow_seq: seq(3)
            })
        }
    );
    assert!(at > ms(70));
    assert!(at <= ms(90));
}

#[test]
fn test_late_arrival_after_declaration() {
    let mut replay = Replay::new(quick());
    replay.feed(&interleaved(0..12, 0, &[9]));
    assert_eq!(replay.lost(), vec![9]);

    replay.feed(&[(ms(125), mprtp::Arrival::on_flow(seq(9), 1, seq(4)))]);
    assert_eq!(replay.false_positives(), vec![9]);
}

#[test]
fn test_through_any_estimator() {
    let predictor = PredictorConfig {
        bias_samples: 2,
        ..PredictorConfig::default()
    };
    let single = Default::default();
    let cross = CrossPathConfig {
        min_flow_samples: 2,
        ..CrossPathConfig::default()
    };
    let est = AnyEstimator::with_configs(EstimatorKind::CrossPath, &predictor, single, cross).unwrap();
    let mut replay = Replay::new(est);
    replay.feed(&interleaved(0..20, 0, &[7]));

    assert_eq!(replay.lost(), vec![7]);
    assert_eq!(replay.driver.estimator().name(), "cross-path");
    assert_eq!(replay.driver.estimator().diagnostics().losses, 1);
}

#[test]
fn test_stop_silences_estimator() {
    let mut replay = Replay::new(quick());
    replay.feed(&interleaved(0..10, 0, &[]));
    replay.driver.stop();
    assert_eq!(replay.driver.timer_count(), 0);

    replay.feed(&interleaved(10..20, 0, &[13]));
    replay.run_until(ms(1_000));
    assert!(replay.lost().is_empty());

    replay.driver.reset();
    assert_eq!(
        replay.driver.estimator().state(),
        CrossPathState::LearnFlowOrder
    );
}
