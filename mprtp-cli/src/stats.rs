//! Report display and formatting

use crate::sim::SimReport;
use mprtp_multipath::FlowStats;
use std::time::Duration;

/// Format a delay in human-readable form
pub fn format_delay(delay: Duration) -> String {
    let us = delay.as_micros();
    if us >= 1_000_000 {
        format!("{:.2}s", us as f64 / 1_000_000.0)
    } else if us >= 1_000 {
        format!("{:.2}ms", us as f64 / 1_000.0)
    } else {
        format!("{}µs", us)
    }
}

/// Format a ratio as a percentage
pub fn format_percent(ratio: f64) -> String {
    format!("{:.2}%", ratio * 100.0)
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Display the full simulation report
pub fn display_report(report: &SimReport) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ LOSS DETECTION REPORT                                       │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Estimator: {}", report.estimator);
    println!("│ Simulated: {}", format_duration(report.duration));
    println!(
        "│ Packets:   {} sent / {} delivered",
        report.packets_sent, report.delivered
    );
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ ACCURACY                                                    │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ True losses:     {} ({} detected, {} missed, rate {})",
        report.true_losses,
        report.detected_losses,
        report.missed_losses,
        format_percent(report.detection_rate())
    );
    println!(
        "│ False positives: {} ({} of declarations)",
        report.false_positives,
        format_percent(report.false_positive_rate())
    );
    println!(
        "│ Detection delay: {} mean",
        format_delay(report.mean_detection_delay())
    );
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ FEEDBACK                                                    │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Reports: {} | NACKed: {} (+{} past end) | ACKed: {}",
        report.reports, report.nacks_sent, report.stray_nacks, report.acks_sent
    );
    let fb = &report.feedback;
    println!(
        "│ Withdrawn before send: {} | Already sent: {}",
        fb.false_positives_withdrawn, fb.already_sent
    );
    println!(
        "│ RTX: {} recovered / {} late / {} duplicate, mean {}",
        fb.rtx_recovered,
        fb.rtx_late,
        fb.rtx_duplicate,
        format_delay(fb.mean_rtx_latency())
    );
    if let Some(diag) = &report.diagnostics {
        println!(
            "│ Estimator: state={} predictions={} timeouts={} resets={} error_std_dev={}",
            diag.state,
            diag.predictions,
            diag.timeouts,
            diag.resets,
            format_delay(Duration::from_micros(diag.prediction_error_std_dev.max(0.0) as u64))
        );
    }
    println!("└─────────────────────────────────────────────────────────────┘");

    if !report.flows.is_empty() {
        println!("\n┌─────────────────────────────────────────────┐");
        println!("│ PER-FLOW STATISTICS                         │");
        println!("├──────┬──────────┬──────────┬────────────────┤");
        println!("│ Flow │ Packets  │ Gaps     │ Reordered      │");
        println!("├──────┼──────────┼──────────┼────────────────┤");

        for flow in &report.flows {
            display_flow_row(flow);
        }

        println!("└──────┴──────────┴──────────┴────────────────┘");
    }
}

fn display_flow_row(stats: &FlowStats) {
    println!(
        "│ {:4} │ {:8} │ {:8} │ {:14} │",
        stats.flow_id, stats.packets, stats.flow_seq_gaps, stats.reordered
    );
}

/// One-line summary
pub fn compact_report(report: &SimReport) -> String {
    format!(
        "{}: lost={} detected={} missed={} fp={} ({}) delay={}",
        report.estimator,
        report.true_losses,
        report.detected_losses,
        report.missed_losses,
        report.false_positives,
        format_percent(report.false_positive_rate()),
        format_delay(report.mean_detection_delay())
    )
}
