//! Configuration file support for the MPRTP tools

use mprtp::FeedbackError;
use mprtp_protocol::{EstimatorKind, PredictorConfig, PredictorKind, SessionCapabilities};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Largest trace the simulator accepts
///
/// Keeps every global sequence number within half the sequence space so
/// reports can be matched back to packets unambiguously.
pub const MAX_SIM_PACKETS: usize = 30_000;

/// Feedback type offered by the simulated receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackSetting {
    /// Predictive loss detection with retransmission
    Nack,
    /// Positive acknowledgements only
    Ack,
    /// No feedback
    None,
}

/// Negotiated session facts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Feedback type
    #[serde(default = "default_feedback")]
    pub feedback: FeedbackSetting,
    /// Primary estimator (single-path, cross-path)
    #[serde(default = "default_estimator")]
    pub estimator: String,
    /// Estimator run alongside for comparison
    #[serde(default)]
    pub comparison: Option<String>,
    /// Retransmissions later than this after the request count as late
    #[serde(default = "default_rtx_late_ms")]
    pub rtx_late_ms: u64,
    /// Time from a NACK to the repaired packet arriving
    #[serde(default = "default_rtx_rtt_ms")]
    pub rtx_rtt_ms: u64,
}

fn default_feedback() -> FeedbackSetting {
    FeedbackSetting::Nack
}

fn default_estimator() -> String {
    EstimatorKind::CrossPath.as_str().to_string()
}

fn default_rtx_late_ms() -> u64 {
    500
}

fn default_rtx_rtt_ms() -> u64 {
    40
}

impl Default for SessionSection {
    fn default() -> Self {
        SessionSection {
            feedback: default_feedback(),
            estimator: default_estimator(),
            comparison: None,
            rtx_late_ms: default_rtx_late_ms(),
            rtx_rtt_ms: default_rtx_rtt_ms(),
        }
    }
}

/// Predictor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorSection {
    /// Variant (ma, ar2)
    #[serde(default = "default_predictor")]
    pub kind: String,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_bias_samples")]
    pub bias_samples: usize,
    #[serde(default = "default_probability")]
    pub premature_timeout_probability: f64,
}

fn default_predictor() -> String {
    PredictorKind::MovingAverage.as_str().to_string()
}

fn default_history_size() -> usize {
    25
}

fn default_bias_samples() -> usize {
    5
}

fn default_probability() -> f64 {
    0.05
}

impl Default for PredictorSection {
    fn default() -> Self {
        PredictorSection {
            kind: default_predictor(),
            history_size: default_history_size(),
            bias_samples: default_bias_samples(),
            premature_timeout_probability: default_probability(),
        }
    }
}

/// One simulated path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Flow identifier
    pub id: u16,
    /// Sending interval on this flow
    pub interval_ms: f64,
    /// Send time of the flow's first packet
    #[serde(default)]
    pub offset_ms: f64,
    /// One-way path delay
    #[serde(default)]
    pub extra_delay_ms: f64,
    /// Uniform jitter added on top of the path delay
    #[serde(default)]
    pub jitter_ms: f64,
    /// Independent loss probability (0.0 to 1.0)
    #[serde(default)]
    pub loss: f64,
}

/// Trace settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Packets sent across all flows
    #[serde(default = "default_packets")]
    pub packets: usize,
    /// Feedback reporting interval
    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,
    /// RNG seed; random when absent
    #[serde(default)]
    pub seed: Option<u64>,
    /// Global sequence number of the first packet
    #[serde(default)]
    pub start_seq: u16,
}

fn default_packets() -> usize {
    2000
}

fn default_report_interval() -> u64 {
    100
}

impl Default for SimulationSection {
    fn default() -> Self {
        SimulationSection {
            packets: default_packets(),
            report_interval_ms: default_report_interval(),
            seed: None,
            start_seq: 0,
        }
    }
}

/// Simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub predictor: PredictorSection,
    pub flows: Vec<FlowConfig>,
    #[serde(default)]
    pub simulation: SimulationSection,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Two paths, the second slower and lossy
    pub fn example() -> Self {
        Config {
            session: SessionSection::default(),
            predictor: PredictorSection::default(),
            flows: vec![
                FlowConfig {
                    id: 0,
                    interval_ms: 20.0,
                    offset_ms: 0.0,
                    extra_delay_ms: 20.0,
                    jitter_ms: 2.0,
                    loss: 0.01,
                },
                FlowConfig {
                    id: 1,
                    interval_ms: 20.0,
                    offset_ms: 10.0,
                    extra_delay_ms: 45.0,
                    jitter_ms: 5.0,
                    loss: 0.03,
                },
            ],
            simulation: SimulationSection {
                seed: Some(7),
                ..SimulationSection::default()
            },
        }
    }

    /// Check the configuration for values the simulator cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flows.is_empty() {
            return Err(ConfigError::Invalid("at least one flow is required".into()));
        }
        for flow in &self.flows {
            if !(flow.interval_ms > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "flow {}: interval_ms must be positive",
                    flow.id
                )));
            }
            if flow.offset_ms < 0.0 || flow.extra_delay_ms < 0.0 || flow.jitter_ms < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "flow {}: offsets and delays must not be negative",
                    flow.id
                )));
            }
            if !(0.0..=1.0).contains(&flow.loss) {
                return Err(ConfigError::Invalid(format!(
                    "flow {}: loss must lie in [0, 1]",
                    flow.id
                )));
            }
        }
        let mut ids: Vec<u16> = self.flows.iter().map(|f| f.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.flows.len() {
            return Err(ConfigError::Invalid("flow ids must be unique".into()));
        }
        if self.simulation.packets == 0 || self.simulation.packets > MAX_SIM_PACKETS {
            return Err(ConfigError::Invalid(format!(
                "packets must lie in 1..={}",
                MAX_SIM_PACKETS
            )));
        }
        if self.simulation.report_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "report_interval_ms must be positive".into(),
            ));
        }
        self.capabilities()?.validate()?;
        Ok(())
    }

    /// Predictor configuration
    pub fn predictor_config(&self) -> Result<PredictorConfig, ConfigError> {
        Ok(PredictorConfig {
            kind: self.predictor.kind.parse::<PredictorKind>()?,
            history_size: self.predictor.history_size,
            bias_samples: self.predictor.bias_samples,
            premature_timeout_probability: self.predictor.premature_timeout_probability,
        })
    }

    /// Session capabilities the simulated receiver negotiated
    pub fn capabilities(&self) -> Result<SessionCapabilities, ConfigError> {
        let (nack, ack, rtx) = match self.session.feedback {
            FeedbackSetting::Nack => (true, false, true),
            FeedbackSetting::Ack => (false, true, false),
            FeedbackSetting::None => (false, false, false),
        };
        Ok(SessionCapabilities {
            nack,
            ack,
            rtx,
            primary: self.session.estimator.parse::<EstimatorKind>()?,
            comparison: self
                .session
                .comparison
                .as_deref()
                .map(str::parse::<EstimatorKind>)
                .transpose()?,
            predictor: self.predictor_config()?,
            rtx_late_after: self.rtx_late_after(),
        })
    }

    pub fn rtx_late_after(&self) -> Duration {
        Duration::from_millis(self.session.rtx_late_ms)
    }

    pub fn rtx_rtt(&self) -> Duration {
        Duration::from_millis(self.session.rtx_rtt_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.simulation.report_interval_ms)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Session error: {0}")]
    Session(#[from] mprtp_protocol::ConfigError),

    #[error("Feedback error: {0}")]
    Feedback(#[from] FeedbackError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use mprtp_protocol::FeedbackMode;

    #[test]
    fn test_example_config() {
        let config = Config::example();
        assert_eq!(config.flows.len(), 2);
        assert!(config.validate().is_ok());

        let caps = config.capabilities().unwrap();
        assert_eq!(caps.feedback_mode(), FeedbackMode::Nack);
        assert_eq!(caps.primary, EstimatorKind::CrossPath);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = Config::example();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();

        assert_eq!(parsed.flows.len(), 2);
        assert_eq!(parsed.simulation.seed, Some(7));
    }

    #[test]
    fn test_sections_default() {
        let parsed: Config = toml::from_str(
            r#"
            [[flows]]
            id = 3
            interval_ms = 10.0
            "#,
        )
        .unwrap();
        assert_eq!(parsed.session.feedback, FeedbackSetting::Nack);
        assert_eq!(parsed.predictor.history_size, 25);
        assert_eq!(parsed.simulation.packets, 2000);
        assert_eq!(parsed.flows[0].loss, 0.0);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        let mut config = Config::example();
        config.flows[1].id = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::example();
        config.predictor.kind = "kalman".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Session(mprtp_protocol::ConfigError::UnknownPredictor(_)))
        ));

        let mut config = Config::example();
        config.session.feedback = FeedbackSetting::Ack;
        config.session.comparison = Some("single-path".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Session(mprtp_protocol::ConfigError::ComparisonWithoutNack))
        ));
    }
}
