//! Inter-arrival predictors
//!
//! A predictor learns a stream of inter-arrival intervals and forecasts the
//! next one. The forecast is biased by a safety margin derived from the
//! configured premature-timeout probability: the margin is the standard normal
//! quantile of `1 - p` scaled by the spread the predictor has observed, so a
//! lower tolerated probability of timing out too early gives a longer wait.
//!
//! Two variants exist:
//! - [`MovingAverage`]: mean of the last K samples, margin scaled by the sample
//!   standard deviation.
//! - [`Ar2`]: second-order autoregressive model around an exponentially
//!   weighted mean, coefficients adapted online by recursive least squares,
//!   margin scaled by the standard deviation of its own forecast errors.

use crate::session::ConfigError;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default moving-average history size
pub const DEFAULT_HISTORY_SIZE: usize = 25;

/// Default number of samples before a predictor reports ready
pub const DEFAULT_BIAS_SAMPLES: usize = 5;

/// Default tolerated probability of a premature timeout
pub const DEFAULT_PREMATURE_TIMEOUT_PROBABILITY: f64 = 0.05;

/// RLS forgetting factor for the AR2 coefficients
const AR2_FORGETTING: f64 = 0.98;

/// Initial diagonal of the AR2 covariance matrix
const AR2_INITIAL_COVARIANCE: f64 = 1_000.0;

/// Covariance trace beyond which the AR2 estimator restarts adaptation
const AR2_MAX_COVARIANCE_TRACE: f64 = 1.0e9;

/// Coefficients are kept within this bound to avoid explosive forecasts
const AR2_MAX_COEFFICIENT: f64 = 2.0;

/// Stateful predictor of the next inter-arrival interval
///
/// `last_prediction` is only meaningful once `is_ready` returns true; callers
/// gate on readiness and the predictor does not report misuse.
pub trait Predictor: fmt::Debug + Send {
    /// Feed one observed interval
    fn insert(&mut self, sample: Duration);

    /// Whether enough samples have been seen to trust the prediction
    fn is_ready(&self) -> bool;

    /// Biased forecast of the next interval
    fn last_prediction(&self) -> Duration;

    /// Mean of recent forecast errors (observed minus unbiased forecast), µs
    fn error_mean(&self) -> f64;

    /// Standard deviation of recent forecast errors, µs
    fn error_std_dev(&self) -> f64;

    /// Total samples inserted since creation or the last reset
    fn sample_count(&self) -> u64;

    /// Discard all history
    fn reset(&mut self);

    /// Short variant name for diagnostics
    fn name(&self) -> &'static str;
}

/// Predictor variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictorKind {
    /// Windowed moving average
    MovingAverage,
    /// Second-order autoregressive model
    Ar2,
}

impl PredictorKind {
    /// Canonical configuration name
    pub fn as_str(self) -> &'static str {
        match self {
            PredictorKind::MovingAverage => "ma",
            PredictorKind::Ar2 => "ar2",
        }
    }
}

impl fmt::Display for PredictorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ma" | "moving-average" | "moving_average" | "movingaverage" => {
                Ok(PredictorKind::MovingAverage)
            }
            "ar2" | "ar-2" | "autoregressive" => Ok(PredictorKind::Ar2),
            _ => Err(ConfigError::UnknownPredictor(s.to_string())),
        }
    }
}

/// Predictor configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictorConfig {
    /// Variant to build
    pub kind: PredictorKind,
    /// Samples (MA) or error samples (AR2) retained
    pub history_size: usize,
    /// Samples required before the predictor reports ready
    pub bias_samples: usize,
    /// Tolerated probability that the predicted wait expires before the packet
    pub premature_timeout_probability: f64,
}

impl PredictorConfig {
    /// Check the configuration without building a predictor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_size == 0 {
            return Err(ConfigError::InvalidHistorySize(self.history_size));
        }
        if self.bias_samples == 0 {
            return Err(ConfigError::InvalidBiasSamples(self.bias_samples));
        }
        let p = self.premature_timeout_probability;
        if !(p > 0.0 && p < 1.0) {
            return Err(ConfigError::InvalidProbability(p));
        }
        Ok(())
    }

    /// Build the configured predictor
    pub fn build(&self) -> Result<Box<dyn Predictor>, ConfigError> {
        self.validate()?;
        Ok(match self.kind {
            PredictorKind::MovingAverage => Box::new(MovingAverage::new(
                self.history_size,
                self.bias_samples,
                self.premature_timeout_probability,
            )?),
            PredictorKind::Ar2 => Box::new(Ar2::new(
                self.history_size,
                self.bias_samples,
                self.premature_timeout_probability,
            )?),
        })
    }
}

impl Default for PredictorConfig {
    fn default() -> Self {
        PredictorConfig {
            kind: PredictorKind::MovingAverage,
            history_size: DEFAULT_HISTORY_SIZE,
            bias_samples: DEFAULT_BIAS_SAMPLES,
            premature_timeout_probability: DEFAULT_PREMATURE_TIMEOUT_PROBABILITY,
        }
    }
}

/// Fixed-capacity window with mean and population standard deviation
#[derive(Debug, Clone)]
struct Window {
    values: VecDeque<f64>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Window {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    fn std_dev(&self) -> f64 {
        if self.values.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .values
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / self.values.len() as f64;
        variance.sqrt()
    }

    fn clear(&mut self) {
        self.values.clear();
    }
}

fn micros(sample: Duration) -> f64 {
    sample.as_secs_f64() * 1_000_000.0
}

fn to_duration(micros: f64) -> Duration {
    if micros.is_finite() && micros > 0.0 {
        Duration::from_micros(micros.round() as u64)
    } else {
        Duration::ZERO
    }
}

fn margin_factor(premature_timeout_probability: f64) -> Result<f64, ConfigError> {
    let p = premature_timeout_probability;
    if !(p > 0.0 && p < 1.0) {
        return Err(ConfigError::InvalidProbability(p));
    }
    Ok(normal_quantile(1.0 - p))
}

/// Moving-average predictor
#[derive(Debug, Clone)]
pub struct MovingAverage {
    samples: Window,
    errors: Window,
    bias_samples: usize,
    margin_factor: f64,
    /// Unbiased forecast made before the most recent sample
    forecast: Option<f64>,
    prediction: f64,
    count: u64,
}

impl MovingAverage {
    /// Create a moving average over `history_size` samples
    ///
    /// # Arguments
    /// * `history_size` - Number of samples averaged (K)
    /// * `bias_samples` - Samples required before the prediction is ready
    /// * `premature_timeout_probability` - Target probability of timing out early
    pub fn new(
        history_size: usize,
        bias_samples: usize,
        premature_timeout_probability: f64,
    ) -> Result<Self, ConfigError> {
        if history_size == 0 {
            return Err(ConfigError::InvalidHistorySize(history_size));
        }
        if bias_samples == 0 {
            return Err(ConfigError::InvalidBiasSamples(bias_samples));
        }
        Ok(MovingAverage {
            samples: Window::new(history_size),
            errors: Window::new(history_size),
            bias_samples,
            margin_factor: margin_factor(premature_timeout_probability)?,
            forecast: None,
            prediction: 0.0,
            count: 0,
        })
    }

    /// Unbiased mean of the retained samples, µs
    pub fn mean(&self) -> f64 {
        self.samples.mean()
    }
}

impl Predictor for MovingAverage {
    fn insert(&mut self, sample: Duration) {
        let x = micros(sample);
        if let Some(forecast) = self.forecast {
            self.errors.push(x - forecast);
        }
        self.samples.push(x);
        self.count += 1;

        let mean = self.samples.mean();
        self.forecast = Some(mean);
        self.prediction = mean + self.margin_factor * self.samples.std_dev();
    }

    fn is_ready(&self) -> bool {
        self.count >= self.bias_samples as u64
    }

    fn last_prediction(&self) -> Duration {
        to_duration(self.prediction)
    }

    fn error_mean(&self) -> f64 {
        self.errors.mean()
    }

    fn error_std_dev(&self) -> f64 {
        self.errors.std_dev()
    }

    fn sample_count(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.errors.clear();
        self.forecast = None;
        self.prediction = 0.0;
        self.count = 0;
    }

    fn name(&self) -> &'static str {
        "ma"
    }
}

/// Second-order autoregressive predictor
///
/// Models `x[t] - m = a1 (x[t-1] - m) + a2 (x[t-2] - m) + e[t]` where `m` is an
/// exponentially weighted mean with smoothing `2 / (K + 1)`. The coefficients
/// start at zero (the forecast is then the mean) and are adapted with
/// recursive least squares.
#[derive(Debug, Clone)]
pub struct Ar2 {
    alpha: f64,
    mean: Option<f64>,
    /// Most recent sample, then the one before it
    lags: [Option<f64>; 2],
    coefficients: [f64; 2],
    covariance: [[f64; 2]; 2],
    errors: Window,
    bias_samples: usize,
    margin_factor: f64,
    forecast: Option<f64>,
    prediction: f64,
    count: u64,
}

impl Ar2 {
    /// Create an AR2 predictor
    ///
    /// `history_size` sets both the mean smoothing and the error window.
    pub fn new(
        history_size: usize,
        bias_samples: usize,
        premature_timeout_probability: f64,
    ) -> Result<Self, ConfigError> {
        if history_size == 0 {
            return Err(ConfigError::InvalidHistorySize(history_size));
        }
        if bias_samples == 0 {
            return Err(ConfigError::InvalidBiasSamples(bias_samples));
        }
        Ok(Ar2 {
            alpha: 2.0 / (history_size as f64 + 1.0),
            mean: None,
            lags: [None, None],
            coefficients: [0.0, 0.0],
            covariance: Self::initial_covariance(),
            errors: Window::new(history_size),
            bias_samples,
            margin_factor: margin_factor(premature_timeout_probability)?,
            forecast: None,
            prediction: 0.0,
            count: 0,
        })
    }

    /// Current lag coefficients `[a1, a2]`
    pub fn coefficients(&self) -> [f64; 2] {
        self.coefficients
    }

    fn initial_covariance() -> [[f64; 2]; 2] {
        [
            [AR2_INITIAL_COVARIANCE, 0.0],
            [0.0, AR2_INITIAL_COVARIANCE],
        ]
    }

    /// One recursive-least-squares step for regressor `phi` and target `y`
    fn adapt(&mut self, phi: [f64; 2], y: f64) {
        let p = self.covariance;
        let p_phi = [
            p[0][0] * phi[0] + p[0][1] * phi[1],
            p[1][0] * phi[0] + p[1][1] * phi[1],
        ];
        let denom = AR2_FORGETTING + phi[0] * p_phi[0] + phi[1] * p_phi[1];
        if !denom.is_finite() || denom <= f64::EPSILON {
            return;
        }
        let gain = [p_phi[0] / denom, p_phi[1] / denom];
        let err = y - (self.coefficients[0] * phi[0] + self.coefficients[1] * phi[1]);

        for (c, g) in self.coefficients.iter_mut().zip(gain) {
            *c = (*c + g * err).clamp(-AR2_MAX_COEFFICIENT, AR2_MAX_COEFFICIENT);
        }

        // P = (P - g phi^T P) / lambda; phi^T P == p_phi^T since P is symmetric
        for i in 0..2 {
            for j in 0..2 {
                self.covariance[i][j] = (p[i][j] - gain[i] * p_phi[j]) / AR2_FORGETTING;
            }
        }

        let trace = self.covariance[0][0] + self.covariance[1][1];
        if !trace.is_finite() || trace > AR2_MAX_COVARIANCE_TRACE {
            self.covariance = Self::initial_covariance();
        }
    }

    fn forecast_from(&self, mean: f64) -> f64 {
        let lag = |v: Option<f64>| v.map(|x| x - mean).unwrap_or(0.0);
        mean + self.coefficients[0] * lag(self.lags[0]) + self.coefficients[1] * lag(self.lags[1])
    }
}

impl Predictor for Ar2 {
    fn insert(&mut self, sample: Duration) {
        let x = micros(sample);
        if let Some(forecast) = self.forecast {
            self.errors.push(x - forecast);
        }

        let mean = match self.mean {
            Some(m) => m + self.alpha * (x - m),
            None => x,
        };

        if let [Some(x1), Some(x2)] = self.lags {
            self.adapt([x1 - mean, x2 - mean], x - mean);
        }

        self.mean = Some(mean);
        self.lags = [Some(x), self.lags[0]];
        self.count += 1;

        let forecast = self.forecast_from(mean);
        self.forecast = Some(forecast);
        self.prediction = forecast + self.margin_factor * self.errors.std_dev();
    }

    fn is_ready(&self) -> bool {
        // Both lags are needed for a real AR2 forecast
        self.count >= (self.bias_samples as u64).max(3)
    }

    fn last_prediction(&self) -> Duration {
        to_duration(self.prediction)
    }

    fn error_mean(&self) -> f64 {
        self.errors.mean()
    }

    fn error_std_dev(&self) -> f64 {
        self.errors.std_dev()
    }

    fn sample_count(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.mean = None;
        self.lags = [None, None];
        self.coefficients = [0.0, 0.0];
        self.covariance = Self::initial_covariance();
        self.errors.clear();
        self.forecast = None;
        self.prediction = 0.0;
        self.count = 0;
    }

    fn name(&self) -> &'static str {
        "ar2"
    }
}

/// Inverse of the standard normal CDF
///
/// Acklam's rational approximation, relative error below 1.2e-9.
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}
