//! Probability calibration ahead of sizing.
//!
//! The ensemble probability is passed through a Platt map
//! `σ(A·logit(p) + B)` and then temperature scaling `σ(logit(p) / T)`
//! before it reaches the Kelly formula. Acceptance still uses the raw
//! ensemble probability. The defaults (A = 1, B = 0, T = 1) are the identity.
//!
//! [`Calibrator::fit`] estimates the parameters from resolved forecasts by
//! stochastic gradient descent on log loss; the replay report carries a fit
//! so the `[calibration]` section can be tuned offline.

use serde::{Deserialize, Serialize};

use crate::types::ConfigError;

/// Probabilities are kept this far from 0 and 1 so `logit` stays finite.
const P_EPS: f64 = 1e-6;

const MIN_TEMPERATURE: f64 = 0.1;
const MAX_TEMPERATURE: f64 = 5.0;

const FIT_EPOCHS: usize = 200;
const FIT_LEARNING_RATE: f64 = 0.05;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Platt slope on the logit.
    pub a: f64,
    /// Platt intercept.
    pub b: f64,
    /// Temperature; above 1 pulls probabilities towards 0.5.
    pub temperature: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            temperature: 1.0,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.a > 0.0 && self.a.is_finite()) {
            return Err(ConfigError::NonPositive {
                name: "calibration.a".into(),
                value: self.a.to_string(),
            });
        }
        if !self.b.is_finite() {
            return Err(ConfigError::Other(format!(
                "calibration.b must be finite (got {})",
                self.b
            )));
        }
        if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&self.temperature) {
            return Err(ConfigError::Other(format!(
                "calibration.temperature must be within [{MIN_TEMPERATURE}, {MAX_TEMPERATURE}] (got {})",
                self.temperature
            )));
        }
        Ok(())
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }
}

// ---------------------------------------------------------------------------
// Calibrator
// ---------------------------------------------------------------------------

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn logit(p: f64) -> f64 {
    let p = p.clamp(P_EPS, 1.0 - P_EPS);
    (p / (1.0 - p)).ln()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Calibrator {
    config: CalibrationConfig,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Calibrated probability. The identity configuration returns `p` as is.
    pub fn apply(&self, p: f64) -> f64 {
        if self.config.is_identity() {
            return p;
        }
        let platt = self.config.a * logit(p) + self.config.b;
        sigmoid(platt / self.config.temperature).clamp(P_EPS, 1.0 - P_EPS)
    }

    /// Fit Platt parameters on `(probability, won)` samples, then a
    /// temperature on the Platt-mapped probabilities. No samples gives the
    /// identity.
    pub fn fit(samples: &[(f64, bool)]) -> CalibrationConfig {
        if samples.is_empty() {
            return CalibrationConfig::default();
        }

        let points: Vec<(f64, f64)> = samples
            .iter()
            .map(|&(p, won)| (logit(p), if won { 1.0 } else { 0.0 }))
            .collect();

        let (mut a, mut b) = (1.0_f64, 0.0_f64);
        for _ in 0..FIT_EPOCHS {
            for &(x, y) in &points {
                let g = sigmoid(a * x + b) - y;
                a -= FIT_LEARNING_RATE * g * x;
                b -= FIT_LEARNING_RATE * g;
            }
        }
        // A non-positive slope would reverse the ranking.
        let a = a.max(P_EPS);

        let mut t = 1.0_f64;
        for _ in 0..FIT_EPOCHS {
            for &(x, y) in &points {
                let z = a * x + b;
                let q = sigmoid(z / t);
                // d(log loss)/dT = (q − y)·(−z / T²)
                let g = (q - y) * (-z / (t * t));
                t = (t - FIT_LEARNING_RATE * g).clamp(MIN_TEMPERATURE, MAX_TEMPERATURE);
            }
        }

        CalibrationConfig {
            a,
            b,
            temperature: t,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
