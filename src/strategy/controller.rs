//! Adaptive acceptance threshold.
//!
//! A proportional controller tracking two rolling rates:
//! coverage (share of evaluated decisions accepted) and accuracy (share of
//! accepted decisions that won). Once per cycle the threshold moves by
//!
//! ```text
//! delta = k_cov·err_cov + (k_acc_up·err_acc  if err_acc > 0
//!                          k_acc_dn·err_acc  otherwise)
//! threshold = clamp(threshold − delta, min, max)
//! ```
//!
//! with `err = target − realized`. Gains come from the active regime.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::types::{ConfigError, Regime};

/// Minimum threshold movement reported as a change.
const CHANGE_EPSILON: f64 = 1e-3;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Gain tuple for one regime.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Gains {
    pub k_cov: f64,
    pub k_acc_up: f64,
    pub k_acc_dn: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegimeGains {
    pub conservative: Gains,
    pub balanced: Gains,
    pub aggressive: Gains,
}

impl Default for RegimeGains {
    fn default() -> Self {
        Self {
            conservative: Gains { k_cov: 0.02, k_acc_up: 0.06, k_acc_dn: 0.02 },
            balanced: Gains { k_cov: 0.05, k_acc_up: 0.10, k_acc_dn: 0.04 },
            aggressive: Gains { k_cov: 0.10, k_acc_up: 0.20, k_acc_dn: 0.08 },
        }
    }
}

impl RegimeGains {
    pub fn gains_for(&self, regime: Regime) -> Gains {
        match regime {
            Regime::Conservative => self.conservative,
            Regime::Balanced => self.balanced,
            Regime::Aggressive => self.aggressive,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ControllerTargets {
    pub coverage: f64,
    pub accuracy: f64,
}

impl Default for ControllerTargets {
    fn default() -> Self {
        Self { coverage: 0.5, accuracy: 0.8 }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ThresholdBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for ThresholdBounds {
    fn default() -> Self {
        Self { min: 0.50, max: 0.80 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub regime: Regime,
    pub targets: ControllerTargets,
    pub bounds: ThresholdBounds,
    /// Samples kept in each rolling window.
    pub window: usize,
    /// Evaluated decisions needed before the controller acts.
    pub min_samples: usize,
    pub gains: RegimeGains,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            regime: Regime::Balanced,
            targets: ControllerTargets::default(),
            bounds: ThresholdBounds::default(),
            window: 200,
            min_samples: 30,
            gains: RegimeGains::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = self.bounds;
        if !(b.min > 0.0 && b.min <= b.max && b.max < 1.0) {
            return Err(ConfigError::ThresholdBounds { min: b.min, max: b.max });
        }
        for (name, value) in [
            ("controller.targets.coverage", self.targets.coverage),
            ("controller.targets.accuracy", self.targets.accuracy),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::NotAProbability { name: name.into(), value });
            }
        }
        if self.window == 0 {
            return Err(ConfigError::NonPositive {
                name: "controller.window".into(),
                value: "0".into(),
            });
        }
        if self.min_samples == 0 || self.min_samples > self.window {
            return Err(ConfigError::Other(format!(
                "controller.min_samples must lie in 1..={} (got {})",
                self.window, self.min_samples
            )));
        }
        for regime in [Regime::Conservative, Regime::Balanced, Regime::Aggressive] {
            let g = self.gains.gains_for(regime);
            if [g.k_cov, g.k_acc_up, g.k_acc_dn].iter().any(|k| !k.is_finite() || *k < 0.0) {
                return Err(ConfigError::Other(format!(
                    "controller.gains.{regime} must be non-negative numbers"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub current_threshold: f64,
    pub realized_coverage: Option<f64>,
    pub realized_accuracy: Option<f64>,
    pub regime: Regime,
    pub cycles: u64,
    /// Accepted flag of each recently evaluated decision.
    coverage_window: VecDeque<bool>,
    /// Won flag of each recently resolved accepted decision.
    accuracy_window: VecDeque<bool>,
}

impl ControllerState {
    pub fn evaluated_samples(&self) -> usize {
        self.coverage_window.len()
    }

    pub fn resolved_samples(&self) -> usize {
        self.accuracy_window.len()
    }
}

fn rate(window: &VecDeque<bool>) -> Option<f64> {
    if window.is_empty() {
        None
    } else {
        Some(window.iter().filter(|&&b| b).count() as f64 / window.len() as f64)
    }
}

fn push_bounded(window: &mut VecDeque<bool>, value: bool, cap: usize) {
    window.push_back(value);
    while window.len() > cap {
        window.pop_front();
    }
}

// ---------------------------------------------------------------------------
// Step report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepStatus {
    /// Threshold moved.
    Adjusted,
    /// Errors were zero or the threshold is pinned at a bound.
    Held,
    /// Not enough evaluated decisions yet; threshold unchanged.
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub status: StepStatus,
    pub previous: f64,
    pub threshold: f64,
    pub err_cov: f64,
    pub err_acc: f64,
    pub regime: Regime,
    pub changed: bool,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct AcceptanceController {
    config: ControllerConfig,
    state: ControllerState,
}

impl AcceptanceController {
    /// Fresh controller starting at `accept_floor` (clamped into bounds).
    pub fn new(config: ControllerConfig, accept_floor: f64) -> Self {
        let state = ControllerState {
            current_threshold: accept_floor.clamp(config.bounds.min, config.bounds.max),
            realized_coverage: None,
            realized_accuracy: None,
            regime: config.regime,
            cycles: 0,
            coverage_window: VecDeque::with_capacity(config.window),
            accuracy_window: VecDeque::with_capacity(config.window),
        };
        Self { config, state }
    }

    /// Resume from persisted state under (possibly new) configuration.
    pub fn restore(config: ControllerConfig, state: ControllerState) -> Self {
        let mut controller = Self { config: config.clone(), state };
        controller.reconfigure(config);
        controller
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn threshold(&self) -> f64 {
        self.state.current_threshold
    }

    /// Record one evaluated decision.
    pub fn record_evaluation(&mut self, accepted: bool) {
        push_bounded(&mut self.state.coverage_window, accepted, self.config.window);
        self.state.realized_coverage = rate(&self.state.coverage_window);
    }

    /// Record the resolution of one accepted decision.
    pub fn record_resolution(&mut self, won: bool) {
        push_bounded(&mut self.state.accuracy_window, won, self.config.window);
        self.state.realized_accuracy = rate(&self.state.accuracy_window);
    }

    /// Switch gain regime. Threshold and windows are kept.
    pub fn set_regime(&mut self, regime: Regime) {
        if regime != self.state.regime {
            info!(from = %self.state.regime, to = %regime, "Controller regime switched");
            self.state.regime = regime;
        }
    }

    /// Apply new targets, gains, bounds or window size. The current threshold
    /// is kept (clamped into the new bounds) and windows are trimmed.
    pub fn reconfigure(&mut self, config: ControllerConfig) {
        self.state.current_threshold = self
            .state
            .current_threshold
            .clamp(config.bounds.min, config.bounds.max);
        self.state.regime = config.regime;
        while self.state.coverage_window.len() > config.window {
            self.state.coverage_window.pop_front();
        }
        while self.state.accuracy_window.len() > config.window {
            self.state.accuracy_window.pop_front();
        }
        self.state.realized_coverage = rate(&self.state.coverage_window);
        self.state.realized_accuracy = rate(&self.state.accuracy_window);
        self.config = config;
    }

    /// Run one control cycle.
    pub fn step(&mut self) -> StepReport {
        let previous = self.state.current_threshold;
        let regime = self.state.regime;
        self.state.cycles += 1;

        let coverage = match self.state.realized_coverage {
            Some(c) if self.state.coverage_window.len() >= self.config.min_samples => c,
            _ => {
                debug!(
                    samples = self.state.coverage_window.len(),
                    needed = self.config.min_samples,
                    "Controller cold start, holding threshold"
                );
                return StepReport {
                    status: StepStatus::InsufficientData,
                    previous,
                    threshold: previous,
                    err_cov: 0.0,
                    err_acc: 0.0,
                    regime,
                    changed: false,
                };
            }
        };

        let err_cov = self.config.targets.coverage - coverage;
        let err_acc = self
            .state
            .realized_accuracy
            .map(|a| self.config.targets.accuracy - a)
            .unwrap_or(0.0);

        let g = self.config.gains.gains_for(regime);
        let acc_term = if err_acc > 0.0 {
            g.k_acc_up * err_acc
        } else {
            g.k_acc_dn * err_acc
        };
        let delta = g.k_cov * err_cov + acc_term;

        let bounds = self.config.bounds;
        let threshold = (previous - delta).clamp(bounds.min, bounds.max);
        self.state.current_threshold = threshold;

        let changed = (threshold - previous).abs() >= CHANGE_EPSILON;
        let status = if threshold != previous {
            StepStatus::Adjusted
        } else {
            StepStatus::Held
        };

        info!(
            cycle = self.state.cycles,
            regime = %regime,
            coverage = format!("{coverage:.3}"),
            accuracy = ?self.state.realized_accuracy.map(|a| format!("{a:.3}")),
            err_cov = format!("{err_cov:+.4}"),
            err_acc = format!("{err_acc:+.4}"),
            previous = format!("{previous:.4}"),
            threshold = format!("{threshold:.4}"),
            changed,
            "Controller step"
        );

        StepReport {
            status,
            previous,
            threshold,
            err_cov,
            err_acc,
            regime,
            changed,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
