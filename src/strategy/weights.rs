//! Per-source voting weights and their online adaptation.
//!
//! After a round resolves, every source that contributed to a decision is
//! scored against the realized outcome and its weight is nudged by
//! `eta × reward`, clamped to `[floor, ceiling]`. Weights are never
//! renormalized; the voter normalizes at aggregation time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::types::ConfigError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which reward function scores a source against an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RewardKind {
    #[default]
    Brier,
    Directional,
}

impl RewardKind {
    pub fn policy(&self) -> Box<dyn RewardPolicy> {
        match self {
            RewardKind::Brier => Box::new(BrierReward),
            RewardKind::Directional => Box::new(DirectionalReward),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeightConfig {
    /// Starting weights; only used when no persisted state exists.
    pub initial: BTreeMap<String, f64>,
    /// Weight for a source seen for the first time.
    pub default_weight: f64,
    pub floor: f64,
    pub ceiling: f64,
    /// Learning rate for reward-driven updates.
    pub eta: f64,
    pub reward: RewardKind,
}

impl Default for WeightConfig {
    fn default() -> Self {
        let initial = [("cloud", 0.5), ("map", 0.3), ("size", 0.2)]
            .into_iter()
            .map(|(s, w)| (s.to_string(), w))
            .collect();
        Self {
            initial,
            default_weight: 0.3,
            floor: 0.10,
            ceiling: 0.70,
            eta: 0.02,
            reward: RewardKind::Brier,
        }
    }
}

impl WeightConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.floor.is_finite() || self.floor < 0.0 {
            return Err(ConfigError::Other(format!(
                "weights.floor must be a non-negative number (got {})",
                self.floor
            )));
        }
        if !self.ceiling.is_finite() || self.floor > self.ceiling {
            return Err(ConfigError::WeightBounds {
                floor: self.floor,
                ceiling: self.ceiling,
            });
        }
        if self.ceiling <= 0.0 {
            return Err(ConfigError::NonPositive {
                name: "weights.ceiling".into(),
                value: self.ceiling.to_string(),
            });
        }
        if !self.eta.is_finite() || self.eta < 0.0 {
            return Err(ConfigError::Other(format!(
                "weights.eta must be a non-negative number (got {})",
                self.eta
            )));
        }
        if !self.default_weight.is_finite() {
            return Err(ConfigError::Other("weights.default_weight is not finite".into()));
        }
        if let Some((source, w)) = self.initial.iter().find(|(_, w)| !w.is_finite()) {
            return Err(ConfigError::Other(format!(
                "weights.initial.{source} is not finite ({w})"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Weight state
// ---------------------------------------------------------------------------

/// Source → weight, always within `[floor, ceiling]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightState {
    weights: BTreeMap<String, f64>,
    floor: f64,
    ceiling: f64,
    default_weight: f64,
}

impl WeightState {
    /// Build from configuration, clamping the initial weights into bounds.
    pub fn from_config(config: &WeightConfig) -> Self {
        let mut state = Self {
            weights: BTreeMap::new(),
            floor: config.floor,
            ceiling: config.ceiling,
            default_weight: config.default_weight.clamp(config.floor, config.ceiling),
        };
        for (source, w) in &config.initial {
            state.set(source, *w);
        }
        state
    }

    /// Weight of a source; unknown sources get the default weight.
    pub fn weight_of(&self, source: &str) -> f64 {
        self.weights
            .get(source)
            .copied()
            .unwrap_or(self.default_weight)
    }

    /// Set a weight, clamped into bounds. Returns the stored value.
    pub fn set(&mut self, source: &str, weight: f64) -> f64 {
        let clamped = weight.clamp(self.floor, self.ceiling);
        self.weights.insert(source.to_string(), clamped);
        clamped
    }

    pub fn floor(&self) -> f64 {
        self.floor
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    pub fn default_weight(&self) -> f64 {
        self.default_weight
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Apply new bounds (hot reload) and re-clamp every stored weight.
    pub fn rebound(&mut self, config: &WeightConfig) {
        self.floor = config.floor;
        self.ceiling = config.ceiling;
        self.default_weight = config.default_weight.clamp(config.floor, config.ceiling);
        for w in self.weights.values_mut() {
            *w = w.clamp(config.floor, config.ceiling);
        }
    }
}

// ---------------------------------------------------------------------------
// Reward policies
// ---------------------------------------------------------------------------

/// Scores one source's probability against the realized outcome.
/// Positive rewards raise the source's weight, negative ones lower it.
pub trait RewardPolicy: Send + Sync {
    fn reward(&self, probability: f64, won: bool) -> f64;

    fn name(&self) -> &'static str;
}

/// `0.25 − (p − o)²`: positive when the source beat an uninformed 50/50
/// forecast on this outcome. Range [−0.75, 0.25].
pub struct BrierReward;

impl RewardPolicy for BrierReward {
    fn reward(&self, probability: f64, won: bool) -> f64 {
        let outcome = if won { 1.0 } else { 0.0 };
        0.25 - (probability - outcome).powi(2)
    }

    fn name(&self) -> &'static str {
        "brier"
    }
}

/// +1 when the source favored the realized side, −1 when it favored the
/// other side, 0 when it sat exactly on 0.5.
pub struct DirectionalReward;

impl RewardPolicy for DirectionalReward {
    fn reward(&self, probability: f64, won: bool) -> f64 {
        if probability == 0.5 {
            return 0.0;
        }
        if (probability > 0.5) == won {
            1.0
        } else {
            -1.0
        }
    }

    fn name(&self) -> &'static str {
        "directional"
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// A single weight change, for logging and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightUpdate {
    pub source: String,
    pub reward: f64,
    pub before: f64,
    pub after: f64,
}

pub struct WeightAdapter {
    eta: f64,
    policy: Box<dyn RewardPolicy>,
}

impl WeightAdapter {
    pub fn new(config: &WeightConfig) -> Self {
        Self {
            eta: config.eta,
            policy: config.reward.policy(),
        }
    }

    /// Use a custom reward policy.
    pub fn with_policy(eta: f64, policy: Box<dyn RewardPolicy>) -> Self {
        Self { eta, policy }
    }

    pub fn eta(&self) -> f64 {
        self.eta
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Update weights for every source that contributed to one resolved
    /// decision. `contributions` maps source → the probability it gave the
    /// pick; `won` is whether the pick won.
    pub fn apply(
        &self,
        state: &mut WeightState,
        contributions: &BTreeMap<String, f64>,
        won: bool,
    ) -> Vec<WeightUpdate> {
        let mut updates = Vec::with_capacity(contributions.len());

        for (source, &probability) in contributions {
            let reward = self.policy.reward(probability, won);
            let before = state.weight_of(source);
            let after = state.set(source, before + self.eta * reward);

            debug!(
                source = %source,
                probability,
                won,
                reward = format!("{reward:+.4}"),
                before = format!("{before:.4}"),
                after = format!("{after:.4}"),
                "Weight updated"
            );

            updates.push(WeightUpdate {
                source: source.clone(),
                reward,
                before,
                after,
            });
        }

        if !updates.is_empty() {
            info!(
                sources = updates.len(),
                won,
                policy = self.policy.name(),
                "Weights adapted from resolved decision"
            );
        }

        updates
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
