//! Weighted multi-source voting.
//!
//! Aggregates per-source probabilities for one (round, market, pick) into a
//! single `p_star`, applies the extreme-value gate, compares against the
//! controller's threshold and assigns a confidence bucket.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::normalizer::SignalGroup;
use super::weights::WeightState;
use crate::types::{BucketTier, ConfigError, EnsembleDecision, ValidationError};

/// Probabilities are clipped to this distance from 0 and 1 before taking logits.
const LOGIT_EPS: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How per-source probabilities are pooled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CombineMethod {
    /// `Σ(w·p) / Σw`
    #[default]
    Linear,
    /// `σ(Σ(w·logit p) / Σw)`
    Logit,
}

/// What the extreme gate does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    /// Any single extreme source forces acceptance at its own probability.
    #[default]
    Bypass,
    /// An extreme aggregate is pushed further out by `nudge`; the threshold
    /// still decides.
    Nudge,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtremeGateConfig {
    pub enable: bool,
    pub hi: f64,
    pub lo: f64,
    pub mode: GateMode,
    pub nudge: f64,
}

impl Default for ExtremeGateConfig {
    fn default() -> Self {
        Self {
            enable: true,
            hi: 0.75,
            lo: 0.25,
            mode: GateMode::Bypass,
            nudge: 0.02,
        }
    }
}

/// Two breakpoints splitting [0, 1] into three tiers.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BucketBreakpoints {
    pub mid: f64,
    pub high: f64,
}

impl Default for BucketBreakpoints {
    fn default() -> Self {
        Self { mid: 0.60, high: 0.67 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    /// Starting acceptance threshold for the controller.
    pub accept_floor: f64,
    pub method: CombineMethod,
    pub extreme_gate: ExtremeGateConfig,
    pub buckets: BucketBreakpoints,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            accept_floor: 0.55,
            method: CombineMethod::Linear,
            extreme_gate: ExtremeGateConfig::default(),
            buckets: BucketBreakpoints::default(),
        }
    }
}

impl VotingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.accept_floor > 0.0 && self.accept_floor < 1.0) {
            return Err(ConfigError::NotAProbability {
                name: "voting.accept_floor".into(),
                value: self.accept_floor,
            });
        }
        let gate = &self.extreme_gate;
        if gate.enable {
            if !(0.0..=1.0).contains(&gate.hi) || !(0.0..=1.0).contains(&gate.lo) || gate.lo >= gate.hi {
                return Err(ConfigError::GateBounds { lo: gate.lo, hi: gate.hi });
            }
            if !(0.0..=0.5).contains(&gate.nudge) {
                return Err(ConfigError::Other(format!(
                    "voting.extreme_gate.nudge must lie in [0, 0.5] (got {})",
                    gate.nudge
                )));
            }
        }
        let b = &self.buckets;
        if !(0.0 <= b.mid && b.mid <= b.high && b.high <= 1.0) {
            return Err(ConfigError::BucketBreakpoints { mid: b.mid, high: b.high });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Extreme gate policies
// ---------------------------------------------------------------------------

/// What the gate decided for one vote.
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    /// Nothing extreme; the threshold decides.
    Pass,
    /// Accept without consulting the threshold.
    ForceAccept { p_star: f64, source: String },
    /// Replace the aggregate; the threshold still decides.
    Adjust { p_star: f64 },
}

pub trait GatePolicy: Send + Sync {
    fn evaluate(&self, probabilities: &BTreeMap<String, f64>, aggregated: f64) -> GateVerdict;

    fn name(&self) -> &'static str;
}

/// A single very confident source overrides the blend.
///
/// This includes the low side: a source at or below `lo` forces acceptance
/// at that low probability. Kelly sizes such a pick to zero, so it ends as a
/// `positive_stake` rejection, yet it still counts as accepted towards
/// coverage and accuracy.
pub struct FullBypass {
    pub hi: f64,
    pub lo: f64,
}

impl GatePolicy for FullBypass {
    fn evaluate(&self, probabilities: &BTreeMap<String, f64>, _aggregated: f64) -> GateVerdict {
        // BTreeMap order makes ties resolve to the lexically first source.
        let mut chosen: Option<(&String, f64)> = None;
        for (source, &p) in probabilities {
            if p < self.hi && p > self.lo {
                continue;
            }
            let further = match chosen {
                Some((_, best)) => (p - 0.5).abs() > (best - 0.5).abs(),
                None => true,
            };
            if further {
                chosen = Some((source, p));
            }
        }

        match chosen {
            Some((source, p)) => GateVerdict::ForceAccept {
                p_star: p,
                source: source.clone(),
            },
            None => GateVerdict::Pass,
        }
    }

    fn name(&self) -> &'static str {
        "bypass"
    }
}

/// An already extreme aggregate is pushed a little further out.
pub struct BiasedBlend {
    pub hi: f64,
    pub lo: f64,
    pub nudge: f64,
}

impl GatePolicy for BiasedBlend {
    fn evaluate(&self, _probabilities: &BTreeMap<String, f64>, aggregated: f64) -> GateVerdict {
        if aggregated >= self.hi {
            GateVerdict::Adjust {
                p_star: (aggregated + self.nudge).min(0.999),
            }
        } else if aggregated <= self.lo {
            GateVerdict::Adjust {
                p_star: (aggregated - self.nudge).max(0.001),
            }
        } else {
            GateVerdict::Pass
        }
    }

    fn name(&self) -> &'static str {
        "nudge"
    }
}

impl ExtremeGateConfig {
    /// Build the configured gate, or `None` when disabled.
    pub fn policy(&self) -> Option<Box<dyn GatePolicy>> {
        if !self.enable {
            return None;
        }
        let policy: Box<dyn GatePolicy> = match self.mode {
            GateMode::Bypass => Box::new(FullBypass { hi: self.hi, lo: self.lo }),
            GateMode::Nudge => Box::new(BiasedBlend {
                hi: self.hi,
                lo: self.lo,
                nudge: self.nudge,
            }),
        };
        Some(policy)
    }
}

// ---------------------------------------------------------------------------
// Voter
// ---------------------------------------------------------------------------

pub struct EnsembleVoter {
    method: CombineMethod,
    gate: Option<Box<dyn GatePolicy>>,
    buckets: BucketBreakpoints,
}

impl EnsembleVoter {
    pub fn new(config: &VotingConfig) -> Self {
        Self {
            method: config.method,
            gate: config.extreme_gate.policy(),
            buckets: config.buckets,
        }
    }

    /// Replace the extreme-gate policy (`None` disables the gate).
    pub fn with_gate(mut self, gate: Option<Box<dyn GatePolicy>>) -> Self {
        self.gate = gate;
        self
    }

    /// Pool the probabilities with the current weights. Returns the
    /// aggregate and the weights used.
    pub fn aggregate(
        &self,
        probabilities: &BTreeMap<String, f64>,
        weights: &WeightState,
    ) -> (f64, BTreeMap<String, f64>) {
        let used: BTreeMap<String, f64> = probabilities
            .keys()
            .map(|s| (s.clone(), weights.weight_of(s)))
            .collect();
        let total_weight: f64 = used.values().sum();

        let pooled = |f: &dyn Fn(f64) -> f64| -> f64 {
            if total_weight > 0.0 {
                probabilities
                    .iter()
                    .map(|(s, &p)| used[s] * f(p))
                    .sum::<f64>()
                    / total_weight
            } else {
                probabilities.values().map(|&p| f(p)).sum::<f64>() / probabilities.len() as f64
            }
        };

        let p = match self.method {
            CombineMethod::Linear => pooled(&|p: f64| p),
            CombineMethod::Logit => {
                let z = pooled(&|p: f64| {
                    let p = p.clamp(LOGIT_EPS, 1.0 - LOGIT_EPS);
                    (p / (1.0 - p)).ln()
                });
                1.0 / (1.0 + (-z).exp())
            }
        };

        (p.clamp(0.0, 1.0), used)
    }

    /// Map a probability to its confidence tier.
    pub fn bucket_for(&self, p: f64) -> BucketTier {
        if p >= self.buckets.high {
            BucketTier::High
        } else if p >= self.buckets.mid {
            BucketTier::Mid
        } else {
            BucketTier::Low
        }
    }

    /// Vote on one group against the given threshold.
    pub fn vote(
        &self,
        group: &SignalGroup,
        weights: &WeightState,
        threshold: f64,
    ) -> Result<EnsembleDecision, ValidationError> {
        if group.probabilities.is_empty() {
            return Err(ValidationError::NoValidSources(group.key.clone()));
        }

        let (aggregated, weight_snapshot) = self.aggregate(&group.probabilities, weights);

        let verdict = match &self.gate {
            Some(gate) => gate.evaluate(&group.probabilities, aggregated),
            None => GateVerdict::Pass,
        };

        let (p_star, accept, extreme_gate_triggered) = match verdict {
            GateVerdict::Pass => (aggregated, aggregated >= threshold, false),
            GateVerdict::ForceAccept { p_star, source } => {
                debug!(
                    decision = %group.key,
                    source = %source,
                    p_star,
                    aggregated,
                    "Extreme gate forced acceptance"
                );
                (p_star, true, true)
            }
            GateVerdict::Adjust { p_star } => {
                debug!(decision = %group.key, aggregated, p_star, "Extreme gate nudged aggregate");
                (p_star, p_star >= threshold, true)
            }
        };

        let decision = EnsembleDecision {
            round_id: group.key.round_id.clone(),
            market: group.key.market,
            pick: group.key.pick,
            p_star,
            bucket_tier: self.bucket_for(p_star),
            accept,
            extreme_gate_triggered,
            weight_snapshot,
        };

        debug!(
            decision = %group.key,
            sources = group.probabilities.len(),
            p_star = format!("{p_star:.4}"),
            threshold = format!("{threshold:.4}"),
            accept,
            "Vote complete"
        );

        Ok(decision)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
