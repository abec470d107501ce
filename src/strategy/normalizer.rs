//! Signal validation and grouping.
//!
//! Drops malformed, stale or mis-routed signals one by one and groups the
//! survivors by (round, market, pick) for the voter.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::types::{ConfigError, DecisionKey, Market, SignalRecord, ValidationError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Signals older than this (relative to evaluation time) are dropped.
    pub max_signal_age_secs: i64,
    /// Tolerated clock skew for signals stamped slightly in the future.
    pub max_clock_skew_secs: i64,
    /// Markets the engine trades. Signals for other markets are dropped.
    pub enabled_markets: Vec<Market>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_signal_age_secs: 300,
            max_clock_skew_secs: 5,
            enabled_markets: Market::ALL.to_vec(),
        }
    }
}

impl NormalizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_signal_age_secs <= 0 {
            return Err(ConfigError::NonPositive {
                name: "signals.max_signal_age_secs".into(),
                value: self.max_signal_age_secs.to_string(),
            });
        }
        if self.max_clock_skew_secs < 0 {
            return Err(ConfigError::Other(
                "signals.max_clock_skew_secs must not be negative".into(),
            ));
        }
        if self.enabled_markets.is_empty() {
            return Err(ConfigError::Other("signals.enabled_markets is empty".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// A signal that failed validation, kept for the audit trail.
#[derive(Debug, Clone)]
pub struct DroppedSignal {
    pub signal: SignalRecord,
    pub reason: ValidationError,
}

/// Validated signals for one decision, source → probability.
#[derive(Debug, Clone)]
pub struct SignalGroup {
    pub key: DecisionKey,
    pub probabilities: BTreeMap<String, f64>,
}

/// Result of normalizing one batch.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub groups: Vec<SignalGroup>,
    pub dropped: Vec<DroppedSignal>,
}

impl NormalizedBatch {
    /// Dropped signals that would have fed the given decision.
    pub fn dropped_for(&self, key: &DecisionKey) -> Vec<&DroppedSignal> {
        self.dropped
            .iter()
            .filter(|d| {
                d.signal.round_id == key.round_id
                    && d.signal.market == key.market
                    && d.signal.pick == key.pick
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

pub struct SignalNormalizer {
    config: NormalizerConfig,
}

impl SignalNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Check a single signal against every rule, returning the cleaned
    /// (trimmed) record.
    pub fn validate(
        &self,
        signal: &SignalRecord,
        now: DateTime<Utc>,
    ) -> Result<SignalRecord, ValidationError> {
        let source = signal.source.trim();
        if source.is_empty() {
            return Err(ValidationError::EmptySource);
        }

        if !signal.probability.is_finite() {
            return Err(ValidationError::NotFinite {
                source_id: source.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&signal.probability) {
            return Err(ValidationError::OutOfRange {
                source_id: source.to_string(),
                probability: signal.probability,
            });
        }

        if signal.pick.market() != signal.market {
            return Err(ValidationError::MarketPickMismatch {
                market: signal.market,
                pick: signal.pick,
            });
        }
        if !self.config.enabled_markets.contains(&signal.market) {
            return Err(ValidationError::MarketDisabled(signal.market));
        }

        let age_secs = (now - signal.timestamp).num_seconds();
        if age_secs > self.config.max_signal_age_secs {
            return Err(ValidationError::Stale {
                source_id: source.to_string(),
                age_secs,
            });
        }
        if -age_secs > self.config.max_clock_skew_secs {
            return Err(ValidationError::FromFuture {
                source_id: source.to_string(),
                ahead_secs: -age_secs,
            });
        }

        let mut clean = signal.clone();
        clean.source = source.to_string();
        Ok(clean)
    }

    /// Validate a batch and group survivors by decision key.
    ///
    /// A source reporting the same decision twice keeps its latest signal.
    /// Groups come back sorted by key.
    pub fn normalize(&self, signals: &[SignalRecord], now: DateTime<Utc>) -> NormalizedBatch {
        let mut dropped = Vec::new();
        let mut latest: HashMap<(DecisionKey, String), SignalRecord> = HashMap::new();

        for signal in signals {
            match self.validate(signal, now) {
                Ok(clean) => {
                    let key = DecisionKey {
                        round_id: clean.round_id.clone(),
                        market: clean.market,
                        pick: clean.pick,
                    };
                    let slot = (key, clean.source.clone());
                    match latest.get(&slot) {
                        Some(existing) if existing.timestamp >= clean.timestamp => {
                            debug!(signal = %clean, "Superseded duplicate signal ignored");
                        }
                        _ => {
                            latest.insert(slot, clean);
                        }
                    }
                }
                Err(reason) => {
                    match reason {
                        ValidationError::Stale { .. } | ValidationError::MarketDisabled(_) => {
                            debug!(signal = %signal, reason = %reason, "Signal dropped")
                        }
                        _ => warn!(signal = %signal, reason = %reason, "Signal dropped"),
                    }
                    dropped.push(DroppedSignal {
                        signal: signal.clone(),
                        reason,
                    });
                }
            }
        }

        let mut grouped: BTreeMap<DecisionKey, BTreeMap<String, f64>> = BTreeMap::new();
        for ((key, source), signal) in latest {
            grouped.entry(key).or_default().insert(source, signal.probability);
        }

        let groups = grouped
            .into_iter()
            .map(|(key, probabilities)| SignalGroup { key, probabilities })
            .collect();

        NormalizedBatch { groups, dropped }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pick;
    use chrono::Duration;

    fn make_signal(source: &str, round: &str, pick: Pick, p: f64, age_secs: i64) -> SignalRecord {
        SignalRecord {
            source: source.to_string(),
            round_id: round.to_string(),
            market: pick.market(),
            pick,
            probability: p,
            timestamp: Utc::now() - Duration::seconds(age_secs),
        }
    }

    fn normalizer() -> SignalNormalizer {
        SignalNormalizer::new(NormalizerConfig::default())
    }

    #[test]
    fn test_valid_signal_passes() {
        let s = make_signal(" cloud ", "r1", Pick::Odd, 0.6, 10);
        let clean = normalizer().validate(&s, Utc::now()).unwrap();
        assert_eq!(clean.source, "cloud");
    }

    #[test]
    fn test_out_of_range_rejected() {
        let s = make_signal("cloud", "r1", Pick::Odd, 1.2, 10);
        assert!(matches!(
            normalizer().validate(&s, Utc::now()),
            Err(ValidationError::OutOfRange { .. })
        ));
        let s = make_signal("cloud", "r1", Pick::Odd, -0.01, 10);
        assert!(normalizer().validate(&s, Utc::now()).is_err());
    }

    #[test]
    fn test_nan_rejected() {
        let s = make_signal("cloud", "r1", Pick::Odd, f64::NAN, 10);
        assert!(matches!(
            normalizer().validate(&s, Utc::now()),
            Err(ValidationError::NotFinite { .. })
        ));
    }

    #[test]
    fn test_boundaries_accepted() {
        let n = normalizer();
        assert!(n.validate(&make_signal("a", "r1", Pick::Odd, 0.0, 1), Utc::now()).is_ok());
        assert!(n.validate(&make_signal("a", "r1", Pick::Odd, 1.0, 1), Utc::now()).is_ok());
    }

    #[test]
    fn test_stale_rejected() {
        let s = make_signal("cloud", "r1", Pick::Big, 0.6, 3600);
        assert!(matches!(
            normalizer().validate(&s, Utc::now()),
            Err(ValidationError::Stale { .. })
        ));
    }

    #[test]
    fn test_future_rejected() {
        let s = make_signal("cloud", "r1", Pick::Big, 0.6, -60);
        assert!(matches!(
            normalizer().validate(&s, Utc::now()),
            Err(ValidationError::FromFuture { .. })
        ));
    }

    #[test]
    fn test_market_pick_mismatch() {
        let mut s = make_signal("cloud", "r1", Pick::Big, 0.6, 1);
        s.market = Market::OddEven;
        assert!(matches!(
            normalizer().validate(&s, Utc::now()),
            Err(ValidationError::MarketPickMismatch { .. })
        ));
    }

    #[test]
    fn test_disabled_market() {
        let n = SignalNormalizer::new(NormalizerConfig {
            enabled_markets: vec![Market::OddEven],
            ..NormalizerConfig::default()
        });
        let s = make_signal("cloud", "r1", Pick::Big, 0.6, 1);
        assert_eq!(
            n.validate(&s, Utc::now()),
            Err(ValidationError::MarketDisabled(Market::Size))
        );
    }

    #[test]
    fn test_empty_source() {
        let s = make_signal("   ", "r1", Pick::Odd, 0.6, 1);
        assert_eq!(normalizer().validate(&s, Utc::now()), Err(ValidationError::EmptySource));
    }

    #[test]
    fn test_grouping_and_drops() {
        let signals = vec![
            make_signal("cloud", "r1", Pick::Odd, 0.62, 5),
            make_signal("map", "r1", Pick::Odd, 0.58, 5),
            make_signal("size", "r1", Pick::Odd, 1.5, 5),
            make_signal("cloud", "r1", Pick::Big, 0.55, 5),
            make_signal("cloud", "r2", Pick::Odd, 0.51, 5),
        ];
        let batch = normalizer().normalize(&signals, Utc::now());
        assert_eq!(batch.groups.len(), 3);
        assert_eq!(batch.dropped.len(), 1);

        let r1_odd = batch
            .groups
            .iter()
            .find(|g| g.key.round_id == "r1" && g.key.pick == Pick::Odd)
            .unwrap();
        assert_eq!(r1_odd.probabilities.len(), 2);
        assert_eq!(batch.dropped_for(&r1_odd.key).len(), 1);
    }

    #[test]
    fn test_latest_duplicate_wins() {
        let older = make_signal("cloud", "r1", Pick::Odd, 0.40, 60);
        let newer = make_signal("cloud", "r1", Pick::Odd, 0.70, 5);
        let batch = normalizer().normalize(&[newer, older], Utc::now());
        assert_eq!(batch.groups.len(), 1);
        assert_eq!(batch.groups[0].probabilities["cloud"], 0.70);
    }

    #[test]
    fn test_all_dropped_yields_no_group() {
        let signals = vec![make_signal("cloud", "r1", Pick::Odd, 2.0, 5)];
        let batch = normalizer().normalize(&signals, Utc::now());
        assert!(batch.groups.is_empty());
        assert_eq!(batch.dropped.len(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(NormalizerConfig::default().validate().is_ok());
        let bad = NormalizerConfig {
            max_signal_age_secs: 0,
            ..NormalizerConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
