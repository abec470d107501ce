//! Kelly criterion stake sizing.
//!
//! Converts an accepted decision into a capped Kelly stake, then runs the
//! ordered pre-trade risk checks against open exposure. The first violated
//! check turns the stake into a [`RiskRejected`].

use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::calibrator::Calibrator;
use super::risk::{ExposureLedger, RiskCheck, RiskRejected};
use crate::types::{BucketTier, ConfigError, EnsembleDecision, Market, RiskCheckResult, StakeInstruction};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Stake multiplier per confidence tier.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BucketMultipliers {
    pub low: f64,
    pub mid: f64,
    pub high: f64,
}

impl Default for BucketMultipliers {
    fn default() -> Self {
        Self {
            low: 0.5,
            mid: 1.0,
            high: 1.5,
        }
    }
}

impl BucketMultipliers {
    pub fn for_tier(&self, tier: BucketTier) -> f64 {
        match tier {
            BucketTier::Low => self.low,
            BucketTier::Mid => self.mid,
            BucketTier::High => self.high,
        }
    }
}

/// Stake sizing and risk limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Upper bound on the Kelly fraction.
    pub kelly_cap: f64,
    /// Stake for a full (f = 1) Kelly bet at Mid tier.
    pub unit_size: Decimal,
    /// Starting bankroll.
    pub bankroll: Decimal,
    /// Total open exposure may not exceed bankroll × this ratio.
    pub max_stake_ratio: f64,
    /// Cap on open stakes within one round.
    pub per_round_cap: Decimal,
    /// Cap on open stakes on one market across rounds.
    pub per_market_cap: Decimal,
    pub max_orders_per_round: usize,
    /// Payout multiple used when a market has no explicit entry.
    pub default_payout: f64,
    /// Payout multiple (gross return per unit staked), keyed by market code.
    pub payouts: BTreeMap<String, f64>,
    pub bucket_multipliers: BucketMultipliers,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            kelly_cap: 0.05,
            unit_size: dec!(100),
            bankroll: dec!(1000),
            max_stake_ratio: 0.2,
            per_round_cap: dec!(20),
            per_market_cap: dec!(50),
            max_orders_per_round: 2,
            default_payout: 1.98,
            payouts: BTreeMap::new(),
            bucket_multipliers: BucketMultipliers::default(),
        }
    }
}

impl SizingConfig {
    pub fn payout_for(&self, market: Market) -> f64 {
        self.payouts
            .get(market.code())
            .copied()
            .unwrap_or(self.default_payout)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.kelly_cap) {
            return Err(ConfigError::NotAProbability {
                name: "sizing.kelly_cap".into(),
                value: self.kelly_cap,
            });
        }
        if !(self.max_stake_ratio > 0.0 && self.max_stake_ratio <= 1.0) {
            return Err(ConfigError::NotAProbability {
                name: "sizing.max_stake_ratio".into(),
                value: self.max_stake_ratio,
            });
        }
        for (name, value) in [
            ("sizing.unit_size", self.unit_size),
            ("sizing.per_round_cap", self.per_round_cap),
            ("sizing.per_market_cap", self.per_market_cap),
        ] {
            if value <= Decimal::ZERO {
                return Err(ConfigError::NonPositive {
                    name: name.into(),
                    value: value.to_string(),
                });
            }
        }
        if self.bankroll < Decimal::ZERO {
            return Err(ConfigError::Other("sizing.bankroll must not be negative".into()));
        }
        if self.max_orders_per_round == 0 {
            return Err(ConfigError::NonPositive {
                name: "sizing.max_orders_per_round".into(),
                value: "0".into(),
            });
        }
        if let Some(code) = self.payouts.keys().find(|k| k.parse::<Market>().is_err()) {
            return Err(ConfigError::Other(format!("sizing.payouts: unknown market {code}")));
        }
        for market in Market::ALL {
            let multiple = self.payout_for(*market);
            if !(multiple > 1.0) {
                return Err(ConfigError::PayoutMultiple {
                    market: *market,
                    multiple,
                });
            }
        }
        let m = self.bucket_multipliers;
        if [m.low, m.mid, m.high].iter().any(|v| !(*v >= 0.0) || !v.is_finite()) {
            return Err(ConfigError::Other(
                "sizing.bucket_multipliers must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Kelly
// ---------------------------------------------------------------------------

/// Raw Kelly fraction for win probability `p` at gross payout multiple `m`.
///
/// f* = (p·m − 1) / (m − 1), i.e. (bp − q)/b with net odds b = m − 1.
pub fn raw_kelly(p: f64, m: f64) -> f64 {
    (p * m - 1.0) / (m - 1.0)
}

/// Kelly fraction clamped to `[0, cap]`.
pub fn kelly_fraction(p: f64, m: f64, cap: f64) -> f64 {
    let raw = raw_kelly(p, m);
    if raw.is_finite() {
        raw.clamp(0.0, cap)
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Stake sizer
// ---------------------------------------------------------------------------

pub struct StakeSizer {
    config: SizingConfig,
    calibrator: Calibrator,
}

impl StakeSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self {
            config,
            calibrator: Calibrator::default(),
        }
    }

    /// Size on calibrated probabilities instead of the raw ensemble value.
    pub fn with_calibrator(mut self, calibrator: Calibrator) -> Self {
        self.calibrator = calibrator;
        self
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Size an accepted decision against the current bankroll and open
    /// exposure. Does not record the stake in the ledger.
    pub fn size(
        &self,
        decision: &EnsembleDecision,
        bankroll: Decimal,
        ledger: &ExposureLedger,
    ) -> Result<StakeInstruction, RiskRejected> {
        let m = self.config.payout_for(decision.market);
        let p = self.calibrator.apply(decision.p_star);
        let kelly = kelly_fraction(p, m, self.config.kelly_cap);
        let multiplier = self.config.bucket_multipliers.for_tier(decision.bucket_tier);

        let stake = Decimal::from_f64(kelly * multiplier).unwrap_or(Decimal::ZERO)
            * self.config.unit_size;
        let stake = stake.round_dp(2);
        let edge = Decimal::from_f64(p * m - 1.0).unwrap_or(Decimal::ZERO);
        let expected_value = stake * edge;

        let ratio = Decimal::from_f64(self.config.max_stake_ratio).unwrap_or(Decimal::ZERO);
        let orders = ledger.orders_in_round(&decision.round_id);

        // Evaluation order matters: the first failure names the rejection.
        let checks = [
            (RiskCheck::PositiveStake, Decimal::ZERO, stake, stake > Decimal::ZERO),
            {
                let attempted = ledger.round_exposure(&decision.round_id) + stake;
                let limit = self.config.per_round_cap;
                (RiskCheck::RoundCap, limit, attempted, attempted <= limit)
            },
            {
                let attempted = ledger.market_exposure(decision.market) + stake;
                let limit = self.config.per_market_cap;
                (RiskCheck::MarketCap, limit, attempted, attempted <= limit)
            },
            {
                let attempted = ledger.total_exposure() + stake;
                let limit = (bankroll * ratio).round_dp(2);
                (RiskCheck::BankrollCap, limit, attempted, attempted <= limit)
            },
            (
                RiskCheck::MaxOrders,
                Decimal::from(self.config.max_orders_per_round),
                Decimal::from(orders + 1),
                orders < self.config.max_orders_per_round,
            ),
        ];

        let mut results = Vec::with_capacity(checks.len());
        for (check, limit, attempted, passed) in checks {
            results.push(RiskCheckResult {
                check: check.to_string(),
                passed,
                limit,
                attempted,
            });
            if !passed {
                info!(
                    round_id = %decision.round_id,
                    market = %decision.market,
                    pick = %decision.pick,
                    check = %check,
                    limit = %limit,
                    attempted = %attempted,
                    "Stake rejected by risk check"
                );
                return Err(RiskRejected {
                    round_id: decision.round_id.clone(),
                    market: decision.market,
                    pick: decision.pick,
                    check,
                    limit,
                    attempted,
                });
            }
        }

        debug!(
            round_id = %decision.round_id,
            p_star = format!("{:.4}", decision.p_star),
            p_sized = format!("{:.4}", p),
            raw_kelly = format!("{:.2}%", raw_kelly(p, m) * 100.0),
            kelly = format!("{:.2}%", kelly * 100.0),
            tier = %decision.bucket_tier,
            stake = %stake,
            ev = %expected_value.round_dp(4),
            "Stake sized"
        );

        Ok(StakeInstruction {
            round_id: decision.round_id.clone(),
            market: decision.market,
            pick: decision.pick,
            stake_amount: stake,
            kelly_fraction: kelly,
            win_probability: p,
            expected_value,
            payout_multiple: m,
            risk_check_results: results,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::calibrator::CalibrationConfig;
    use crate::types::Pick;

    fn make_decision(round: &str, pick: Pick, p_star: f64, tier: BucketTier) -> EnsembleDecision {
        EnsembleDecision {
            round_id: round.to_string(),
            market: pick.market(),
            pick,
            p_star,
            bucket_tier: tier,
            accept: true,
            extreme_gate_triggered: false,
            weight_snapshot: BTreeMap::new(),
        }
    }

    fn sizer() -> StakeSizer {
        StakeSizer::new(SizingConfig::default())
    }

    #[test]
    fn test_kelly_capped() {
        let raw = raw_kelly(0.602, 1.98);
        assert!(raw > 0.05);
        assert!((raw - 0.1959).abs() < 1e-3);
        assert_eq!(kelly_fraction(0.602, 1.98, 0.05), 0.05);
    }

    #[test]
    fn test_kelly_no_edge_is_zero() {
        assert_eq!(kelly_fraction(0.50, 1.98, 0.05), 0.0);
        assert_eq!(kelly_fraction(0.10, 1.98, 0.05), 0.0);
    }

    #[test]
    fn test_kelly_monotonic_in_p() {
        let mut prev = 0.0;
        for i in 0..=100 {
            let p = i as f64 / 100.0;
            let f = kelly_fraction(p, 1.98, 0.05);
            assert!(f >= prev, "p={p}");
            assert!(f <= 0.05);
            prev = f;
        }
    }

    #[test]
    fn test_basic_stake() {
        let d = make_decision("r1", Pick::Odd, 0.602, BucketTier::Mid);
        let s = sizer().size(&d, dec!(1000), &ExposureLedger::new()).unwrap();
        assert_eq!(s.stake_amount, dec!(5.00));
        assert_eq!(s.kelly_fraction, 0.05);
        assert_eq!(s.win_probability, 0.602);
        assert!(s.expected_value > Decimal::ZERO);
        assert_eq!(s.risk_check_results.len(), 5);
        assert!(s.risk_check_results.iter().all(|r| r.passed));
    }

    #[test]
    fn test_bucket_multiplier_scales_stake() {
        let low = make_decision("r1", Pick::Odd, 0.602, BucketTier::Low);
        let high = make_decision("r1", Pick::Odd, 0.70, BucketTier::High);
        let ledger = ExposureLedger::new();
        assert_eq!(sizer().size(&low, dec!(1000), &ledger).unwrap().stake_amount, dec!(2.50));
        assert_eq!(sizer().size(&high, dec!(1000), &ledger).unwrap().stake_amount, dec!(7.50));
    }

    #[test]
    fn test_zero_kelly_rejected_as_non_positive() {
        let d = make_decision("r1", Pick::Odd, 0.50, BucketTier::Low);
        let r = sizer().size(&d, dec!(1000), &ExposureLedger::new()).unwrap_err();
        assert_eq!(r.check, RiskCheck::PositiveStake);
    }

    #[test]
    fn test_round_cap_rejects() {
        let s = StakeSizer::new(SizingConfig {
            per_round_cap: dec!(8),
            ..SizingConfig::default()
        });
        let mut ledger = ExposureLedger::new();
        let d = make_decision("r1", Pick::Odd, 0.602, BucketTier::Mid);
        ledger.record(s.size(&d, dec!(1000), &ledger).unwrap());

        let d2 = make_decision("r1", Pick::Big, 0.602, BucketTier::Mid);
        let r = s.size(&d2, dec!(1000), &ledger).unwrap_err();
        assert_eq!(r.check, RiskCheck::RoundCap);
        assert_eq!(r.limit, dec!(8));
        assert_eq!(r.attempted, dec!(10.00));
    }

    #[test]
    fn test_market_cap_spans_rounds() {
        let s = StakeSizer::new(SizingConfig {
            per_market_cap: dec!(12),
            ..SizingConfig::default()
        });
        let mut ledger = ExposureLedger::new();
        for round in ["r1", "r2"] {
            let d = make_decision(round, Pick::Odd, 0.602, BucketTier::Mid);
            ledger.record(s.size(&d, dec!(1000), &ledger).unwrap());
        }
        let d = make_decision("r3", Pick::Even, 0.602, BucketTier::Mid);
        assert_eq!(s.size(&d, dec!(1000), &ledger).unwrap_err().check, RiskCheck::MarketCap);

        // The other market is unaffected.
        let d = make_decision("r3", Pick::Big, 0.602, BucketTier::Mid);
        assert!(s.size(&d, dec!(1000), &ledger).is_ok());
    }

    #[test]
    fn test_bankroll_cap_rejects() {
        let d = make_decision("r1", Pick::Odd, 0.602, BucketTier::Mid);
        // 20 × 0.2 = 4 < 5
        let r = sizer().size(&d, dec!(20), &ExposureLedger::new()).unwrap_err();
        assert_eq!(r.check, RiskCheck::BankrollCap);
        assert_eq!(r.limit, dec!(4.00));
    }

    #[test]
    fn test_zero_bankroll_rejects() {
        let d = make_decision("r1", Pick::Odd, 0.602, BucketTier::Mid);
        let r = sizer().size(&d, Decimal::ZERO, &ExposureLedger::new()).unwrap_err();
        assert_eq!(r.check, RiskCheck::BankrollCap);
    }

    #[test]
    fn test_max_orders_rejects() {
        let s = StakeSizer::new(SizingConfig {
            max_orders_per_round: 1,
            ..SizingConfig::default()
        });
        let mut ledger = ExposureLedger::new();
        let d = make_decision("r1", Pick::Odd, 0.602, BucketTier::Mid);
        ledger.record(s.size(&d, dec!(1000), &ledger).unwrap());
        let d2 = make_decision("r1", Pick::Big, 0.602, BucketTier::Mid);
        let r = s.size(&d2, dec!(1000), &ledger).unwrap_err();
        assert_eq!(r.check, RiskCheck::MaxOrders);
    }

    #[test]
    fn test_cumulative_exposure_never_exceeds_bankroll_cap() {
        let s = StakeSizer::new(SizingConfig {
            per_round_cap: dec!(1000),
            per_market_cap: dec!(1000),
            max_orders_per_round: 10,
            ..SizingConfig::default()
        });
        let bankroll = dec!(100);
        let mut ledger = ExposureLedger::new();
        for i in 0..50 {
            let pick = if i % 2 == 0 { Pick::Odd } else { Pick::Big };
            let d = make_decision(&format!("r{}", i / 4), pick, 0.70, BucketTier::High);
            if let Ok(instr) = s.size(&d, bankroll, &ledger) {
                ledger.record(instr);
            }
            assert!(ledger.total_exposure() <= dec!(20));
        }
    }

    #[test]
    fn test_calibrated_probability_drives_stake() {
        let config = SizingConfig {
            kelly_cap: 1.0,
            ..SizingConfig::default()
        };
        let d = make_decision("r1", Pick::Odd, 0.60, BucketTier::Mid);
        let ledger = ExposureLedger::new();

        let raw = StakeSizer::new(config.clone()).size(&d, dec!(1000), &ledger).unwrap();
        assert_eq!(raw.stake_amount, dec!(19.18));

        let cooled = StakeSizer::new(config.clone())
            .with_calibrator(Calibrator::new(CalibrationConfig {
                temperature: 2.0,
                ..CalibrationConfig::default()
            }))
            .size(&d, dec!(1000), &ledger)
            .unwrap();
        // σ(logit(0.6) / 2) ≈ 0.5505
        assert!((cooled.win_probability - 0.5505).abs() < 1e-3);
        assert!(cooled.kelly_fraction < raw.kelly_fraction);
        assert!(cooled.stake_amount < raw.stake_amount);

        // Pulled all the way to a coin flip, there is no edge left to stake.
        let flat = StakeSizer::new(config)
            .with_calibrator(Calibrator::new(CalibrationConfig {
                a: 1e-3,
                ..CalibrationConfig::default()
            }))
            .size(&d, dec!(1000), &ledger)
            .unwrap_err();
        assert_eq!(flat.check, RiskCheck::PositiveStake);
    }

    #[test]
    fn test_per_market_payout() {
        let mut payouts = BTreeMap::new();
        payouts.insert("size".to_string(), 2.5);
        let config = SizingConfig {
            payouts,
            ..SizingConfig::default()
        };
        assert_eq!(config.payout_for(Market::Size), 2.5);
        assert_eq!(config.payout_for(Market::OddEven), 1.98);
    }

    #[test]
    fn test_config_validation() {
        assert!(SizingConfig::default().validate().is_ok());
        let bad = SizingConfig {
            default_payout: 1.0,
            ..SizingConfig::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::PayoutMultiple { .. })));
        let bad = SizingConfig {
            kelly_cap: 1.5,
            ..SizingConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
