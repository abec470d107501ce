//! Risk checks and open-exposure tracking.
//!
//! The ledger records every stake instruction handed to the order sink until
//! its round settles, so concentration limits are enforced against open
//! exposure rather than per order.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{Market, Pick, StakeInstruction};

// ---------------------------------------------------------------------------
// Checks & rejections
// ---------------------------------------------------------------------------

/// Named pre-trade constraint, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCheck {
    PositiveStake,
    RoundCap,
    MarketCap,
    BankrollCap,
    MaxOrders,
}

impl RiskCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCheck::PositiveStake => "positive_stake",
            RiskCheck::RoundCap => "round_cap",
            RiskCheck::MarketCap => "market_cap",
            RiskCheck::BankrollCap => "bankroll_cap",
            RiskCheck::MaxOrders => "max_orders",
        }
    }
}

impl fmt::Display for RiskCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sized stake that failed a hard risk check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRejected {
    pub round_id: String,
    pub market: Market,
    pub pick: Pick,
    pub check: RiskCheck,
    pub limit: Decimal,
    pub attempted: Decimal,
}

impl fmt::Display for RiskRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} rejected by {} (attempted {}, limit {})",
            self.round_id, self.market, self.pick, self.check, self.attempted, self.limit
        )
    }
}

// ---------------------------------------------------------------------------
// Exposure ledger
// ---------------------------------------------------------------------------

/// Open stake instructions, grouped by round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureLedger {
    open: BTreeMap<String, Vec<StakeInstruction>>,
}

impl ExposureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, instruction: StakeInstruction) {
        self.open
            .entry(instruction.round_id.clone())
            .or_default()
            .push(instruction);
    }

    /// Remove and return every open instruction for a settled round.
    pub fn release_round(&mut self, round_id: &str) -> Vec<StakeInstruction> {
        self.open.remove(round_id).unwrap_or_default()
    }

    pub fn round_exposure(&self, round_id: &str) -> Decimal {
        self.open
            .get(round_id)
            .map(|v| v.iter().map(|i| i.stake_amount).sum())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn market_exposure(&self, market: Market) -> Decimal {
        self.open
            .values()
            .flatten()
            .filter(|i| i.market == market)
            .map(|i| i.stake_amount)
            .sum()
    }

    pub fn total_exposure(&self) -> Decimal {
        self.open.values().flatten().map(|i| i.stake_amount).sum()
    }

    pub fn orders_in_round(&self, round_id: &str) -> usize {
        self.open.get(round_id).map(Vec::len).unwrap_or(0)
    }

    pub fn open_rounds(&self) -> usize {
        self.open.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
