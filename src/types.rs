//! Shared types for the ensemble engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that the strategy, engine and
//! storage modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Markets & picks
// ---------------------------------------------------------------------------

/// Lowest draw total that counts as "big".
pub const BIG_THRESHOLD: u32 = 14;

/// Highest possible draw total (three digits 0–9).
pub const MAX_DRAW_TOTAL: u32 = 27;

/// A binary market on the draw total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Market {
    /// Odd / even on the draw total.
    #[serde(rename = "oe")]
    OddEven,
    /// Big / small on the draw total.
    #[serde(rename = "size")]
    Size,
}

impl Market {
    /// All known markets (useful for iteration).
    pub const ALL: &'static [Market] = &[Market::OddEven, Market::Size];

    /// The two picks that can be taken on this market.
    pub fn picks(&self) -> [Pick; 2] {
        match self {
            Market::OddEven => [Pick::Odd, Pick::Even],
            Market::Size => [Pick::Big, Pick::Small],
        }
    }

    /// Short code used in configuration and on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Market::OddEven => "oe",
            Market::Size => "size",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::str::FromStr for Market {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "oe" | "odd_even" | "oddeven" => Ok(Market::OddEven),
            "size" | "big_small" => Ok(Market::Size),
            _ => Err(anyhow::anyhow!("Unknown market: {s}")),
        }
    }
}

/// The side taken on a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pick {
    Odd,
    Even,
    Big,
    Small,
}

impl Pick {
    /// The market this pick belongs to.
    pub fn market(&self) -> Market {
        match self {
            Pick::Odd | Pick::Even => Market::OddEven,
            Pick::Big | Pick::Small => Market::Size,
        }
    }

    /// Whether this pick wins for the given draw total.
    pub fn wins(&self, total: u32) -> bool {
        match self {
            Pick::Odd => total % 2 == 1,
            Pick::Even => total % 2 == 0,
            Pick::Big => total >= BIG_THRESHOLD,
            Pick::Small => total < BIG_THRESHOLD,
        }
    }
}

impl fmt::Display for Pick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pick::Odd => write!(f, "odd"),
            Pick::Even => write!(f, "even"),
            Pick::Big => write!(f, "big"),
            Pick::Small => write!(f, "small"),
        }
    }
}

impl std::str::FromStr for Pick {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "odd" => Ok(Pick::Odd),
            "even" => Ok(Pick::Even),
            "big" => Ok(Pick::Big),
            "small" => Ok(Pick::Small),
            _ => Err(anyhow::anyhow!("Unknown pick: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// A single source's probability that `pick` wins in `round_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub source: String,
    pub round_id: String,
    pub market: Market,
    pub pick: Pick,
    pub probability: f64,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for SignalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}/{} p={:.3}",
            self.source, self.round_id, self.market, self.pick, self.probability
        )
    }
}

/// Key identifying one decision: a pick on a market in a round.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DecisionKey {
    pub round_id: String,
    pub market: Market,
    pub pick: Pick,
}

impl fmt::Display for DecisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.round_id, self.market, self.pick)
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Confidence tier used to scale stake size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketTier {
    Low,
    Mid,
    High,
}

impl fmt::Display for BucketTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketTier::Low => write!(f, "low"),
            BucketTier::Mid => write!(f, "mid"),
            BucketTier::High => write!(f, "high"),
        }
    }
}

/// The voter's verdict for one (round, market, pick).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleDecision {
    pub round_id: String,
    pub market: Market,
    pub pick: Pick,
    pub p_star: f64,
    pub bucket_tier: BucketTier,
    pub accept: bool,
    pub extreme_gate_triggered: bool,
    /// Weights actually used, for the sources present.
    pub weight_snapshot: BTreeMap<String, f64>,
}

impl EnsembleDecision {
    pub fn key(&self) -> DecisionKey {
        DecisionKey {
            round_id: self.round_id.clone(),
            market: self.market,
            pick: self.pick,
        }
    }
}

impl fmt::Display for EnsembleDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} p*={:.3} tier={} {}{}",
            self.round_id,
            self.market,
            self.pick,
            self.p_star,
            self.bucket_tier,
            if self.accept { "ACCEPT" } else { "REJECT" },
            if self.extreme_gate_triggered { " (extreme)" } else { "" },
        )
    }
}

// ---------------------------------------------------------------------------
// Stake instructions
// ---------------------------------------------------------------------------

/// Outcome of a single pre-trade risk check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCheckResult {
    pub check: String,
    pub passed: bool,
    pub limit: Decimal,
    pub attempted: Decimal,
}

/// Order to be placed by the external order sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeInstruction {
    pub round_id: String,
    pub market: Market,
    pub pick: Pick,
    pub stake_amount: Decimal,
    pub kelly_fraction: f64,
    /// Win probability the stake was sized on, after calibration.
    #[serde(default)]
    pub win_probability: f64,
    pub expected_value: Decimal,
    pub payout_multiple: f64,
    pub risk_check_results: Vec<RiskCheckResult>,
}

impl fmt::Display for StakeInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} stake={} kelly={:.2}% ev={}",
            self.round_id,
            self.market,
            self.pick,
            self.stake_amount,
            self.kelly_fraction * 100.0,
            self.expected_value.round_dp(4),
        )
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// The realized draw for a round, delivered by the settlement collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub round_id: String,
    /// Draw total (0–27).
    pub total: u32,
    #[serde(default = "Utc::now")]
    pub resolved_at: DateTime<Utc>,
}

impl RoundOutcome {
    pub fn new(round_id: impl Into<String>, total: u32) -> Self {
        Self {
            round_id: round_id.into(),
            total,
            resolved_at: Utc::now(),
        }
    }

    pub fn pick_won(&self, pick: Pick) -> bool {
        pick.wins(self.total)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.total > MAX_DRAW_TOTAL {
            return Err(ValidationError::InvalidOutcome {
                round_id: self.round_id.clone(),
                total: self.total,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Controller regime
// ---------------------------------------------------------------------------

/// Named gain regime for the acceptance controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Conservative,
    #[default]
    Balanced,
    Aggressive,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regime::Conservative => write!(f, "conservative"),
            Regime::Balanced => write!(f, "balanced"),
            Regime::Aggressive => write!(f, "aggressive"),
        }
    }
}

impl std::str::FromStr for Regime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conservative" => Ok(Regime::Conservative),
            "balanced" => Ok(Regime::Balanced),
            "aggressive" => Ok(Regime::Aggressive),
            _ => Err(anyhow::anyhow!("Unknown regime: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A signal (or a whole round) failed validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Signal has an empty source name")]
    EmptySource,

    #[error("Probability from {source_id} is not finite")]
    NotFinite { source_id: String },

    #[error("Probability {probability} from {source_id} is outside [0, 1]")]
    OutOfRange { source_id: String, probability: f64 },

    #[error("Pick {pick} does not belong to market {market}")]
    MarketPickMismatch { market: Market, pick: Pick },

    #[error("Market {0} is not enabled")]
    MarketDisabled(Market),

    #[error("Signal from {source_id} is stale ({age_secs}s old)")]
    Stale { source_id: String, age_secs: i64 },

    #[error("Signal from {source_id} is timestamped {ahead_secs}s in the future")]
    FromFuture { source_id: String, ahead_secs: i64 },

    #[error("No valid sources remain for {0}")]
    NoValidSources(DecisionKey),

    #[error("{0} has already been decided")]
    AlreadyDecided(DecisionKey),

    #[error("{0} not evaluated: round already settled")]
    RoundSettled(DecisionKey),

    #[error("Draw total {total} for round {round_id} is outside 0..=27")]
    InvalidOutcome { round_id: String, total: u32 },
}

/// Inconsistent configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Weight floor {floor} exceeds ceiling {ceiling}")]
    WeightBounds { floor: f64, ceiling: f64 },

    #[error("Threshold bounds must satisfy 0 < min <= max < 1 (got {min}..{max})")]
    ThresholdBounds { min: f64, max: f64 },

    #[error("{name} must be positive (got {value})")]
    NonPositive { name: String, value: String },

    #[error("{name} must lie in [0, 1] (got {value})")]
    NotAProbability { name: String, value: f64 },

    #[error("Extreme gate requires lo < hi (got lo={lo}, hi={hi})")]
    GateBounds { lo: f64, hi: f64 },

    #[error("Bucket breakpoints must satisfy 0 <= mid <= high <= 1 (got {mid}, {high})")]
    BucketBreakpoints { mid: f64, high: f64 },

    #[error("Payout multiple for {market} must exceed 1.0 (got {multiple})")]
    PayoutMultiple { market: Market, multiple: f64 },

    #[error("Configuration error: {0}")]
    Other(String),
}

/// Top-level engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Engine state owner has shut down")]
    StateClosed,

    #[error("Storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
