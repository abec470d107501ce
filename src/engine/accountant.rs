//! Accountant: bankroll, open exposure and settlement P&L.
//!
//! Stakes are not debited when placed; they sit in the exposure ledger until
//! the round's outcome arrives, then settle as `stake·(m − 1)` on a win or
//! `−stake` on a loss.
//!
//! The book also remembers which keys were decided and which rounds were
//! settled, so a repeated or late batch never opens a second stake.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{info, warn};

use crate::engine::state::MAX_PENDING_ROUNDS;
use crate::strategy::risk::ExposureLedger;
use crate::types::{DecisionKey, Market, Pick, RoundOutcome, StakeInstruction, ValidationError};

/// Decided keys remembered for unsettled rounds (four picks per round).
pub const MAX_DECIDED_KEYS: usize = MAX_PENDING_ROUNDS * 4;

/// Settled rounds remembered for refusing late signals.
pub const MAX_SETTLED_ROUNDS: usize = MAX_PENDING_ROUNDS;

// ---------------------------------------------------------------------------
// Round log
// ---------------------------------------------------------------------------

/// Keys already decided and rounds already settled. Both lists are bounded
/// and forget their oldest entries first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundLog {
    decided: VecDeque<DecisionKey>,
    settled: VecDeque<String>,
}

impl RoundLog {
    pub fn is_decided(&self, key: &DecisionKey) -> bool {
        self.decided.contains(key)
    }

    pub fn is_settled(&self, round_id: &str) -> bool {
        self.settled.iter().any(|r| r == round_id)
    }

    /// Whether signals for `key` may still be voted on.
    pub fn admit(&self, key: &DecisionKey) -> Result<(), ValidationError> {
        if self.is_settled(&key.round_id) {
            Err(ValidationError::RoundSettled(key.clone()))
        } else if self.is_decided(key) {
            Err(ValidationError::AlreadyDecided(key.clone()))
        } else {
            Ok(())
        }
    }

    pub fn mark_decided(&mut self, key: DecisionKey) {
        if self.is_decided(&key) {
            return;
        }
        self.decided.push_back(key);
        while self.decided.len() > MAX_DECIDED_KEYS {
            self.decided.pop_front();
        }
    }

    /// Record a settled round. Its decided keys are dropped; the settled
    /// entry covers them.
    pub fn mark_settled(&mut self, round_id: &str) {
        self.decided.retain(|k| k.round_id != round_id);
        if self.is_settled(round_id) {
            return;
        }
        self.settled.push_back(round_id.to_string());
        while self.settled.len() > MAX_SETTLED_ROUNDS {
            self.settled.pop_front();
        }
    }

    pub fn decided_keys(&self) -> usize {
        self.decided.len()
    }
}

// ---------------------------------------------------------------------------
// Book
// ---------------------------------------------------------------------------

/// Money state of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub bankroll: Decimal,
    pub peak_bankroll: Decimal,
    pub realized_pnl: Decimal,
    pub total_staked: Decimal,
    pub stakes_won: u64,
    pub stakes_lost: u64,
    pub ledger: ExposureLedger,
    #[serde(default)]
    pub rounds: RoundLog,
}

impl Book {
    pub fn new(bankroll: Decimal) -> Self {
        Self {
            bankroll,
            peak_bankroll: bankroll,
            realized_pnl: Decimal::ZERO,
            total_staked: Decimal::ZERO,
            stakes_won: 0,
            stakes_lost: 0,
            ledger: ExposureLedger::new(),
            rounds: RoundLog::default(),
        }
    }

    /// Record a stake handed to the order sink.
    pub fn open(&mut self, instruction: StakeInstruction) {
        self.total_staked += instruction.stake_amount;
        self.ledger.record(instruction);
    }

    /// Deposit (positive) or withdraw (negative) funds outside of play. The
    /// peak moves with the funds so a withdrawal is not read as drawdown.
    pub fn adjust_bankroll(&mut self, delta: Decimal) {
        self.bankroll = (self.bankroll + delta).max(Decimal::ZERO);
        self.peak_bankroll = (self.peak_bankroll + delta).max(self.bankroll);
    }

    pub fn open_exposure(&self) -> Decimal {
        self.ledger.total_exposure()
    }

    /// Drawdown from peak as a fraction (0.0 – 1.0).
    pub fn drawdown(&self) -> f64 {
        if self.peak_bankroll <= Decimal::ZERO {
            return 0.0;
        }
        ((self.peak_bankroll - self.bankroll) / self.peak_bankroll)
            .to_f64()
            .unwrap_or(0.0)
            .max(0.0)
    }

    /// Win rate of settled stakes.
    pub fn win_rate(&self) -> f64 {
        let settled = self.stakes_won + self.stakes_lost;
        if settled == 0 {
            0.0
        } else {
            self.stakes_won as f64 / settled as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Settlement report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettledStake {
    pub market: Market,
    pub pick: Pick,
    pub stake: Decimal,
    pub won: bool,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementReport {
    pub round_id: String,
    pub total: u32,
    pub settled: Vec<SettledStake>,
    pub pnl: Decimal,
    pub bankroll_before: Decimal,
    pub bankroll_after: Decimal,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

pub struct Accountant;

impl Accountant {
    /// P&L of one stake for the given outcome.
    pub fn stake_pnl(instruction: &StakeInstruction, won: bool) -> Decimal {
        if won {
            let net = Decimal::from_f64(instruction.payout_multiple - 1.0).unwrap_or(Decimal::ZERO);
            (instruction.stake_amount * net).round_dp(2)
        } else {
            -instruction.stake_amount
        }
    }

    /// Settle every open stake of the outcome's round and release its
    /// exposure. A round with no open stakes settles to an empty report.
    pub fn settle(book: &mut Book, outcome: &RoundOutcome) -> SettlementReport {
        let bankroll_before = book.bankroll;
        let mut settled = Vec::new();
        let mut pnl = Decimal::ZERO;

        for instruction in book.ledger.release_round(&outcome.round_id) {
            let won = outcome.pick_won(instruction.pick);
            let stake_pnl = Self::stake_pnl(&instruction, won);
            if won {
                book.stakes_won += 1;
            } else {
                book.stakes_lost += 1;
            }
            pnl += stake_pnl;
            settled.push(SettledStake {
                market: instruction.market,
                pick: instruction.pick,
                stake: instruction.stake_amount,
                won,
                pnl: stake_pnl,
            });
        }

        book.rounds.mark_settled(&outcome.round_id);
        book.bankroll += pnl;
        book.realized_pnl += pnl;
        if book.bankroll > book.peak_bankroll {
            book.peak_bankroll = book.bankroll;
        }

        if !settled.is_empty() {
            info!(
                round_id = %outcome.round_id,
                total = outcome.total,
                stakes = settled.len(),
                pnl = %pnl,
                bankroll = %book.bankroll,
                "Round settled"
            );
        }
        if book.bankroll <= Decimal::ZERO {
            warn!(bankroll = %book.bankroll, "Bankroll depleted");
        }

        SettlementReport {
            round_id: outcome.round_id.clone(),
            total: outcome.total,
            settled,
            pnl,
            bankroll_before,
            bankroll_after: book.bankroll,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
