//! Historical replay.
//!
//! Replays rounds with known outcomes through the full engine, round by
//! round: decide on the round's signals, then settle it with the realized
//! draw so the weights and threshold adapt exactly as they would live.
//! Reports coverage, accuracy, P&L, drawdown and per-source calibration,
//! plus calibration parameters fitted to the ensemble probability.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use super::calibration::{CalibrationSummary, CalibrationTracker, ScoredForecast};
use crate::config::AppConfig;
use crate::engine::accountant::Book;
use crate::engine::state::{FeedbackState, StateOwner};
use crate::strategy::calibrator::{CalibrationConfig, Calibrator};
use crate::strategy::DecisionOrchestrator;
use crate::types::{EngineError, RoundOutcome, SignalRecord};

// ---------------------------------------------------------------------------
// Historical data
// ---------------------------------------------------------------------------

/// One past round: the signals available before the draw and its total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalRound {
    pub round_id: String,
    pub signals: Vec<SignalRecord>,
    pub total: u32,
    /// Evaluation time. Defaults to the newest signal's timestamp.
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
}

impl HistoricalRound {
    pub fn evaluation_time(&self) -> DateTime<Utc> {
        self.decided_at
            .or_else(|| self.signals.iter().map(|s| s.timestamp).max())
            .unwrap_or_else(Utc::now)
    }

    fn outcome(&self) -> RoundOutcome {
        RoundOutcome {
            round_id: self.round_id.clone(),
            total: self.total,
            resolved_at: self.evaluation_time(),
        }
    }
}

// ---------------------------------------------------------------------------
// Replay results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub rounds: usize,
    pub decisions: usize,
    pub accepted: usize,
    /// Accepted decisions whose pick won.
    pub accepted_wins: usize,
    pub staked: usize,
    pub risk_rejected: usize,
    /// accepted / decisions
    pub coverage: f64,
    /// accepted_wins / accepted
    pub accuracy: f64,
    pub initial_bankroll: Decimal,
    pub final_bankroll: Decimal,
    pub total_pnl: Decimal,
    pub return_pct: f64,
    pub stake_win_rate: f64,
    pub sharpe_ratio: f64,
    pub peak_bankroll: Decimal,
    pub max_drawdown_pct: f64,
    pub final_threshold: f64,
    pub final_weights: BTreeMap<String, f64>,
    /// Threshold after each round.
    pub threshold_history: Vec<(String, f64)>,
    /// Bankroll after each round.
    pub balance_history: Vec<(String, Decimal)>,
    /// Per-source calibration of the raw inputs.
    pub calibration: CalibrationSummary,
    /// Brier score of the aggregated p_star.
    pub ensemble_brier: f64,
    /// Platt and temperature parameters fitted to p_star, ready for the
    /// `[calibration]` section.
    pub fitted_calibration: CalibrationConfig,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct ReplayRunner {
    config: AppConfig,
}

impl ReplayRunner {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Replay rounds in the order given, starting from a fresh state.
    pub async fn run(&self, rounds: &[HistoricalRound]) -> Result<ReplayReport, EngineError> {
        self.config.validate()?;
        let config = &self.config;

        let state = FeedbackState::new(
            &config.weights,
            config.controller.clone(),
            config.voting.accept_floor,
        );
        let (handle, owner) = StateOwner::spawn(state, config.engine.state_mailbox);
        let initial_bankroll = config.sizing.bankroll;
        let mut orchestrator =
            DecisionOrchestrator::new(config, handle, Book::new(initial_bankroll), None);

        let mut sources = CalibrationTracker::new();
        let mut ensemble = CalibrationTracker::new();
        let mut ensemble_samples = Vec::new();
        let mut returns: Vec<f64> = Vec::new();
        let mut threshold_history = Vec::with_capacity(rounds.len());
        let mut balance_history = Vec::with_capacity(rounds.len());
        let mut max_dd = 0.0_f64;
        let (mut decisions, mut accepted, mut accepted_wins) = (0usize, 0usize, 0usize);
        let (mut staked, mut risk_rejected) = (0usize, 0usize);

        for round in rounds {
            let batch = orchestrator
                .process(&round.signals, round.evaluation_time())
                .await?;
            let outcome = round.outcome();

            for decision in batch.trails.iter().filter_map(|t| t.decision.as_ref()) {
                if decision.round_id != outcome.round_id {
                    continue;
                }
                let won = outcome.pick_won(decision.pick);
                decisions += 1;
                if decision.accept {
                    accepted += 1;
                    if won {
                        accepted_wins += 1;
                    }
                }
                ensemble.record(ScoredForecast::new("ensemble", decision.p_star, won));
                ensemble_samples.push((decision.p_star, won));
            }
            for trail in batch.trails.iter().filter(|t| t.key.round_id == outcome.round_id) {
                let won = outcome.pick_won(trail.key.pick);
                sources.extend(
                    trail
                        .inputs
                        .iter()
                        .map(|(source, p)| ScoredForecast::new(source.as_str(), *p, won)),
                );
            }
            staked += batch.instructions.len();
            risk_rejected += batch.rejections.len();

            let settled = orchestrator.settle(&outcome).await?;
            for stake in &settled.settlement.settled {
                let stake_f64 = stake.stake.to_f64().unwrap_or(0.0).max(0.01);
                returns.push(stake.pnl.to_f64().unwrap_or(0.0) / stake_f64);
            }

            let book = orchestrator.book();
            max_dd = max_dd.max(book.drawdown());
            threshold_history.push((round.round_id.clone(), orchestrator.state().snapshot().threshold()));
            balance_history.push((round.round_id.clone(), book.bankroll));
        }

        let snapshot = orchestrator.state().snapshot();
        let book = orchestrator.book().clone();
        drop(orchestrator);
        // Every handle is gone, so the owner task finishes.
        let _ = owner.await;

        let return_pct = if initial_bankroll > Decimal::ZERO {
            ((book.bankroll - initial_bankroll) / initial_bankroll * dec!(100))
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let report = ReplayReport {
            rounds: rounds.len(),
            decisions,
            accepted,
            accepted_wins,
            staked,
            risk_rejected,
            coverage: ratio(accepted, decisions),
            accuracy: ratio(accepted_wins, accepted),
            initial_bankroll,
            final_bankroll: book.bankroll,
            total_pnl: book.realized_pnl,
            return_pct,
            stake_win_rate: book.win_rate(),
            sharpe_ratio: compute_sharpe(&returns),
            peak_bankroll: book.peak_bankroll,
            max_drawdown_pct: max_dd * 100.0,
            final_threshold: snapshot.threshold(),
            final_weights: snapshot.weights.weights().clone(),
            threshold_history,
            balance_history,
            calibration: sources.summary(),
            ensemble_brier: ensemble.summary().brier,
            fitted_calibration: Calibrator::fit(&ensemble_samples),
        };

        info!(
            rounds = report.rounds,
            decisions = report.decisions,
            coverage = format!("{:.4}", report.coverage),
            accuracy = format!("{:.4}", report.accuracy),
            pnl = %report.total_pnl,
            threshold = format!("{:.4}", report.final_threshold),
            "Replay complete"
        );

        Ok(report)
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Sharpe ratio of per-stake returns (pnl / stake), not annualized.
fn compute_sharpe(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();

    if std_dev < 1e-10 {
        return 0.0;
    }
    mean / std_dev
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
