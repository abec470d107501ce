//! Decision pipeline.
//!
//! The submodules hold the individual stages; [`DecisionOrchestrator`] runs
//! them in order for each batch and feeds outcomes back.

pub mod calibrator;
pub mod controller;
pub mod ensemble;
pub mod kelly;
pub mod normalizer;
pub mod risk;
pub mod weights;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::engine::accountant::{Accountant, Book, SettlementReport};
use crate::engine::state::{PendingDecision, ResolveReport, StateHandle};
use crate::storage::trail::TrailWriter;
use crate::storage::PersistedState;
use crate::types::{
    DecisionKey, EngineError, EnsembleDecision, RoundOutcome, SignalRecord, StakeInstruction,
    ValidationError,
};
use calibrator::Calibrator;
use controller::StepReport;
use ensemble::EnsembleVoter;
use kelly::StakeSizer;
use normalizer::{NormalizedBatch, SignalGroup, SignalNormalizer};
use risk::RiskRejected;

// ---------------------------------------------------------------------------
// Decision trail
// ---------------------------------------------------------------------------

/// A signal that did not make it into the vote, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedInput {
    pub source: String,
    pub probability: f64,
    pub reason: String,
}

/// What happened after the vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StakeOutcome {
    /// Not accepted (or no decision at all); nothing sized.
    NotAccepted,
    Placed(StakeInstruction),
    Rejected(RiskRejected),
}

/// Complete audit record for one (round, market, pick).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrail {
    pub decision_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub key: DecisionKey,
    /// Source → probability actually voted on.
    pub inputs: BTreeMap<String, f64>,
    pub dropped: Vec<DroppedInput>,
    pub decision: Option<EnsembleDecision>,
    /// Set when no decision could be made.
    pub error: Option<String>,
    pub threshold_used: f64,
    pub state_version: u64,
    pub stake: StakeOutcome,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Everything produced by one `process` call.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub trails: Vec<DecisionTrail>,
    /// Stakes for the order sink, in (round, market, pick) order.
    pub instructions: Vec<StakeInstruction>,
    pub rejections: Vec<RiskRejected>,
    pub invalid: Vec<ValidationError>,
    pub step: Option<StepReport>,
}

impl BatchReport {
    pub fn accepted(&self) -> usize {
        self.trails
            .iter()
            .filter(|t| t.decision.as_ref().is_some_and(|d| d.accept))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct SettleReport {
    pub settlement: SettlementReport,
    pub feedback: ResolveReport,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Pipelines normalization → voting → acceptance → sizing → trail, and feeds
/// outcomes back into the adaptive state.
///
/// Voting reads one shared snapshot per batch and runs on the blocking pool.
/// Sizing runs afterwards in key order because it mutates the book.
pub struct DecisionOrchestrator {
    normalizer: SignalNormalizer,
    voter: Arc<EnsembleVoter>,
    sizer: StakeSizer,
    state: StateHandle,
    book: Book,
    trail: Option<TrailWriter>,
}

impl DecisionOrchestrator {
    pub fn new(config: &AppConfig, state: StateHandle, book: Book, trail: Option<TrailWriter>) -> Self {
        Self {
            normalizer: SignalNormalizer::new(config.signals.clone()),
            voter: Arc::new(EnsembleVoter::new(&config.voting)),
            sizer: StakeSizer::new(config.sizing.clone())
                .with_calibrator(Calibrator::new(config.calibration)),
            state,
            book,
            trail,
        }
    }

    pub fn book(&self) -> &Book {
        &self.book
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    /// Current snapshot and book, ready to save.
    pub fn persisted(&self) -> PersistedState {
        PersistedState::new(self.state.snapshot().as_ref().clone(), self.book.clone())
    }

    /// Run one batch of signals through the full pipeline.
    ///
    /// Each key is decided at most once. Signals for a key that was already
    /// decided, or for a round that has settled, get an error trail and are
    /// neither voted on nor sized.
    pub async fn process(
        &mut self,
        signals: &[SignalRecord],
        now: DateTime<Utc>,
    ) -> Result<BatchReport, EngineError> {
        let batch = self.normalizer.normalize(signals, now);
        let snapshot = self.state.snapshot();
        let threshold = snapshot.threshold();
        let mut report = BatchReport::default();

        // Keys whose every signal was dropped still get a trail.
        let voted: BTreeSet<&DecisionKey> = batch.groups.iter().map(|g| &g.key).collect();
        let orphaned: BTreeSet<DecisionKey> = batch
            .dropped
            .iter()
            .map(|d| DecisionKey {
                round_id: d.signal.round_id.clone(),
                market: d.signal.market,
                pick: d.signal.pick,
            })
            .filter(|k| !voted.contains(k))
            .collect();

        let mut fresh = Vec::with_capacity(batch.groups.len());
        let mut refused = Vec::new();
        for group in &batch.groups {
            match self.book.rounds.admit(&group.key) {
                Ok(()) => fresh.push(group.clone()),
                Err(e) => refused.push((group.clone(), e)),
            }
        }

        // Step 1 – parallel voting against one snapshot
        let votes = join_all(fresh.into_iter().map(|group| {
            let voter = Arc::clone(&self.voter);
            let snapshot = Arc::clone(&snapshot);
            tokio::task::spawn_blocking(move || {
                let result = voter.vote(&group, &snapshot.weights, snapshot.threshold());
                (group, result)
            })
        }))
        .await;

        // Step 2 – sequential sizing in key order
        let mut pending = Vec::new();
        for joined in votes {
            let (group, result) = match joined {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "Vote task failed");
                    continue;
                }
            };

            let decision = match result {
                Ok(d) => d,
                Err(e) => {
                    warn!(decision = %group.key, error = %e, "Vote failed");
                    let trail = self.make_trail(
                        &group,
                        &batch,
                        None,
                        Some(e.to_string()),
                        threshold,
                        snapshot.version,
                        StakeOutcome::NotAccepted,
                    );
                    self.submit(&mut report, trail);
                    report.invalid.push(e);
                    continue;
                }
            };

            self.book.rounds.mark_decided(group.key.clone());
            let stake = if decision.accept {
                info!(
                    round_id = %decision.round_id,
                    market = %decision.market,
                    pick = %decision.pick,
                    p_star = format!("{:.4}", decision.p_star),
                    threshold = format!("{:.4}", threshold),
                    tier = %decision.bucket_tier,
                    extreme = decision.extreme_gate_triggered,
                    "Decision accepted"
                );
                match self.sizer.size(&decision, self.book.bankroll, &self.book.ledger) {
                    Ok(instruction) => {
                        self.book.open(instruction.clone());
                        report.instructions.push(instruction.clone());
                        StakeOutcome::Placed(instruction)
                    }
                    Err(rejection) => {
                        report.rejections.push(rejection.clone());
                        StakeOutcome::Rejected(rejection)
                    }
                }
            } else {
                debug!(decision = %decision, "Decision rejected below threshold");
                StakeOutcome::NotAccepted
            };

            pending.push(PendingDecision {
                decision: decision.clone(),
                inputs: group.probabilities.clone(),
            });
            let trail = self.make_trail(
                &group,
                &batch,
                Some(decision),
                None,
                threshold,
                snapshot.version,
                stake,
            );
            self.submit(&mut report, trail);
        }

        for (group, e) in refused {
            warn!(decision = %group.key, error = %e, "Signals refused");
            let trail = self.make_trail(
                &group,
                &batch,
                None,
                Some(e.to_string()),
                threshold,
                snapshot.version,
                StakeOutcome::NotAccepted,
            );
            self.submit(&mut report, trail);
            report.invalid.push(e);
        }

        for key in orphaned {
            let e = ValidationError::NoValidSources(key.clone());
            debug!(decision = %key, "No valid sources");
            let group = SignalGroup {
                key,
                probabilities: BTreeMap::new(),
            };
            let trail = self.make_trail(
                &group,
                &batch,
                None,
                Some(e.to_string()),
                threshold,
                snapshot.version,
                StakeOutcome::NotAccepted,
            );
            self.submit(&mut report, trail);
            report.invalid.push(e);
        }

        // Step 3 – feed the controller
        if !pending.is_empty() {
            self.state.register(pending).await?;
            report.step = Some(self.state.step().await?);
        }

        info!(
            signals = signals.len(),
            dropped = batch.dropped.len(),
            decisions = report.trails.len(),
            accepted = report.accepted(),
            staked = report.instructions.len(),
            risk_rejected = report.rejections.len(),
            threshold = format!("{:.4}", self.state.snapshot().threshold()),
            "Batch processed"
        );

        Ok(report)
    }

    /// Settle a resolved round and feed the outcome back.
    pub async fn settle(&mut self, outcome: &RoundOutcome) -> Result<SettleReport, EngineError> {
        outcome.validate()?;
        let settlement = Accountant::settle(&mut self.book, outcome);
        let feedback = self.state.resolve(outcome.clone()).await?;
        Ok(SettleReport {
            settlement,
            feedback,
        })
    }

    /// Hot-reload parameters between rounds. An invalid config is rejected
    /// and the running one stays in place.
    ///
    /// A changed `sizing.bankroll` moves the live bankroll by the difference,
    /// as a deposit or withdrawal; realized P&L is kept.
    pub async fn apply_config(&mut self, config: &AppConfig) -> Result<(), EngineError> {
        config.validate()?;

        let delta = config.sizing.bankroll - self.sizer.config().bankroll;
        if !delta.is_zero() {
            self.book.adjust_bankroll(delta);
            info!(
                configured = %config.sizing.bankroll,
                delta = %delta,
                bankroll = %self.book.bankroll,
                "Bankroll adjusted"
            );
        }

        self.normalizer = SignalNormalizer::new(config.signals.clone());
        self.voter = Arc::new(EnsembleVoter::new(&config.voting));
        self.sizer = StakeSizer::new(config.sizing.clone())
            .with_calibrator(Calibrator::new(config.calibration));
        self.state
            .reconfigure(config.weights.clone(), config.controller.clone())
            .await?;

        info!(
            regime = %config.controller.regime,
            kelly_cap = config.sizing.kelly_cap,
            method = ?config.voting.method,
            "Configuration applied"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn make_trail(
        &self,
        group: &SignalGroup,
        batch: &NormalizedBatch,
        decision: Option<EnsembleDecision>,
        error: Option<String>,
        threshold_used: f64,
        state_version: u64,
        stake: StakeOutcome,
    ) -> DecisionTrail {
        let dropped = batch
            .dropped_for(&group.key)
            .into_iter()
            .map(|d| DroppedInput {
                source: d.signal.source.clone(),
                probability: d.signal.probability,
                reason: d.reason.to_string(),
            })
            .collect();

        DecisionTrail {
            decision_id: Uuid::new_v4(),
            created_at: Utc::now(),
            key: group.key.clone(),
            inputs: group.probabilities.clone(),
            dropped,
            decision,
            error,
            threshold_used,
            state_version,
            stake,
        }
    }

    fn submit(&self, report: &mut BatchReport, trail: DecisionTrail) {
        if let Some(writer) = &self.trail {
            writer.submit(trail.clone());
        }
        report.trails.push(trail);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
