//! Single-writer owner of the adaptive state.
//!
//! `FeedbackState` holds the weights, the acceptance controller and the
//! decisions awaiting an outcome. `StateOwner` runs it as a tokio task fed by
//! an mpsc mailbox and publishes an immutable, versioned [`EngineSnapshot`]
//! after every applied write. Readers take snapshots without waiting on the
//! writer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::strategy::controller::{AcceptanceController, ControllerConfig, ControllerState, StepReport};
use crate::strategy::weights::{WeightAdapter, WeightConfig, WeightState};
use crate::types::{EngineError, EnsembleDecision, Regime, RoundOutcome};

/// Rounds kept waiting for an outcome before the oldest is abandoned.
pub const MAX_PENDING_ROUNDS: usize = 1024;

/// Resolved round ids remembered for duplicate detection.
const RESOLVED_MEMORY: usize = 1024;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable view of the adaptive state at one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u64,
    pub weights: WeightState,
    pub controller: ControllerState,
}

impl EngineSnapshot {
    pub fn threshold(&self) -> f64 {
        self.controller.current_threshold
    }
}

// ---------------------------------------------------------------------------
// Feedback bookkeeping
// ---------------------------------------------------------------------------

/// An evaluated decision waiting for its round to resolve.
#[derive(Debug, Clone)]
pub struct PendingDecision {
    pub decision: EnsembleDecision,
    /// Source → probability given for the pick.
    pub inputs: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolveStatus {
    Applied,
    /// The round was already resolved; nothing changed.
    Duplicate,
    /// No decisions were registered for the round.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolveReport {
    pub round_id: String,
    pub status: ResolveStatus,
    pub decisions: usize,
    pub accepted: usize,
    pub wins: usize,
    pub weight_updates: usize,
}

/// Synchronous core of the state owner.
pub struct FeedbackState {
    weights: WeightState,
    adapter: WeightAdapter,
    controller: AcceptanceController,
    pending: BTreeMap<String, Vec<PendingDecision>>,
    pending_order: VecDeque<String>,
    resolved: VecDeque<String>,
    version: u64,
}

impl FeedbackState {
    pub fn new(weights: &WeightConfig, controller: ControllerConfig, accept_floor: f64) -> Self {
        Self {
            weights: WeightState::from_config(weights),
            adapter: WeightAdapter::new(weights),
            controller: AcceptanceController::new(controller, accept_floor),
            pending: BTreeMap::new(),
            pending_order: VecDeque::new(),
            resolved: VecDeque::new(),
            version: 0,
        }
    }

    /// Resume from a persisted snapshot under the current configuration.
    pub fn restore(
        snapshot: EngineSnapshot,
        weights: &WeightConfig,
        controller: ControllerConfig,
    ) -> Self {
        let mut state = snapshot.weights;
        state.rebound(weights);
        Self {
            weights: state,
            adapter: WeightAdapter::new(weights),
            controller: AcceptanceController::restore(controller, snapshot.controller),
            pending: BTreeMap::new(),
            pending_order: VecDeque::new(),
            resolved: VecDeque::new(),
            version: snapshot.version,
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            version: self.version,
            weights: self.weights.clone(),
            controller: self.controller.state().clone(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn pending_rounds(&self) -> usize {
        self.pending.len()
    }

    /// Record evaluated decisions: coverage samples now, feedback later.
    /// Returns how many were registered.
    pub fn register(&mut self, decisions: Vec<PendingDecision>) -> usize {
        let mut registered = 0;
        for pending in decisions {
            let round_id = pending.decision.round_id.clone();
            if self.resolved.contains(&round_id) {
                warn!(round_id = %round_id, "Decision for an already resolved round ignored");
                continue;
            }

            self.controller.record_evaluation(pending.decision.accept);

            if !self.pending.contains_key(&round_id) {
                self.pending_order.push_back(round_id.clone());
            }
            self.pending.entry(round_id).or_default().push(pending);
            registered += 1;
        }

        while self.pending_order.len() > MAX_PENDING_ROUNDS {
            if let Some(oldest) = self.pending_order.pop_front() {
                let dropped = self.pending.remove(&oldest).map(|v| v.len()).unwrap_or(0);
                warn!(round_id = %oldest, decisions = dropped, "Abandoning unresolved round");
            }
        }

        if registered > 0 {
            self.version += 1;
        }
        registered
    }

    /// Run one controller cycle.
    pub fn step(&mut self) -> StepReport {
        let report = self.controller.step();
        self.version += 1;
        report
    }

    /// Apply a round's outcome. Each round is applied at most once.
    pub fn resolve(&mut self, outcome: &RoundOutcome) -> ResolveReport {
        let mut report = ResolveReport {
            round_id: outcome.round_id.clone(),
            status: ResolveStatus::Applied,
            decisions: 0,
            accepted: 0,
            wins: 0,
            weight_updates: 0,
        };

        if self.resolved.contains(&outcome.round_id) {
            debug!(round_id = %outcome.round_id, "Duplicate outcome ignored");
            report.status = ResolveStatus::Duplicate;
            return report;
        }

        self.resolved.push_back(outcome.round_id.clone());
        while self.resolved.len() > RESOLVED_MEMORY {
            self.resolved.pop_front();
        }

        let Some(decisions) = self.pending.remove(&outcome.round_id) else {
            debug!(round_id = %outcome.round_id, "Outcome for a round with no decisions");
            report.status = ResolveStatus::Unknown;
            return report;
        };
        self.pending_order.retain(|r| r != &outcome.round_id);

        for pending in &decisions {
            let won = outcome.pick_won(pending.decision.pick);
            report.decisions += 1;
            report.weight_updates += self.adapter.apply(&mut self.weights, &pending.inputs, won).len();
            if pending.decision.accept {
                self.controller.record_resolution(won);
                report.accepted += 1;
                if won {
                    report.wins += 1;
                }
            }
        }

        self.version += 1;
        info!(
            round_id = %outcome.round_id,
            total = outcome.total,
            decisions = report.decisions,
            accepted = report.accepted,
            wins = report.wins,
            version = self.version,
            "Round resolved"
        );
        report
    }

    pub fn set_regime(&mut self, regime: Regime) {
        self.controller.set_regime(regime);
        self.version += 1;
    }

    /// Hot reload. Learned weights and the current threshold survive.
    pub fn reconfigure(&mut self, weights: &WeightConfig, controller: ControllerConfig) {
        self.weights.rebound(weights);
        self.adapter = WeightAdapter::new(weights);
        self.controller.reconfigure(controller);
        self.version += 1;
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum StateCommand {
    Register {
        decisions: Vec<PendingDecision>,
        reply: oneshot::Sender<usize>,
    },
    Step {
        reply: oneshot::Sender<StepReport>,
    },
    Resolve {
        outcome: RoundOutcome,
        reply: oneshot::Sender<ResolveReport>,
    },
    SetRegime {
        regime: Regime,
        reply: oneshot::Sender<()>,
    },
    Reconfigure {
        weights: WeightConfig,
        controller: ControllerConfig,
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the state owner task.
#[derive(Clone)]
pub struct StateHandle {
    commands: mpsc::Sender<StateCommand>,
    snapshots: watch::Receiver<Arc<EngineSnapshot>>,
}

impl StateHandle {
    /// Latest published snapshot. Never waits on the writer.
    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.snapshots.borrow().clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> StateCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| EngineError::StateClosed)?;
        rx.await.map_err(|_| EngineError::StateClosed)
    }

    pub async fn register(&self, decisions: Vec<PendingDecision>) -> Result<usize, EngineError> {
        self.request(|reply| StateCommand::Register { decisions, reply }).await
    }

    pub async fn step(&self) -> Result<StepReport, EngineError> {
        self.request(|reply| StateCommand::Step { reply }).await
    }

    pub async fn resolve(&self, outcome: RoundOutcome) -> Result<ResolveReport, EngineError> {
        self.request(|reply| StateCommand::Resolve { outcome, reply }).await
    }

    pub async fn set_regime(&self, regime: Regime) -> Result<(), EngineError> {
        self.request(|reply| StateCommand::SetRegime { regime, reply }).await
    }

    pub async fn reconfigure(
        &self,
        weights: WeightConfig,
        controller: ControllerConfig,
    ) -> Result<(), EngineError> {
        self.request(|reply| StateCommand::Reconfigure {
            weights,
            controller,
            reply,
        })
        .await
    }
}

pub struct StateOwner;

impl StateOwner {
    /// Spawn the owner task. It runs until every handle is dropped and then
    /// returns the final state.
    pub fn spawn(state: FeedbackState, mailbox: usize) -> (StateHandle, JoinHandle<FeedbackState>) {
        let (commands, mut inbox) = mpsc::channel(mailbox.max(1));
        let (publisher, snapshots) = watch::channel(Arc::new(state.snapshot()));

        let task = tokio::spawn(async move {
            let mut state = state;
            while let Some(command) = inbox.recv().await {
                match command {
                    StateCommand::Register { decisions, reply } => {
                        let _ = reply.send(state.register(decisions));
                    }
                    StateCommand::Step { reply } => {
                        let _ = reply.send(state.step());
                    }
                    StateCommand::Resolve { outcome, reply } => {
                        let _ = reply.send(state.resolve(&outcome));
                    }
                    StateCommand::SetRegime { regime, reply } => {
                        state.set_regime(regime);
                        let _ = reply.send(());
                    }
                    StateCommand::Reconfigure {
                        weights,
                        controller,
                        reply,
                    } => {
                        state.reconfigure(&weights, controller);
                        let _ = reply.send(());
                    }
                }
                let published = publisher.borrow().version;
                if published != state.version() {
                    publisher.send_replace(Arc::new(state.snapshot()));
                }
            }
            debug!(version = state.version(), "State owner stopped");
            state
        });

        (StateHandle { commands, snapshots }, task)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::controller::StepStatus;
    use crate::types::{BucketTier, Pick};

    fn make_pending(round: &str, pick: Pick, accept: bool, inputs: &[(&str, f64)]) -> PendingDecision {
        PendingDecision {
            decision: EnsembleDecision {
                round_id: round.to_string(),
                market: pick.market(),
                pick,
                p_star: 0.6,
                bucket_tier: BucketTier::Mid,
                accept,
                extreme_gate_triggered: false,
                weight_snapshot: BTreeMap::new(),
            },
            inputs: inputs.iter().map(|(s, p)| (s.to_string(), *p)).collect(),
        }
    }

    fn make_state() -> FeedbackState {
        FeedbackState::new(
            &WeightConfig::default(),
            ControllerConfig {
                min_samples: 2,
                ..ControllerConfig::default()
            },
            0.55,
        )
    }

    #[test]
    fn test_resolution_applied_once() {
        let mut state = make_state();
        state.register(vec![make_pending("r1", Pick::Odd, true, &[("cloud", 0.7), ("map", 0.6)])]);
        let before = state.snapshot().weights.weight_of("cloud");

        let report = state.resolve(&RoundOutcome::new("r1", 15));
        assert_eq!(report.status, ResolveStatus::Applied);
        assert_eq!(report.wins, 1);
        assert_eq!(report.weight_updates, 2);
        let after = state.snapshot().weights.weight_of("cloud");
        assert!(after > before);

        let again = state.resolve(&RoundOutcome::new("r1", 15));
        assert_eq!(again.status, ResolveStatus::Duplicate);
        assert_eq!(state.snapshot().weights.weight_of("cloud"), after);
        assert_eq!(state.snapshot().controller.resolved_samples(), 1);
    }

    #[test]
    fn test_out_of_order_resolution() {
        let mut state = make_state();
        state.register(vec![
            make_pending("r1", Pick::Odd, true, &[("cloud", 0.7)]),
            make_pending("r2", Pick::Big, true, &[("map", 0.7)]),
        ]);
        assert_eq!(state.pending_rounds(), 2);
        assert_eq!(state.resolve(&RoundOutcome::new("r2", 20)).wins, 1);
        assert_eq!(state.resolve(&RoundOutcome::new("r1", 20)).wins, 0);
        assert_eq!(state.pending_rounds(), 0);
    }

    #[test]
    fn test_unknown_round_outcome() {
        let mut state = make_state();
        let version = state.version();
        let report = state.resolve(&RoundOutcome::new("nope", 3));
        assert_eq!(report.status, ResolveStatus::Unknown);
        assert_eq!(state.version(), version);
    }

    #[test]
    fn test_late_registration_ignored() {
        let mut state = make_state();
        state.resolve(&RoundOutcome::new("r1", 3));
        let n = state.register(vec![make_pending("r1", Pick::Odd, true, &[("cloud", 0.7)])]);
        assert_eq!(n, 0);
        assert_eq!(state.pending_rounds(), 0);
    }

    #[test]
    fn test_rejected_decisions_feed_weights_not_accuracy() {
        let mut state = make_state();
        state.register(vec![make_pending("r1", Pick::Odd, false, &[("cloud", 0.3)])]);
        let report = state.resolve(&RoundOutcome::new("r1", 4));
        assert_eq!(report.accepted, 0);
        assert_eq!(report.weight_updates, 1);
        assert_eq!(state.snapshot().controller.realized_accuracy, None);
    }

    #[test]
    fn test_missing_outcomes_bounded() {
        let mut state = make_state();
        for i in 0..(MAX_PENDING_ROUNDS + 10) {
            state.register(vec![make_pending(&format!("r{i}"), Pick::Odd, true, &[("cloud", 0.6)])]);
        }
        assert_eq!(state.pending_rounds(), MAX_PENDING_ROUNDS);
        assert_eq!(state.resolve(&RoundOutcome::new("r0", 1)).status, ResolveStatus::Unknown);
    }

    #[test]
    fn test_restore_keeps_version_and_weights() {
        let mut state = make_state();
        state.register(vec![make_pending("r1", Pick::Odd, true, &[("cloud", 0.9)])]);
        state.resolve(&RoundOutcome::new("r1", 1));
        let snap = state.snapshot();

        let restored = FeedbackState::restore(snap.clone(), &WeightConfig::default(), ControllerConfig::default());
        assert_eq!(restored.snapshot(), snap);
    }

    #[tokio::test]
    async fn test_actor_publishes_versioned_snapshots() {
        let (handle, task) = StateOwner::spawn(make_state(), 16);
        let v0 = handle.snapshot().version;

        handle
            .register(vec![
                make_pending("r1", Pick::Odd, false, &[("cloud", 0.7)]),
                make_pending("r1", Pick::Big, false, &[("map", 0.4)]),
            ])
            .await
            .unwrap();
        let report = handle.step().await.unwrap();
        assert_eq!(report.status, StepStatus::Adjusted);

        let snap = handle.snapshot();
        assert!(snap.version > v0);
        assert_eq!(snap.controller.evaluated_samples(), 2);

        let resolved = handle.resolve(RoundOutcome::new("r1", 15)).await.unwrap();
        assert_eq!(resolved.decisions, 2);
        assert!(handle.snapshot().version > snap.version);

        drop(handle);
        let final_state = task.await.unwrap();
        assert_eq!(final_state.pending_rounds(), 0);
    }

    #[tokio::test]
    async fn test_old_snapshot_is_immutable() {
        let (handle, _task) = StateOwner::spawn(make_state(), 16);
        let old = handle.snapshot();
        handle.set_regime(Regime::Aggressive).await.unwrap();
        assert_eq!(old.controller.regime, Regime::Balanced);
        assert_eq!(handle.snapshot().controller.regime, Regime::Aggressive);
    }

    #[tokio::test]
    async fn test_closed_owner_reports_error() {
        let (handle, task) = StateOwner::spawn(make_state(), 4);
        task.abort();
        let _ = task.await;
        assert!(matches!(handle.step().await, Err(EngineError::StateClosed)));
    }
}
