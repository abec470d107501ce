//! Shared fixtures for the integration tests.

use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;

use ensemble_engine::config::AppConfig;
use ensemble_engine::engine::accountant::Book;
use ensemble_engine::engine::state::{FeedbackState, StateOwner};
use ensemble_engine::storage::trail::TrailWriter;
use ensemble_engine::strategy::DecisionOrchestrator;
use ensemble_engine::types::{Pick, SignalRecord};

pub fn make_signal(source: &str, round: &str, pick: Pick, p: f64, at: DateTime<Utc>) -> SignalRecord {
    SignalRecord {
        source: source.to_string(),
        round_id: round.to_string(),
        market: pick.market(),
        pick,
        probability: p,
        timestamp: at,
    }
}

/// Three sources with weights 0.4 / 0.3 / 0.3.
pub fn make_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.weights.initial = [("cloud", 0.4), ("map", 0.3), ("size", 0.3)]
        .into_iter()
        .map(|(s, w)| (s.to_string(), w))
        .collect();
    config
}

/// Every source gives `pick` the same probability, a few seconds ago.
pub fn make_round(round: &str, pick: Pick, p: f64) -> Vec<SignalRecord> {
    let at = Utc::now() - Duration::seconds(3);
    ["cloud", "map", "size"]
        .iter()
        .map(|s| make_signal(s, round, pick, p, at))
        .collect()
}

pub fn make_orchestrator(
    config: &AppConfig,
    book: Book,
    trail: Option<TrailWriter>,
) -> DecisionOrchestrator {
    let state = FeedbackState::new(&config.weights, config.controller.clone(), config.voting.accept_floor);
    let (handle, _owner) = StateOwner::spawn(state, config.engine.state_mailbox);
    DecisionOrchestrator::new(config, handle, book, trail)
}

pub fn temp_path(prefix: &str, ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}_{}.{ext}", uuid::Uuid::new_v4()))
}
