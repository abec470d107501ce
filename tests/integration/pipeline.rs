//! End-to-end decision flow: feed → decisions → trail → settlement →
//! persistence → restart.

use chrono::Utc;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio_test::assert_ok;

use ensemble_engine::engine::accountant::Book;
use ensemble_engine::engine::feed::FeedEvent;
use ensemble_engine::engine::state::{FeedbackState, ResolveStatus, StateOwner};
use ensemble_engine::storage::trail::{read_trails, JsonlTrailStore, TrailWriter};
use ensemble_engine::storage::{load_state, save_state};
use ensemble_engine::strategy::{DecisionOrchestrator, StakeOutcome};
use ensemble_engine::types::{Pick, RoundOutcome};

use crate::common::{make_config, make_orchestrator, make_round, make_signal, temp_path};

#[tokio::test]
async fn test_trails_written_for_every_decision() {
    let path = temp_path("engine_it_trail", "jsonl");
    let config = make_config();
    let store = Arc::new(JsonlTrailStore::new(&path));
    let (writer, task) = TrailWriter::spawn(store, 16);
    let mut orc = make_orchestrator(&config, Book::new(config.sizing.bankroll), Some(writer));

    let mut signals = make_round("r1", Pick::Odd, 0.62);
    // Every signal for this key is invalid, so it gets an error trail.
    signals.push(make_signal("cloud", "r1", Pick::Big, 1.7, Utc::now()));
    let report = assert_ok!(orc.process(&signals, Utc::now()).await);
    assert_eq!(report.trails.len(), 2);

    drop(orc);
    let stats = task.await.unwrap();
    assert_eq!(stats.written, 2);
    assert_eq!(stats.failed, 0);

    let trails = read_trails(&path).unwrap();
    assert_eq!(trails.len(), 2);
    let placed = trails.iter().find(|t| t.key.pick == Pick::Odd).unwrap();
    assert!(matches!(placed.stake, StakeOutcome::Placed(ref i) if i.stake_amount == dec!(5.00)));
    assert_eq!(placed.inputs.len(), 3);
    let orphan = trails.iter().find(|t| t.key.pick == Pick::Big).unwrap();
    assert!(orphan.decision.is_none());
    assert!(orphan.error.is_some());
    assert_eq!(orphan.dropped.len(), 1);

    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_feed_drives_decisions_and_settlement() {
    let config = make_config();
    let mut orc = make_orchestrator(&config, Book::new(config.sizing.bankroll), None);

    let batch = serde_json::to_string(&FeedEvent::Signals(make_round("r1", Pick::Big, 0.62))).unwrap();
    let feed = format!(
        "# one round\n{batch}\n\n{}\n{}\n",
        r#"{"outcome":{"round_id":"r1","total":9}}"#,
        r#"{"outcome":{"round_id":"r1","total":9}}"#,
    );

    let mut statuses = Vec::new();
    for line in feed.lines() {
        match FeedEvent::parse_line(line).unwrap() {
            Some(FeedEvent::Signals(signals)) => {
                let report = orc.process(&signals, Utc::now()).await.unwrap();
                assert_eq!(report.instructions.len(), 1);
            }
            Some(FeedEvent::Outcome(outcome)) => {
                statuses.push(orc.settle(&outcome).await.unwrap().feedback.status);
            }
            None => {}
        }
    }

    // Total 9 is small: the Big stake is lost, once.
    assert_eq!(statuses, vec![ResolveStatus::Applied, ResolveStatus::Duplicate]);
    assert_eq!(orc.book().bankroll, dec!(995.00));
    assert_eq!(orc.book().stakes_lost, 1);
    assert!(orc.state().snapshot().weights.weight_of("cloud") < 0.4);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let path = temp_path("engine_it_state", "json");
    let path_str = path.to_string_lossy().to_string();
    let config = make_config();

    let mut orc = make_orchestrator(&config, Book::new(config.sizing.bankroll), None);
    orc.process(&make_round("r1", Pick::Odd, 0.62), Utc::now()).await.unwrap();
    orc.settle(&RoundOutcome::new("r1", 21)).await.unwrap();
    // Left open across the restart.
    orc.process(&make_round("r2", Pick::Even, 0.62), Utc::now()).await.unwrap();

    let before = orc.persisted();
    save_state(&before, Some(&path_str)).unwrap();
    drop(orc);

    let saved = load_state(Some(&path_str)).unwrap().unwrap();
    assert_eq!(saved.snapshot, before.snapshot);
    assert_eq!(saved.book, before.book);

    let state = FeedbackState::restore(saved.snapshot.clone(), &config.weights, config.controller.clone());
    let (handle, _owner) = StateOwner::spawn(state, 16);
    let mut orc = DecisionOrchestrator::new(&config, handle, saved.book, None);
    assert_eq!(orc.state().snapshot().version, before.snapshot.version);
    assert_eq!(orc.state().snapshot().weights, before.snapshot.weights);
    assert_eq!(orc.book().open_exposure(), dec!(5.00));

    // Decided keys and settled rounds are restored with the book.
    let resent = orc.process(&make_round("r2", Pick::Even, 0.62), Utc::now()).await.unwrap();
    assert!(resent.instructions.is_empty());
    let late = orc.process(&make_round("r1", Pick::Big, 0.62), Utc::now()).await.unwrap();
    assert!(late.instructions.is_empty());
    assert_eq!(orc.book().open_exposure(), dec!(5.00));

    // The open r2 stake still settles after the restart.
    let settled = orc.settle(&RoundOutcome::new("r2", 10)).await.unwrap();
    assert_eq!(settled.settlement.pnl, dec!(4.90));
    assert_eq!(orc.book().bankroll, dec!(1009.80));
    // Pending decisions are not persisted, so the weights stay put.
    assert_eq!(settled.feedback.status, ResolveStatus::Unknown);

    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_exposure_never_exceeds_bankroll_cap() {
    let mut config = make_config();
    config.sizing.max_orders_per_round = 10;
    config.sizing.per_round_cap = dec!(1000);
    config.sizing.per_market_cap = dec!(1000);
    config.sizing.bankroll = dec!(100);
    let mut orc = make_orchestrator(&config, Book::new(config.sizing.bankroll), None);

    let mut rejected = 0;
    for i in 0..10 {
        let report = orc
            .process(&make_round(&format!("r{i}"), Pick::Odd, 0.70), Utc::now())
            .await
            .unwrap();
        rejected += report.rejections.len();
        assert!(orc.book().open_exposure() <= dec!(20.0));
    }
    // 7.50 per High-tier stake: two fit under 20.00, the rest are refused.
    assert_eq!(orc.book().open_exposure(), dec!(15.00));
    assert_eq!(rejected, 8);
}
