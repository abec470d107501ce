//! Historical replay: the adaptive loop over many rounds.

use chrono::{DateTime, Duration, Utc};

use ensemble_engine::backtest::runner::{HistoricalRound, ReplayRunner};
use ensemble_engine::strategy::weights::RewardKind;
use ensemble_engine::types::{Pick, Regime};

use crate::common::{make_config, make_signal};

fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Rounds one minute apart where every source gives Odd probability `p`.
fn make_rounds(n: usize, p: f64, total: u32) -> Vec<HistoricalRound> {
    (0..n)
        .map(|i| {
            let at = start() + Duration::minutes(i as i64);
            let id = format!("R{i:04}");
            HistoricalRound {
                signals: ["cloud", "map", "size"]
                    .iter()
                    .map(|s| make_signal(s, &id, Pick::Odd, p, at))
                    .collect(),
                round_id: id,
                total,
                decided_at: None,
            }
        })
        .collect()
}

#[tokio::test]
async fn test_threshold_rises_while_coverage_exceeds_target() {
    let mut config = make_config();
    config.controller.min_samples = 1;

    let report = ReplayRunner::new(config.clone())
        .run(&make_rounds(5, 0.70, 7))
        .await
        .unwrap();

    // Everything is accepted and wins, so coverage sits at 1.0 > 0.5.
    assert_eq!(report.coverage, 1.0);
    assert_eq!(report.accuracy, 1.0);
    let thresholds: Vec<f64> = report.threshold_history.iter().map(|(_, t)| *t).collect();
    assert_eq!(thresholds.len(), 5);
    assert!(thresholds[0] > config.voting.accept_floor);
    assert!(thresholds.windows(2).all(|w| w[1] > w[0]), "{thresholds:?}");
}

#[tokio::test]
async fn test_threshold_stays_within_bounds() {
    let mut config = make_config();
    config.controller.min_samples = 1;
    config.controller.regime = Regime::Aggressive;

    let report = ReplayRunner::new(config.clone())
        .run(&make_rounds(60, 0.70, 7))
        .await
        .unwrap();

    let bounds = config.controller.bounds;
    assert!(report
        .threshold_history
        .iter()
        .all(|(_, t)| *t >= bounds.min && *t <= bounds.max));
    // Once the threshold passes 0.70 nothing more is accepted.
    assert!(report.accepted < report.decisions);
}

#[tokio::test]
async fn test_losing_sources_pinned_at_floor() {
    let mut config = make_config();
    config.weights.eta = 0.5;
    config.weights.reward = RewardKind::Directional;

    // Odd is favoured every round but the total is always even.
    let report = ReplayRunner::new(config.clone())
        .run(&make_rounds(10, 0.62, 12))
        .await
        .unwrap();

    for weight in report.final_weights.values() {
        assert_eq!(*weight, config.weights.floor);
    }
    assert_eq!(report.accuracy, 0.0);
    assert!(report.total_pnl < rust_decimal::Decimal::ZERO);
    assert!(report.calibration.brier > 0.25);
}

#[tokio::test]
async fn test_replay_is_deterministic() {
    let config = make_config();
    let mut rounds = make_rounds(8, 0.64, 3);
    for (i, round) in rounds.iter_mut().enumerate() {
        round.total = if i % 3 == 0 { 4 } else { 17 };
    }

    let a = ReplayRunner::new(config.clone()).run(&rounds).await.unwrap();
    let b = ReplayRunner::new(config).run(&rounds).await.unwrap();
    assert_eq!(a.final_bankroll, b.final_bankroll);
    assert_eq!(a.final_weights, b.final_weights);
    assert_eq!(a.threshold_history, b.threshold_history);
    assert_eq!(a.accepted_wins, 5);
}
