//! ENSEMBLE — adaptive multi-source decision engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores state from disk (or creates fresh), and drives the engine from a
//! JSON-lines event feed with graceful shutdown.
//!
//! ```text
//! ensemble_engine [FEED]                 # feed file, or stdin when omitted
//! ensemble_engine replay <ROUNDS>        # offline replay of historical rounds
//! ```
//!
//! Stake instructions are written to stdout as JSON lines. Logs go to stderr.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};

use ensemble_engine::backtest::runner::{HistoricalRound, ReplayRunner};
use ensemble_engine::config::{AppConfig, ConfigWatcher};
use ensemble_engine::engine::accountant::Book;
use ensemble_engine::engine::feed::{feed_time, FeedEvent};
use ensemble_engine::engine::state::{FeedbackState, StateOwner};
use ensemble_engine::storage;
use ensemble_engine::storage::trail::{JsonlTrailStore, TrailWriter};
use ensemble_engine::strategy::DecisionOrchestrator;
use ensemble_engine::types::EngineError;

const BANNER: &str = r#"
  _____ _   _ ____  _____ __  __ ____  _     _____
 | ____| \ | / ___|| ____|  \/  | __ )| |   | ____|
 |  _| |  \| \___ \|  _| | |\/| |  _ \| |   |  _|
 | |___| |\  |___) | |___| |  | | |_) | |___| |___
 |_____|_| \_|____/|_____|_|  |_|____/|_____|_____|

  Adaptive ensemble voting with Kelly stake sizing
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = AppConfig::resolve_path();
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    eprintln!("{BANNER}");
    info!(
        engine = %cfg.engine.name,
        config = %config_path,
        regime = %cfg.controller.regime,
        bankroll = %cfg.sizing.bankroll,
        kelly_cap = cfg.sizing.kelly_cap,
        "ENSEMBLE starting up"
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("replay") => {
            let path = args
                .get(1)
                .context("Usage: ensemble_engine replay <rounds.jsonl>")?;
            run_replay(cfg, path).await
        }
        feed => run_feed(cfg, &config_path, feed).await,
    }
}

/// Process a live (or recorded) event feed until it ends or Ctrl+C.
async fn run_feed(cfg: AppConfig, config_path: &str, feed: Option<&str>) -> Result<()> {
    let state_file = cfg.engine.state_file.clone();

    // -- Restore or create state -----------------------------------------

    let (feedback, book) = match storage::load_state(Some(&state_file))? {
        Some(saved) => {
            info!(
                version = saved.snapshot.version,
                threshold = format!("{:.4}", saved.snapshot.threshold()),
                bankroll = %saved.book.bankroll,
                open_exposure = %saved.book.open_exposure(),
                "Resumed from saved state"
            );
            let state = FeedbackState::restore(saved.snapshot, &cfg.weights, cfg.controller.clone());
            (state, saved.book)
        }
        None => {
            info!(bankroll = %cfg.sizing.bankroll, "Fresh start");
            let state = FeedbackState::new(&cfg.weights, cfg.controller.clone(), cfg.voting.accept_floor);
            (state, Book::new(cfg.sizing.bankroll))
        }
    };

    // -- Initialise components -------------------------------------------

    let (state, owner) = StateOwner::spawn(feedback, cfg.engine.state_mailbox);
    let store = Arc::new(JsonlTrailStore::new(&cfg.engine.trail_file));
    let (trail, trail_task) = TrailWriter::spawn(store, cfg.engine.trail_queue);
    let mut orchestrator = DecisionOrchestrator::new(&cfg, state, book, Some(trail));
    let mut use_feed_time = cfg.engine.use_feed_time;

    let debounce = Duration::from_millis(cfg.engine.reload_debounce_ms);
    let (_watcher, mut config_rx) = match ConfigWatcher::spawn(config_path, cfg.clone(), debounce) {
        Ok((watcher, rx)) => (Some(watcher), Some(rx)),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "Hot reload disabled");
            (None, None)
        }
    };

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match feed {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open feed {path}"))?;
            info!(path, "Reading feed file");
            Box::new(BufReader::new(file))
        }
        None => {
            info!("Reading feed from stdin");
            Box::new(BufReader::new(tokio::io::stdin()))
        }
    };
    let mut lines = reader.lines();

    // -- Main loop -------------------------------------------------------

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut line_no = 0usize;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read feed")? else {
                    info!(lines = line_no, "Feed exhausted");
                    break;
                };
                line_no += 1;

                let event = match FeedEvent::parse_line(&line) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(line = line_no, error = %format!("{e:#}"), "Skipping feed line");
                        continue;
                    }
                };

                handle_event(&mut orchestrator, event, use_feed_time, &state_file).await?;
            }
            // Select arms run one at a time, so a reload lands between events.
            alive = config_changed(&mut config_rx) => {
                if !alive {
                    warn!("Config watcher stopped; hot reload disabled");
                    config_rx = None;
                    continue;
                }
                let Some(next) = config_rx.as_mut().map(|rx| rx.borrow_and_update().clone()) else {
                    continue;
                };
                match orchestrator.apply_config(&next).await {
                    Ok(()) => use_feed_time = next.engine.use_feed_time,
                    Err(EngineError::StateClosed) => return Err(EngineError::StateClosed.into()),
                    Err(e) => warn!(error = %e, "Configuration change not applied"),
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    // Save final state
    storage::save_state(&orchestrator.persisted(), Some(&state_file))?;
    let snapshot = orchestrator.state().snapshot();
    let book = orchestrator.book().clone();
    drop(orchestrator);

    let trail_stats = trail_task.await.context("Trail writer panicked")?;
    let _ = owner.await;

    info!(
        bankroll = %book.bankroll,
        pnl = %book.realized_pnl,
        open_exposure = %book.open_exposure(),
        open_rounds = book.ledger.open_rounds(),
        win_rate = format!("{:.1}%", book.win_rate() * 100.0),
        threshold = format!("{:.4}", snapshot.threshold()),
        version = snapshot.version,
        trails_written = trail_stats.written,
        trails_failed = trail_stats.failed,
        "ENSEMBLE shut down cleanly."
    );

    Ok(())
}

/// Resolves when the watcher publishes a config (`true`) or stops (`false`).
/// Never resolves once hot reload is disabled.
async fn config_changed(rx: &mut Option<watch::Receiver<AppConfig>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

/// Apply one feed event. Only a dead state owner or an unwritable stdout is
/// fatal; bad events are logged and skipped.
async fn handle_event(
    orchestrator: &mut DecisionOrchestrator,
    event: FeedEvent,
    use_feed_time: bool,
    state_file: &str,
) -> Result<()> {
    match event {
        FeedEvent::Signals(signals) => {
            let now = if use_feed_time {
                feed_time(&signals).unwrap_or_else(Utc::now)
            } else {
                Utc::now()
            };
            let report = match orchestrator.process(&signals, now).await {
                Ok(report) => report,
                Err(EngineError::StateClosed) => return Err(EngineError::StateClosed.into()),
                Err(e) => {
                    error!(error = %e, "Batch failed");
                    return Ok(());
                }
            };
            for instruction in &report.instructions {
                println!(
                    "{}",
                    serde_json::to_string(instruction).context("Failed to serialise stake instruction")?
                );
            }
        }
        FeedEvent::Outcome(outcome) => {
            match orchestrator.settle(&outcome).await {
                Ok(settled) => {
                    info!(
                        round_id = %outcome.round_id,
                        total = outcome.total,
                        pnl = %settled.settlement.pnl,
                        feedback = ?settled.feedback.status,
                        weight_updates = settled.feedback.weight_updates,
                        "Outcome applied"
                    );
                    if let Err(e) = storage::save_state(&orchestrator.persisted(), Some(state_file)) {
                        error!(error = %format!("{e:#}"), "Failed to save state");
                    }
                }
                Err(EngineError::StateClosed) => return Err(EngineError::StateClosed.into()),
                Err(e) => warn!(round_id = %outcome.round_id, error = %e, "Outcome rejected"),
            }
        }
    }
    Ok(())
}

/// Replay historical rounds (one JSON object per line) and print the report.
async fn run_replay(cfg: AppConfig, path: &str) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rounds from {path}"))?;
    let rounds = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str::<HistoricalRound>(l)
                .with_context(|| format!("Bad round on line {} of {path}", i + 1))
        })
        .collect::<Result<Vec<_>>>()?;

    info!(rounds = rounds.len(), path, "Starting replay");
    let report = ReplayRunner::new(cfg).run(&rounds).await?;

    eprintln!("{}", report.calibration);
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialise replay report")?
    );
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ensemble_engine=info"));

    let json_logging = std::env::var("ENGINE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
