//! Decision trail persistence.
//!
//! Trails are appended to a JSON-lines file by a background task. Submitting
//! never blocks the decision path: a full queue drops the trail with a
//! warning, and a failing store is retried with exponential backoff before
//! the trail is given up on.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::strategy::DecisionTrail;

/// Retries after the first failed attempt.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (ms).
const BASE_BACKOFF_MS: u64 = 100;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Sink for decision trails.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrailStore: Send + Sync {
    async fn append(&self, trail: &DecisionTrail) -> Result<()>;
}

/// Appends one JSON object per line.
pub struct JsonlTrailStore {
    path: PathBuf,
}

impl JsonlTrailStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TrailStore for JsonlTrailStore {
    async fn append(&self, trail: &DecisionTrail) -> Result<()> {
        let mut line = serde_json::to_string(trail).context("Failed to serialise decision trail")?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context(format!("Failed to open trail file {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .context(format!("Failed to append to {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

/// Read every trail from a JSON-lines file. Blank lines are skipped.
pub fn read_trails(path: &Path) -> Result<Vec<DecisionTrail>> {
    let text = std::fs::read_to_string(path)
        .context(format!("Failed to read trail file {}", path.display()))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, l)| {
            serde_json::from_str(l).context(format!("Bad trail on line {} of {}", i + 1, path.display()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Counters returned when the writer task finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrailStats {
    pub written: u64,
    pub failed: u64,
}

/// Handle for submitting trails to the background writer.
#[derive(Clone)]
pub struct TrailWriter {
    queue: mpsc::Sender<DecisionTrail>,
}

impl TrailWriter {
    pub fn spawn(store: Arc<dyn TrailStore>, capacity: usize) -> (Self, JoinHandle<TrailStats>) {
        Self::spawn_with_backoff(store, capacity, Duration::from_millis(BASE_BACKOFF_MS))
    }

    /// Spawn with a custom base backoff.
    pub fn spawn_with_backoff(
        store: Arc<dyn TrailStore>,
        capacity: usize,
        base_backoff: Duration,
    ) -> (Self, JoinHandle<TrailStats>) {
        let (queue, mut inbox) = mpsc::channel::<DecisionTrail>(capacity.max(1));

        let task = tokio::spawn(async move {
            let mut stats = TrailStats::default();
            while let Some(trail) = inbox.recv().await {
                match persist_with_retry(store.as_ref(), &trail, base_backoff).await {
                    Ok(()) => stats.written += 1,
                    Err(e) => {
                        stats.failed += 1;
                        error!(
                            decision_id = %trail.decision_id,
                            error = %e,
                            "Decision trail dropped after retries"
                        );
                    }
                }
            }
            debug!(written = stats.written, failed = stats.failed, "Trail writer stopped");
            stats
        });

        (Self { queue }, task)
    }

    /// Queue a trail without waiting. Returns false if it was dropped.
    pub fn submit(&self, trail: DecisionTrail) -> bool {
        match self.queue.try_send(trail) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(trail)) => {
                warn!(decision_id = %trail.decision_id, "Trail queue full, trail dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(trail)) => {
                warn!(decision_id = %trail.decision_id, "Trail writer closed, trail dropped");
                false
            }
        }
    }
}

async fn persist_with_retry(
    store: &dyn TrailStore,
    trail: &DecisionTrail,
    base_backoff: Duration,
) -> Result<()> {
    let mut last_error = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = base_backoff * 2u32.pow(attempt - 1);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                decision_id = %trail.decision_id,
                "Retrying trail write"
            );
            tokio::time::sleep(delay).await;
        }

        match store.append(trail).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "Trail write failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("trail write failed")))
        .context(format!("Trail write failed after {MAX_RETRIES} retries"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StakeOutcome;
    use crate::types::{DecisionKey, Market, Pick};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn make_trail(round: &str) -> DecisionTrail {
        DecisionTrail {
            decision_id: uuid::Uuid::new_v4(),
            created_at: Utc::now(),
            key: DecisionKey {
                round_id: round.to_string(),
                market: Market::OddEven,
                pick: Pick::Odd,
            },
            inputs: BTreeMap::from([("cloud".to_string(), 0.6)]),
            dropped: Vec::new(),
            decision: None,
            error: None,
            threshold_used: 0.55,
            state_version: 1,
            stake: StakeOutcome::NotAccepted,
        }
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("engine_test_trail_{}.jsonl", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_jsonl_append_and_read() {
        let path = temp_path();
        let store = JsonlTrailStore::new(&path);
        store.append(&make_trail("r1")).await.unwrap();
        store.append(&make_trail("r2")).await.unwrap();

        let trails = read_trails(&path).unwrap();
        assert_eq!(trails.len(), 2);
        assert_eq!(trails[1].key.round_id, "r2");
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut store = MockTrailStore::new();
        store.expect_append().times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow::anyhow!("disk busy"))
            } else {
                Ok(())
            }
        });

        let result = persist_with_retry(&store, &make_trail("r1"), Duration::from_millis(1)).await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mut store = MockTrailStore::new();
        store
            .expect_append()
            .times((MAX_RETRIES + 1) as usize)
            .returning(|_| Err(anyhow::anyhow!("read-only filesystem")));

        let result = persist_with_retry(&store, &make_trail("r1"), Duration::from_millis(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_writer_counts_outcomes() {
        let mut store = MockTrailStore::new();
        store
            .expect_append()
            .returning(|t| {
                if t.key.round_id == "bad" {
                    Err(anyhow::anyhow!("nope"))
                } else {
                    Ok(())
                }
            });

        let (writer, task) =
            TrailWriter::spawn_with_backoff(Arc::new(store), 8, Duration::from_millis(1));
        assert!(writer.submit(make_trail("r1")));
        assert!(writer.submit(make_trail("bad")));
        assert!(writer.submit(make_trail("r2")));
        drop(writer);

        let stats = task.await.unwrap();
        assert_eq!(stats, TrailStats { written: 2, failed: 1 });
    }

    #[tokio::test]
    async fn test_submit_after_close_is_dropped() {
        let store = MockTrailStore::new();
        let (writer, task) = TrailWriter::spawn(Arc::new(store), 1);
        task.abort();
        let _ = task.await;
        assert!(!writer.submit(make_trail("r1")));
    }
}
