//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section falls back to its defaults, so a partial file is valid.
//! [`ConfigWatcher`] follows the file with `notify` and hands changed configs
//! to the engine, which applies them between events.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::strategy::calibrator::CalibrationConfig;
use crate::strategy::controller::ControllerConfig;
use crate::strategy::ensemble::VotingConfig;
use crate::strategy::kelly::SizingConfig;
use crate::strategy::normalizer::NormalizerConfig;
use crate::strategy::weights::WeightConfig;
use crate::types::ConfigError;

/// Default config file path.
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub signals: NormalizerConfig,
    pub voting: VotingConfig,
    pub weights: WeightConfig,
    pub controller: ControllerConfig,
    pub sizing: SizingConfig,
    pub calibration: CalibrationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    pub state_file: String,
    pub trail_file: String,
    /// Trails buffered for the background writer before new ones are dropped.
    pub trail_queue: usize,
    /// Commands buffered for the state owner.
    pub state_mailbox: usize,
    /// Evaluate each signal batch at its newest signal timestamp instead of
    /// the wall clock. For recorded feeds.
    pub use_feed_time: bool,
    /// Quiet period after a config file event before the file is re-read.
    pub reload_debounce_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "ENSEMBLE-001".to_string(),
            state_file: "engine_state.json".to_string(),
            trail_file: "decision_trail.jsonl".to_string(),
            trail_queue: 1024,
            state_mailbox: 256,
            use_feed_time: false,
            reload_debounce_ms: 500,
        }
    }
}

impl AppConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to load config file: {path}"))?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section. Any error here is fatal at startup and rejects a
    /// hot reload.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.trail_queue == 0 {
            return Err(ConfigError::NonPositive {
                name: "engine.trail_queue".into(),
                value: "0".into(),
            });
        }
        if self.engine.state_mailbox == 0 {
            return Err(ConfigError::NonPositive {
                name: "engine.state_mailbox".into(),
                value: "0".into(),
            });
        }
        self.signals.validate()?;
        self.voting.validate()?;
        self.weights.validate()?;
        self.controller.validate()?;
        self.sizing.validate()?;
        self.calibration.validate()?;
        Ok(())
    }

    /// Resolve the config path: `ENGINE_CONFIG` if set, else the default.
    pub fn resolve_path() -> String {
        std::env::var("ENGINE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string())
    }
}

// ---------------------------------------------------------------------------
// Hot reload
// ---------------------------------------------------------------------------

/// Watches the config file and publishes every changed, valid config on a
/// `watch` channel. Dropping the watcher stops the reload task.
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    _task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `path`. `current` seeds the channel and is not
    /// reported as a change. File events are coalesced over `debounce`
    /// before the file is re-read.
    pub fn spawn(
        path: impl Into<PathBuf>,
        current: AppConfig,
        debounce: Duration,
    ) -> Result<(Self, watch::Receiver<AppConfig>)> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(OsStr::to_os_string)
            .with_context(|| format!("Config path has no file name: {}", path.display()))?;
        // The directory is watched: editors often replace the file instead
        // of writing it in place.
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                    && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                if relevant {
                    let _ = events_tx.send(());
                }
            }
            Err(e) => warn!(error = %e, "Config watch error"),
        })
        .context("Failed to create config watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;

        let last = fs::read_to_string(&path).ok();
        let (publisher, receiver) = watch::channel(current);
        let task = tokio::spawn(reload_loop(path.clone(), last, debounce, events_rx, publisher));
        info!(path = %path.display(), "Watching configuration for changes");

        Ok((
            Self {
                path,
                _watcher: watcher,
                _task: task,
            },
            receiver,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn reload_loop(
    path: PathBuf,
    mut last: Option<String>,
    debounce: Duration,
    mut events: mpsc::UnboundedReceiver<()>,
    publisher: watch::Sender<AppConfig>,
) {
    while events.recv().await.is_some() {
        tokio::time::sleep(debounce).await;
        while events.try_recv().is_ok() {}

        if let Some(config) = reload(&path, &mut last) {
            if publisher.send(config).is_err() {
                break;
            }
        }
    }
    debug!(path = %path.display(), "Config watcher stopped");
}

/// Re-read the file. Yields a config only when the contents differ from the
/// last read and validate. A rejected change is reported once.
fn reload(path: &Path, last: &mut Option<String>) -> Option<AppConfig> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Config file unreadable");
            return None;
        }
    };
    if last.as_deref() == Some(contents.as_str()) {
        return None;
    }
    *last = Some(contents.clone());

    match AppConfig::from_toml(&contents) {
        Ok(config) => {
            info!(path = %path.display(), "Configuration change detected");
            Some(config)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %format!("{e:#}"), "Changed configuration rejected");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
