//! JSON-lines event feed.
//!
//! Each line is either `{"signals": [SignalRecord, ...]}` or
//! `{"outcome": RoundOutcome}`. Blank lines and `#` comments are skipped.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RoundOutcome, SignalRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedEvent {
    /// A batch of signals to decide on.
    Signals(Vec<SignalRecord>),
    /// A resolved round.
    Outcome(RoundOutcome),
}

impl FeedEvent {
    /// Parse one feed line. `Ok(None)` for lines carrying no event.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }
        let event = serde_json::from_str(trimmed).context("Malformed feed event")?;
        Ok(Some(event))
    }
}

/// Newest signal timestamp in a batch, used as the evaluation time when
/// replaying a recorded feed.
pub fn feed_time(signals: &[SignalRecord]) -> Option<DateTime<Utc>> {
    signals.iter().map(|s| s.timestamp).max()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Market, Pick};

    #[test]
    fn test_parse_signals() {
        let line = r#"{"signals":[{"source":"cloud","round_id":"r1","market":"oe","pick":"odd","probability":0.62,"timestamp":"2026-01-01T00:00:00Z"}]}"#;
        let event = FeedEvent::parse_line(line).unwrap().unwrap();
        match event {
            FeedEvent::Signals(signals) => {
                assert_eq!(signals.len(), 1);
                assert_eq!(signals[0].market, Market::OddEven);
                assert_eq!(signals[0].pick, Pick::Odd);
                assert_eq!(feed_time(&signals), Some(signals[0].timestamp));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_outcome_without_timestamp() {
        let event = FeedEvent::parse_line(r#"{"outcome":{"round_id":"r1","total":15}}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(event, FeedEvent::Outcome(ref o) if o.round_id == "r1" && o.total == 15));
    }

    #[test]
    fn test_blank_and_comment_lines_skipped() {
        assert!(FeedEvent::parse_line("   ").unwrap().is_none());
        assert!(FeedEvent::parse_line("# round 1").unwrap().is_none());
    }

    #[test]
    fn test_malformed_line_errors() {
        assert!(FeedEvent::parse_line(r#"{"bet": 1}"#).is_err());
        assert!(FeedEvent::parse_line("not json").is_err());
    }

    #[test]
    fn test_feed_time_empty() {
        assert!(feed_time(&[]).is_none());
    }
}
