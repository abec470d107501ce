//! Source calibration.
//!
//! Scores how well each source's probabilities matched the realized draws:
//! Brier score per source, a reliability curve over ten probability bins and
//! a coarse over/under-confidence verdict.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Bins in the reliability curve.
const NUM_BINS: usize = 10;

/// Forecasts needed before a verdict is attempted.
const MIN_VERDICT_FORECASTS: usize = 20;

/// Mean signed miss (in probability points) tolerated as well calibrated.
const CONFIDENCE_TOLERANCE: f64 = 0.03;

// ---------------------------------------------------------------------------
// Forecasts
// ---------------------------------------------------------------------------

/// One source's probability for a pick, and whether the pick won.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredForecast {
    pub source: String,
    pub probability: f64,
    pub won: bool,
}

impl ScoredForecast {
    pub fn new(source: impl Into<String>, probability: f64, won: bool) -> Self {
        Self {
            source: source.into(),
            probability,
            won,
        }
    }

    fn outcome(&self) -> f64 {
        if self.won {
            1.0
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceVerdict {
    WellCalibrated,
    /// Probabilities further from 0.5 than the outcomes justify.
    OverConfident,
    /// Probabilities closer to 0.5 than the outcomes justify.
    UnderConfident,
    InsufficientData,
}

impl fmt::Display for ConfidenceVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConfidenceVerdict::WellCalibrated => "well calibrated",
            ConfidenceVerdict::OverConfident => "over-confident",
            ConfidenceVerdict::UnderConfident => "under-confident",
            ConfidenceVerdict::InsufficientData => "insufficient data",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceScore {
    pub brier: f64,
    pub forecasts: usize,
}

/// One bin of the reliability curve. Empty bins have `forecasts == 0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReliabilityBin {
    pub lower: f64,
    pub upper: f64,
    pub forecasts: usize,
    pub mean_probability: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationSummary {
    pub forecasts: usize,
    pub brier: f64,
    pub by_source: BTreeMap<String, SourceScore>,
    pub reliability: Vec<ReliabilityBin>,
    pub verdict: ConfidenceVerdict,
}

impl fmt::Display for CalibrationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} forecasts, Brier {:.4} ({})",
            self.forecasts, self.brier, self.verdict
        )?;
        for (source, score) in &self.by_source {
            writeln!(f, "  {source:<12} Brier {:.4} (n={})", score.brier, score.forecasts)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct CalibrationTracker {
    forecasts: Vec<ScoredForecast>,
}

impl CalibrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, forecast: ScoredForecast) {
        self.forecasts.push(forecast);
    }

    pub fn extend(&mut self, forecasts: impl IntoIterator<Item = ScoredForecast>) {
        self.forecasts.extend(forecasts);
    }

    pub fn len(&self) -> usize {
        self.forecasts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forecasts.is_empty()
    }

    pub fn summary(&self) -> CalibrationSummary {
        let mut by_source: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for forecast in &self.forecasts {
            let entry = by_source.entry(forecast.source.clone()).or_default();
            entry.0 += squared_error(forecast);
            entry.1 += 1;
        }

        let reliability = self.reliability();
        CalibrationSummary {
            forecasts: self.forecasts.len(),
            brier: brier(&self.forecasts),
            by_source: by_source
                .into_iter()
                .map(|(source, (sum, n))| {
                    let score = SourceScore {
                        brier: sum / n as f64,
                        forecasts: n,
                    };
                    (source, score)
                })
                .collect(),
            verdict: self.verdict(&reliability),
            reliability,
        }
    }

    fn reliability(&self) -> Vec<ReliabilityBin> {
        // (count, Σp, wins) per bin; p = 1.0 belongs to the last bin.
        let mut bins = [(0usize, 0.0_f64, 0usize); NUM_BINS];
        for forecast in &self.forecasts {
            let idx = ((forecast.probability * NUM_BINS as f64) as usize).min(NUM_BINS - 1);
            let bin = &mut bins[idx];
            bin.0 += 1;
            bin.1 += forecast.probability;
            bin.2 += usize::from(forecast.won);
        }

        bins.iter()
            .enumerate()
            .map(|(i, &(n, sum_p, wins))| {
                let lower = i as f64 / NUM_BINS as f64;
                let upper = (i + 1) as f64 / NUM_BINS as f64;
                if n == 0 {
                    return ReliabilityBin {
                        lower,
                        upper,
                        forecasts: 0,
                        mean_probability: 0.0,
                        win_rate: 0.0,
                    };
                }
                ReliabilityBin {
                    lower,
                    upper,
                    forecasts: n,
                    mean_probability: sum_p / n as f64,
                    win_rate: wins as f64 / n as f64,
                }
            })
            .collect()
    }

    /// Forecast-weighted signed miss, oriented so that claiming more than
    /// the outcomes deliver on either side of 0.5 counts as over-confidence.
    fn verdict(&self, reliability: &[ReliabilityBin]) -> ConfidenceVerdict {
        if self.forecasts.len() < MIN_VERDICT_FORECASTS {
            return ConfidenceVerdict::InsufficientData;
        }

        let overreach: f64 = reliability
            .iter()
            .filter(|b| b.forecasts > 0)
            .map(|b| {
                let miss = b.mean_probability - b.win_rate;
                let side = if b.mean_probability >= 0.5 { 1.0 } else { -1.0 };
                side * miss * b.forecasts as f64
            })
            .sum::<f64>()
            / self.forecasts.len() as f64;

        if overreach > CONFIDENCE_TOLERANCE {
            ConfidenceVerdict::OverConfident
        } else if overreach < -CONFIDENCE_TOLERANCE {
            ConfidenceVerdict::UnderConfident
        } else {
            ConfidenceVerdict::WellCalibrated
        }
    }
}

fn squared_error(forecast: &ScoredForecast) -> f64 {
    (forecast.probability - forecast.outcome()).powi(2)
}

/// Mean squared error against the 0/1 outcome. 0.25 is a coin flip.
fn brier(forecasts: &[ScoredForecast]) -> f64 {
    if forecasts.is_empty() {
        return 0.0;
    }
    forecasts.iter().map(squared_error).sum::<f64>() / forecasts.len() as f64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
