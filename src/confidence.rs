use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::TrackId;

/// Relative weight of each evidence source in the combined confidence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub raw_signal: f64,
    pub crc: f64,
    pub pattern: f64,
    pub cross_validation: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            raw_signal: 25.0,
            crc: 40.0,
            pattern: 20.0,
            cross_validation: 15.0,
        }
    }
}

impl ConfidenceWeights {
    fn total(&self) -> f64 {
        self.raw_signal + self.crc + self.pattern + self.cross_validation
    }
}

/// Sub-scores in `[0, 100]` and their weighted combination
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub raw_signal: f64,
    pub crc: f64,
    pub pattern: f64,
    pub cross_validation: f64,
    pub combined: u8,
}

impl ConfidenceBreakdown {
    pub fn new(
        raw_signal: f64,
        crc: f64,
        pattern: f64,
        cross_validation: f64,
        weights: &ConfidenceWeights,
    ) -> Self {
        let raw_signal = raw_signal.clamp(0.0, 100.0);
        let crc = crc.clamp(0.0, 100.0);
        let pattern = pattern.clamp(0.0, 100.0);
        let cross_validation = cross_validation.clamp(0.0, 100.0);

        let total = weights.total();
        let combined = if total > 0.0 {
            (raw_signal * weights.raw_signal
                + crc * weights.crc
                + pattern * weights.pattern
                + cross_validation * weights.cross_validation)
                / total
        } else {
            0.0
        };

        Self {
            raw_signal,
            crc,
            pattern,
            cross_validation,
            combined: combined.round().clamp(0.0, 100.0) as u8,
        }
    }

    pub fn level(&self) -> ConfidenceLevel {
        ConfidenceLevel::from_score(self.combined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    Guess,
    Low,
    Medium,
    High,
    Certain,
}

impl ConfidenceLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            95.. => ConfidenceLevel::Certain,
            75..=94 => ConfidenceLevel::High,
            50..=74 => ConfidenceLevel::Medium,
            25..=49 => ConfidenceLevel::Low,
            _ => ConfidenceLevel::Guess,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::Certain => "certain",
            ConfidenceLevel::High => "high",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::Low => "low",
            ConfidenceLevel::Guess => "guess",
        }
    }
}

impl std::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Algorithms that can appear in a provenance chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Capture,
    Histogram,
    Pll,
    DriftCompensation,
    Alignment,
    Voting,
    DropoutRecovery,
    WeakZoneDetection,
    TimingHypothesis,
    BitSlipCorrection,
    SyncReconstruction,
    MissingClockReconstruction,
    RegionSegmentation,
    MixedEncodingSeparation,
    FieldCheck,
    CrcRepair,
    Merge,
}

/// One processing step that contributed to a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStep {
    pub algorithm: Algorithm,
    pub track: Option<TrackId>,
    pub revolution: Option<u16>,
    pub parameters: BTreeMap<String, f64>,
    pub recorded_at: DateTime<Utc>,
}

impl SourceStep {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            track: None,
            revolution: None,
            parameters: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn on_track(mut self, track: TrackId) -> Self {
        self.track = Some(track);
        self
    }

    pub fn on_revolution(mut self, revolution: u16) -> Self {
        self.revolution = Some(revolution);
        self
    }

    pub fn param(mut self, name: &str, value: f64) -> Self {
        self.parameters.insert(name.to_string(), value);
        self
    }
}

/// Ordered provenance chain from capture to output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub steps: Vec<SourceStep>,
}

impl SourceInfo {
    pub fn root(step: SourceStep) -> Self {
        Self { steps: vec![step] }
    }

    /// Extended chain; the receiver stays as it was
    pub fn then(&self, step: SourceStep) -> Self {
        let mut steps = self.steps.clone();
        steps.push(step);
        Self { steps }
    }

    pub fn last_algorithm(&self) -> Option<Algorithm> {
        self.steps.last().map(|step| step.algorithm)
    }

    pub fn contains(&self, algorithm: Algorithm) -> bool {
        self.steps.iter().any(|step| step.algorithm == algorithm)
    }
}

/// Append a step only when provenance tracking is on
pub fn track_step(source: Option<&SourceInfo>, step: SourceStep) -> Option<SourceInfo> {
    source.map(|info| info.then(step))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_weighting() {
        let weights = ConfidenceWeights::default();
        let all = ConfidenceBreakdown::new(100.0, 100.0, 100.0, 100.0, &weights);
        assert_eq!(all.combined, 100);
        assert_eq!(all.level(), ConfidenceLevel::Certain);

        // Only CRC evidence: 40% of the total weight
        let crc_only = ConfidenceBreakdown::new(0.0, 100.0, 0.0, 0.0, &weights);
        assert_eq!(crc_only.combined, 40);
        assert_eq!(crc_only.level(), ConfidenceLevel::Low);
    }

    #[test]
    fn test_weights_are_normalised() {
        let weights = ConfidenceWeights {
            raw_signal: 1.0,
            crc: 1.0,
            pattern: 0.0,
            cross_validation: 0.0,
        };
        let breakdown = ConfidenceBreakdown::new(80.0, 60.0, 0.0, 0.0, &weights);
        assert_eq!(breakdown.combined, 70);
    }

    #[test]
    fn test_level_bands() {
        assert_eq!(ConfidenceLevel::from_score(95), ConfidenceLevel::Certain);
        assert_eq!(ConfidenceLevel::from_score(94), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(50), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(25), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_score(24), ConfidenceLevel::Guess);
    }

    #[test]
    fn test_source_chain_extension() {
        let root = SourceInfo::root(SourceStep::new(Algorithm::Capture).on_revolution(1));
        let chained = root.then(SourceStep::new(Algorithm::Pll).param("cell_ns", 2000.0));
        assert_eq!(root.steps.len(), 1);
        assert_eq!(chained.steps.len(), 2);
        assert_eq!(chained.last_algorithm(), Some(Algorithm::Pll));
        assert!(track_step(None, SourceStep::new(Algorithm::Voting)).is_none());
    }
}
