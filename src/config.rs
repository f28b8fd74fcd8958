use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::confidence::ConfidenceWeights;
use crate::error::{RecoveryError, Result};

/// Cell-width histogram parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistogramConfig {
    pub bin_width_ns: u32,
    pub max_interval_ns: u32,
    pub min_peak_count: u32,
    pub min_peak_fraction: f64,
    pub min_peak_separation_bins: usize,
    /// Allowed deviation when labelling 3T/4T peaks by ratio to the 2T peak
    pub ratio_tolerance: f64,
    /// Relative window around a peak whose intervals feed the cell estimate
    pub capture_window: f64,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            bin_width_ns: 25,
            max_interval_ns: 20_000,
            min_peak_count: 16,
            min_peak_fraction: 0.05,
            min_peak_separation_bins: 8,
            ratio_tolerance: 0.2,
            capture_window: 0.25,
        }
    }
}

/// Clock recovery granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PllMode {
    /// One loop state carried across every revolution of the track
    Global,
    /// Fresh loop state per revolution
    PerTrack,
    /// One loop state per bitstream region
    PerRegion,
}

impl Default for PllMode {
    fn default() -> Self {
        PllMode::PerTrack
    }
}

impl std::str::FromStr for PllMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "global" => Ok(PllMode::Global),
            "per-track" => Ok(PllMode::PerTrack),
            "per-region" => Ok(PllMode::PerRegion),
            other => Err(format!("unknown PLL mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PllConfig {
    pub frequency_gain: f64,
    pub phase_gain: f64,
    pub min_clock_ratio: f64,
    pub max_clock_ratio: f64,
    /// Phase error, as a fraction of the cell, that still counts as in lock
    pub lock_tolerance: f64,
    /// Consecutive in-tolerance intervals needed to declare lock
    pub lock_threshold: u32,
    /// Longest interval, in cells, that trains the loop
    pub max_cells: u32,
    pub mode: PllMode,
}

impl Default for PllConfig {
    fn default() -> Self {
        Self {
            frequency_gain: 0.05,
            phase_gain: 0.60,
            min_clock_ratio: 0.90,
            max_clock_ratio: 1.10,
            lock_tolerance: 0.15,
            lock_threshold: 16,
            max_cells: 8,
            mode: PllMode::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub segments: usize,
    /// RMS speed-factor difference at which two revolutions score 0 similarity
    pub similarity_tolerance: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            segments: 16,
            similarity_tolerance: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoteStrategy {
    Majority,
    QualityWeighted,
}

impl Default for VoteStrategy {
    fn default() -> Self {
        VoteStrategy::Majority
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    pub min_revolutions: usize,
    pub strategy: VoteStrategy,
    /// Bit offsets searched either side when aligning revolutions
    pub alignment_search: usize,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            min_revolutions: 2,
            strategy: VoteStrategy::default(),
            alignment_search: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropoutConfig {
    /// An interval longer than this many nominal cells is a dropout
    pub gap_multiple: f64,
    /// Allowed duration mismatch, in cells, between a gap and its substitute
    pub span_tolerance_cells: f64,
}

impl Default for DropoutConfig {
    fn default() -> Self {
        Self {
            gap_multiple: 8.0,
            span_tolerance_cells: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeakZoneConfig {
    /// Minority fraction above which a bit position is weak
    pub variability_threshold: f64,
    /// Zones separated by at most this many stable bits are merged
    pub merge_gap: usize,
    pub periodicity_tolerance: f64,
    pub alignment_tolerance: f64,
    /// Known protection positions as fractions of the track length
    pub protection_positions: Vec<f64>,
    pub long_zone_bits: usize,
    pub balanced_bias_min: f64,
    pub balanced_bias_max: f64,
}

impl Default for WeakZoneConfig {
    fn default() -> Self {
        Self {
            variability_threshold: 0.0,
            merge_gap: 0,
            periodicity_tolerance: 0.10,
            alignment_tolerance: 0.05,
            protection_positions: Vec::new(),
            long_zone_bits: 64,
            balanced_bias_min: 0.40,
            balanced_bias_max: 0.60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypothesisConfig {
    pub max_hypotheses: usize,
    /// Cell-width perturbations in percent of nominal
    pub perturbations_pct: Vec<f64>,
    /// Phase offsets as fractions of a cell
    pub phases: Vec<f64>,
    pub sync_weight: f64,
    pub crc_weight: f64,
    pub slip_weight: f64,
    /// Combined confidence a best hypothesis needs for a confident verdict
    pub min_confidence: u8,
    /// Timing hypotheses carried into full decoding per encoding
    pub timing_candidates: usize,
}

impl Default for HypothesisConfig {
    fn default() -> Self {
        Self {
            max_hypotheses: 16,
            perturbations_pct: vec![0.0, -1.0, 1.0, -2.0, 2.0, -4.0, 4.0],
            phases: vec![0.0, 0.25, 0.5],
            sync_weight: 1.0,
            crc_weight: 4.0,
            slip_weight: 0.5,
            min_confidence: 75,
            timing_candidates: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlipConfig {
    /// Bits per clock-parity window
    pub window: usize,
    /// Violation margin a parity flip needs before it is reported
    pub min_margin: usize,
    pub max_slips: usize,
}

impl Default for SlipConfig {
    fn default() -> Self {
        Self {
            window: 32,
            min_margin: 2,
            max_slips: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Hamming distance accepted for a reconstructed mark
    pub max_distance: u32,
    /// Bits searched either side of a predicted mark position
    pub search_tolerance: usize,
    /// Share of observed spacings that must agree before a period is predicted
    pub min_period_support: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_distance: 1,
            search_tolerance: 16,
            min_period_support: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub window_bits: usize,
    /// Relative cell-width change that splits a region
    pub timing_break_ratio: f64,
    /// Violation rate under which a window counts as conforming
    pub max_violation_rate: f64,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            window_bits: 256,
            timing_break_ratio: 0.10,
            max_violation_rate: 0.02,
        }
    }
}

/// CRC-guided repair of failing fields by flipping doubtful data cells
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub enabled: bool,
    /// Most cells flipped in one field (1 or 2)
    pub max_flips: usize,
    /// Lowest-confidence data cells considered per field
    pub candidates: usize,
    /// Cells above this confidence are never flipped
    pub max_confidence: u8,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_flips: 2,
            candidates: 16,
            max_confidence: 90,
        }
    }
}

/// Whether regions below the confidence floor stay in the composite output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LowConfidencePolicy {
    Preserve,
    Discard,
}

impl Default for LowConfidencePolicy {
    fn default() -> Self {
        LowConfidencePolicy::Preserve
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub histogram: HistogramConfig,
    pub pll: PllConfig,
    pub drift: DriftConfig,
    pub voting: VotingConfig,
    pub dropout: DropoutConfig,
    pub weak_zones: WeakZoneConfig,
    pub hypotheses: HypothesisConfig,
    pub slip: SlipConfig,
    pub sync: SyncConfig,
    pub regions: RegionConfig,
    pub repair: RepairConfig,
    pub confidence: ConfidenceWeights,
    pub low_confidence_policy: LowConfidencePolicy,
    /// Confidence under which a merged region is considered low confidence
    pub low_confidence_floor: u8,
    pub track_sources: bool,
    /// MFM cell width, in ns, used when the histogram finds no cell
    pub nominal_cell_ns: Option<f64>,
    /// Worker threads for hypothesis decoding (0 = rayon default)
    pub num_threads: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            histogram: HistogramConfig::default(),
            pll: PllConfig::default(),
            drift: DriftConfig::default(),
            voting: VotingConfig::default(),
            dropout: DropoutConfig::default(),
            weak_zones: WeakZoneConfig::default(),
            hypotheses: HypothesisConfig::default(),
            slip: SlipConfig::default(),
            sync: SyncConfig::default(),
            regions: RegionConfig::default(),
            repair: RepairConfig::default(),
            confidence: ConfidenceWeights::default(),
            low_confidence_policy: LowConfidencePolicy::default(),
            low_confidence_floor: 25,
            track_sources: true,
            nominal_cell_ns: None,
            num_threads: 0,
        }
    }
}

impl RecoveryConfig {
    /// Load a JSON configuration; missing keys fall back to defaults
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let config: Self =
            serde_json::from_slice(&data).map_err(|err| RecoveryError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.voting.min_revolutions < 2 {
            return Err(RecoveryError::Config(format!(
                "voting.min_revolutions must be at least 2, got {}",
                self.voting.min_revolutions
            )));
        }
        if !(self.pll.min_clock_ratio > 0.0 && self.pll.min_clock_ratio <= 1.0)
            || self.pll.max_clock_ratio < 1.0
        {
            return Err(RecoveryError::Config(format!(
                "PLL clock bounds [{}, {}] must bracket 1.0",
                self.pll.min_clock_ratio, self.pll.max_clock_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.pll.phase_gain)
            || !(0.0..=1.0).contains(&self.pll.frequency_gain)
        {
            return Err(RecoveryError::Config(
                "PLL gains must lie in [0, 1]".to_string(),
            ));
        }
        if self.pll.max_cells == 0 {
            return Err(RecoveryError::Config("pll.max_cells must be positive".to_string()));
        }
        if self.hypotheses.max_hypotheses == 0 {
            return Err(RecoveryError::Config(
                "hypotheses.max_hypotheses must be positive".to_string(),
            ));
        }
        if self.histogram.bin_width_ns == 0 || self.histogram.max_interval_ns == 0 {
            return Err(RecoveryError::Config(
                "histogram bin width and range must be positive".to_string(),
            ));
        }
        if self.dropout.gap_multiple <= 1.0 {
            return Err(RecoveryError::Config(format!(
                "dropout.gap_multiple must exceed 1, got {}",
                self.dropout.gap_multiple
            )));
        }
        if !(0.0..1.0).contains(&self.weak_zones.variability_threshold) {
            return Err(RecoveryError::Config(
                "weak_zones.variability_threshold must lie in [0, 1)".to_string(),
            ));
        }
        if let Some(cell) = self.nominal_cell_ns {
            if !(cell.is_finite() && cell > 0.0) {
                return Err(RecoveryError::Config(format!(
                    "nominal_cell_ns must be positive, got {}",
                    cell
                )));
            }
        }
        if !(1..=2).contains(&self.repair.max_flips) {
            return Err(RecoveryError::Config(format!(
                "repair.max_flips must be 1 or 2, got {}",
                self.repair.max_flips
            )));
        }
        if self.slip.window == 0 || self.regions.window_bits == 0 {
            return Err(RecoveryError::Config("window sizes must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RecoveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.voting.min_revolutions, 2);
        assert_eq!(config.low_confidence_policy, LowConfidencePolicy::Preserve);
        assert_eq!(config.hypotheses.perturbations_pct[0], 0.0);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "voting": { "min_revolutions": 3 }, "pll": { "mode": "per-region" } }"#;
        let config: RecoveryConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.voting.min_revolutions, 3);
        assert_eq!(config.pll.mode, PllMode::PerRegion);
        assert_eq!(config.pll.lock_threshold, 16);
        assert_eq!(config.histogram.bin_width_ns, 25);
        assert_eq!(config.nominal_cell_ns, None);
        assert!(config.repair.enabled);
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = RecoveryConfig::default();
        config.voting.min_revolutions = 1;
        assert!(config.validate().is_err());

        let mut config = RecoveryConfig::default();
        config.pll.max_clock_ratio = 0.95;
        assert!(config.validate().is_err());

        let mut config = RecoveryConfig::default();
        config.nominal_cell_ns = Some(0.0);
        assert!(config.validate().is_err());

        let mut config = RecoveryConfig::default();
        config.repair.max_flips = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pll_mode_parsing() {
        assert_eq!("global".parse::<PllMode>(), Ok(PllMode::Global));
        assert!("sideways".parse::<PllMode>().is_err());
    }
}
