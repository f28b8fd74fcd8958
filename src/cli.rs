use clap::Parser;
use std::path::PathBuf;

use crate::config::{LowConfidencePolicy, PllMode, RecoveryConfig};

/// Flux-level recovery for vintage magnetic media
/// Decodes raw flux captures of one track into scored, merged sector data
#[derive(Parser, Debug, Clone)]
#[command(name = "flux-recovery")]
#[command(version)]
#[command(about = "Recover sector data from raw flux captures", long_about = None)]
pub struct Args {
    /// Raw flux capture files (little-endian u32 intervals, 0 between revolutions)
    #[arg(value_name = "CAPTURE", required = true, num_args = 1..)]
    pub captures: Vec<PathBuf>,

    /// Track number of the capture
    #[arg(long = "track", default_value = "0")]
    pub track: u16,

    /// Head (side) of the capture
    #[arg(long = "head", default_value = "0")]
    pub head: u8,

    /// JSON configuration file; missing keys keep their defaults
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Output directory for the JSON report
    #[arg(short = 'o', long = "report-dir", default_value = "recovery_output")]
    pub report_dir: PathBuf,

    /// Revolutions required before voting
    #[arg(long = "min-revolutions")]
    pub min_revolutions: Option<usize>,

    /// Upper bound on decode hypotheses per track
    #[arg(long = "max-hypotheses")]
    pub max_hypotheses: Option<usize>,

    /// Clock recovery mode: global, per-track or per-region
    #[arg(long = "pll-mode")]
    pub pll_mode: Option<PllMode>,

    /// Nominal MFM cell width in ns, used when the interval histogram finds none
    #[arg(long = "cell-ns")]
    pub cell_ns: Option<f64>,

    /// Write a preservation store of the untouched flux to this file
    #[arg(long = "preserve")]
    pub preserve: Option<PathBuf>,

    /// Drop merged regions below the confidence floor instead of flagging them
    #[arg(long = "discard-low-confidence")]
    pub discard_low_confidence: bool,

    /// Worker threads (0 = one per core)
    #[arg(long = "threads", default_value = "0")]
    pub threads: usize,
}

impl Args {
    /// Validate the arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.captures.is_empty() {
            return Err("At least one capture file is required".to_string());
        }
        if let Some(empty) = self.captures.iter().find(|p| p.as_os_str().is_empty()) {
            return Err(format!("Capture path cannot be empty: {:?}", empty));
        }
        if let Some(n) = self.min_revolutions {
            if n < 2 {
                return Err(format!("min-revolutions must be at least 2, got {}", n));
            }
        }
        if self.max_hypotheses == Some(0) {
            return Err("max-hypotheses must be greater than 0".to_string());
        }
        if let Some(cell) = self.cell_ns {
            if cell.is_nan() || cell <= 0.0 {
                return Err(format!("cell-ns must be positive, got {}", cell));
            }
        }
        if self.head > 1 {
            return Err(format!("head must be 0 or 1, got {}", self.head));
        }
        Ok(())
    }

    /// Layer command-line overrides over a loaded configuration
    pub fn apply(&self, config: &mut RecoveryConfig) {
        if let Some(n) = self.min_revolutions {
            config.voting.min_revolutions = n;
        }
        if let Some(n) = self.max_hypotheses {
            config.hypotheses.max_hypotheses = n;
        }
        if let Some(mode) = self.pll_mode {
            config.pll.mode = mode;
        }
        if let Some(cell) = self.cell_ns {
            config.nominal_cell_ns = Some(cell);
        }
        if self.discard_low_confidence {
            config.low_confidence_policy = LowConfidencePolicy::Discard;
        }
        if self.threads > 0 {
            config.num_threads = self.threads;
        }
    }
}
