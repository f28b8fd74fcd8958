//! Report generation for flux recovery runs
//!
//! Produces a JSON report with one summary per decoded track: the verdict,
//! combined confidence, per-region confidences, recovery counters and every
//! retained hypothesis with its status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::confidence::ConfidenceLevel;
use crate::hypothesis::{HypothesisStatus, TrackDecode, Verdict};
use crate::types::{BitFlags, TrackId};

/// Report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Report generation timestamp
    pub generated_at: DateTime<Utc>,
    /// Tool name
    pub tool_name: String,
    /// Tool version
    pub version: String,
    /// Capture files the run read
    pub captures: Vec<String>,
}

impl ReportMetadata {
    pub fn new(captures: Vec<String>) -> Self {
        Self {
            generated_at: Utc::now(),
            tool_name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            captures,
        }
    }
}

/// One hypothesis as it stood at the end of the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypothesisSummary {
    pub id: String,
    pub encoding: String,
    pub cell_ns: f64,
    pub phase: f64,
    pub score: f64,
    pub confidence: u8,
    /// `candidate`, or the rejection reason
    pub status: String,
    pub reasons: Vec<String>,
}

/// Confidence of one merged field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionSummary {
    pub kind: String,
    pub sector: Option<u8>,
    pub source: String,
    pub confidence: u8,
    pub crc_ok: bool,
    pub low_confidence: bool,
}

/// Per-track summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSummary {
    pub track: TrackId,
    pub confident: bool,
    /// Combined confidence of the selected hypothesis
    pub confidence: u8,
    pub level: String,
    /// `None` when no cell width could be established
    pub nominal_cell_ns: Option<f64>,
    pub revolutions: usize,
    pub dropouts: usize,
    pub recovered_dropouts: usize,
    pub weak_zones: usize,
    pub weak_bits: usize,
    pub reconstructed_syncs: usize,
    pub restored_clocks: usize,
    pub slip_corrections: usize,
    pub repaired_fields: usize,
    pub crc_passes: usize,
    pub fields: usize,
    pub failed_hypotheses: usize,
    pub degraded: Option<String>,
    pub regions: Vec<RegionSummary>,
    pub hypotheses: Vec<HypothesisSummary>,
    pub warnings: Vec<String>,
}

impl TrackSummary {
    /// Summarise a finished track; `warnings` come from the track's context
    pub fn from_decode(decode: &TrackDecode, warnings: Vec<String>) -> Self {
        let best = decode.best();
        let confidence = match decode.verdict {
            Verdict::Confident { confidence, .. } => confidence,
            Verdict::Inconclusive { confidence, .. } => confidence,
        };

        let regions = decode
            .composite
            .regions
            .iter()
            .map(|r| RegionSummary {
                kind: format!("{:?}", r.key.kind).to_lowercase(),
                sector: r.key.id.map(|id| id.sector),
                source: r.source.to_string(),
                confidence: r.confidence,
                crc_ok: r.crc_ok,
                low_confidence: r.low_confidence,
            })
            .collect();

        let hypotheses = decode
            .hypotheses
            .all()
            .iter()
            .map(|h| HypothesisSummary {
                id: h.id().to_string(),
                encoding: format!("{:?}", h.value.assumption.encoding).to_lowercase(),
                cell_ns: h.value.assumption.cell_ns,
                phase: h.value.assumption.phase,
                score: h.score,
                confidence: h.confidence,
                status: match h.status() {
                    HypothesisStatus::Candidate => "candidate".to_string(),
                    HypothesisStatus::Rejected { reason } => format!("rejected: {}", reason),
                },
                reasons: h.reasons.clone(),
            })
            .collect();

        Self {
            track: decode.track,
            confident: decode.verdict.is_confident(),
            confidence,
            level: ConfidenceLevel::from_score(confidence).as_str().to_string(),
            nominal_cell_ns: decode.analysis.nominal_cell_ns,
            revolutions: decode.analysis.working.len(),
            dropouts: decode.analysis.dropouts.len(),
            recovered_dropouts: decode.analysis.recovered_dropouts(),
            weak_zones: best.map_or(0, |b| b.weak_zones.len()),
            weak_bits: best.map_or(0, |b| {
                b.records.iter().filter(|r| r.flags.contains(BitFlags::WEAK)).count()
            }),
            reconstructed_syncs: best.map_or(0, |b| b.reconstructed_syncs()),
            restored_clocks: best.map_or(0, |b| b.restored_clocks.len()),
            slip_corrections: best.map_or(0, |b| b.slips.len()),
            repaired_fields: best.map_or(0, |b| b.repairs.len()),
            crc_passes: best.map_or(0, |b| b.crc_passes()),
            fields: best.map_or(0, |b| b.fields.len()),
            failed_hypotheses: decode.failed,
            degraded: decode.degraded.clone(),
            regions,
            hypotheses,
            warnings,
        }
    }
}

/// Complete report as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub metadata: ReportMetadata,
    pub tracks: Vec<TrackSummary>,
    pub report_checksum: String,
}

impl RecoveryReport {
    pub fn new(metadata: ReportMetadata, tracks: Vec<TrackSummary>) -> Result<Self, ReportError> {
        let report_checksum = calculate_checksum(&metadata, &tracks)?;
        Ok(Self {
            metadata,
            tracks,
            report_checksum,
        })
    }

    /// Recompute the checksum over the metadata and track summaries
    pub fn verify(&self) -> Result<bool, ReportError> {
        Ok(calculate_checksum(&self.metadata, &self.tracks)? == self.report_checksum)
    }
}

fn calculate_checksum(metadata: &ReportMetadata, tracks: &[TrackSummary]) -> Result<String, ReportError> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(metadata)?);
    hasher.update(serde_json::to_vec(tracks)?);
    Ok(format!("{:x}", hasher.finalize()))
}

pub struct ReportGenerator {
    reports_dir: PathBuf,
}

impl ReportGenerator {
    pub fn new(output_dir: &Path) -> Result<Self, ReportError> {
        let reports_dir = output_dir.join("reports");
        if !reports_dir.exists() {
            fs::create_dir_all(&reports_dir)?;
        }
        Ok(Self { reports_dir })
    }

    pub fn reports_dir(&self) -> &Path {
        &self.reports_dir
    }

    /// Write the report as pretty JSON and return its path
    pub fn write_json(&self, report: &RecoveryReport) -> Result<PathBuf, ReportError> {
        let timestamp = report.metadata.generated_at.format("%Y%m%d_%H%M%S");
        let path = self.reports_dir.join(format!("flux_report_{}.json", timestamp));
        let json_content = serde_json::to_string_pretty(report)?;
        fs::write(&path, json_content)?;
        Ok(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
