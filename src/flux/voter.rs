//! Bit-level voting across aligned revolutions

use serde::{Deserialize, Serialize};

use crate::config::{VoteStrategy, VotingConfig, WeakZoneConfig};
use crate::error::{RecoveryError, Result};
use crate::flux::dropout::{detect_weak_zones, WeakZone};
use crate::types::{BitFlags, BitRecord};

/// Value chosen when an even split leaves no majority
pub const TIE_BREAK_VALUE: u8 = 0;

/// One revolution's decoded bits, ready for voting
#[derive(Debug, Clone, PartialEq)]
pub struct RevolutionBits {
    pub revolution: u16,
    pub bits: Vec<u8>,
    pub quality: f32,
    /// Alignment or drift agreement with the reference, in `[0, 1]`
    pub alignment: f64,
}

impl RevolutionBits {
    pub fn new(revolution: u16, bits: Vec<u8>) -> Self {
        Self {
            revolution,
            bits,
            quality: 1.0,
            alignment: 1.0,
        }
    }

    pub fn with_weight(mut self, quality: f32, alignment: f64) -> Self {
        self.quality = quality;
        self.alignment = alignment;
        self
    }

    fn weight(&self) -> f64 {
        (self.quality as f64 * self.alignment).max(0.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoteResult {
    pub bits: Vec<u8>,
    pub records: Vec<BitRecord>,
    /// Minority share of the votes at each position
    pub variability: Vec<f64>,
    pub weak_zones: Vec<WeakZone>,
    pub revolutions: usize,
    pub unanimous: usize,
    pub ties: usize,
}

impl VoteResult {
    pub fn confidences(&self) -> Vec<u8> {
        self.records.iter().map(|r| r.confidence).collect()
    }

    pub fn mean_confidence(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.records.iter().map(|r| r.confidence as f64).sum::<f64>() / self.records.len() as f64
    }
}

pub struct MultiRevolutionVoter {
    config: VotingConfig,
    weak_zones: WeakZoneConfig,
}

impl MultiRevolutionVoter {
    pub fn new(config: VotingConfig, weak_zones: WeakZoneConfig) -> Self {
        Self { config, weak_zones }
    }

    pub fn vote(&self, revolutions: &[RevolutionBits]) -> Result<VoteResult> {
        if revolutions.is_empty() || revolutions.len() < self.config.min_revolutions {
            return Err(RecoveryError::InsufficientData {
                what: "multi-revolution voting",
                needed: self.config.min_revolutions.max(1),
                got: revolutions.len(),
            });
        }
        let length = revolutions[0].bits.len();
        if let Some(bad) = revolutions.iter().find(|r| r.bits.len() != length) {
            return Err(RecoveryError::InvalidInput(format!(
                "revolution {} has {} bits, expected {}",
                bad.revolution,
                bad.bits.len(),
                length
            )));
        }

        let weights: Vec<f64> = revolutions.iter().map(RevolutionBits::weight).collect();
        let use_weights = self.config.strategy == VoteStrategy::QualityWeighted
            && weights.iter().sum::<f64>() > 0.0;
        let n = revolutions.len();

        let mut result = VoteResult {
            bits: Vec::with_capacity(length),
            records: Vec::with_capacity(length),
            variability: Vec::with_capacity(length),
            weak_zones: Vec::new(),
            revolutions: n,
            unanimous: 0,
            ties: 0,
        };

        for pos in 0..length {
            let ones = revolutions.iter().filter(|r| r.bits[pos] & 1 == 1).count();
            let zeros = n - ones;
            result.variability.push(ones.min(zeros) as f64 / n as f64);

            let (one_score, zero_score) = if use_weights {
                revolutions
                    .iter()
                    .zip(&weights)
                    .fold((0.0, 0.0), |(o, z), (r, w)| {
                        if r.bits[pos] & 1 == 1 {
                            (o + w, z)
                        } else {
                            (o, z + w)
                        }
                    })
            } else {
                (ones as f64, zeros as f64)
            };

            let record = if ones == 0 || zeros == 0 {
                result.unanimous += 1;
                BitRecord::new(u8::from(ones > 0), 100).with_flags(BitFlags::VOTED)
            } else if (one_score - zero_score).abs() < f64::EPSILON {
                result.ties += 1;
                BitRecord::new(TIE_BREAK_VALUE, 0)
                    .with_flags(BitFlags::VOTED | BitFlags::WEAK | BitFlags::UNCERTAIN)
            } else {
                let total = one_score + zero_score;
                let margin = (one_score - zero_score).abs() / total;
                let value = u8::from(one_score > zero_score);
                BitRecord::new(value, (margin * 100.0).round() as u8)
                    .with_flags(BitFlags::VOTED | BitFlags::WEAK | BitFlags::UNCERTAIN)
            };
            result.bits.push(record.value);
            result.records.push(record);
        }

        let confidences = result.confidences();
        result.weak_zones =
            detect_weak_zones(&result.variability, &result.bits, &confidences, &self.weak_zones);

        if !result.weak_zones.is_empty() {
            log::debug!(
                "voting over {} revolutions left {} weak zones ({} ties)",
                n,
                result.weak_zones.len(),
                result.ties
            );
        }
        Ok(result)
    }
}

/// Revolutions cut to a common, mutually aligned window
#[derive(Debug, Clone, Default)]
pub struct Alignment {
    pub bits: Vec<Vec<u8>>,
    /// Offset of each revolution relative to the first
    pub offsets: Vec<isize>,
    /// Fraction of agreeing bits at the chosen offset
    pub scores: Vec<f64>,
}

fn agreement(reference: &[u8], other: &[u8], shift: isize) -> f64 {
    let (ref_start, other_start) = if shift >= 0 {
        (0usize, shift as usize)
    } else {
        ((-shift) as usize, 0usize)
    };
    if ref_start >= reference.len() || other_start >= other.len() {
        return 0.0;
    }
    let overlap = (reference.len() - ref_start).min(other.len() - other_start);
    let matches = reference[ref_start..ref_start + overlap]
        .iter()
        .zip(&other[other_start..other_start + overlap])
        .filter(|(a, b)| a == b)
        .count();
    matches as f64 / overlap as f64
}

/// Align every revolution against the first by cross-correlation and
/// truncate all of them to the common length
pub fn align_revolutions(bits: &[Vec<u8>], search_range: usize) -> Alignment {
    let Some(reference) = bits.first() else {
        return Alignment::default();
    };
    let range = search_range as isize;

    let mut offsets = Vec::with_capacity(bits.len());
    let mut scores = Vec::with_capacity(bits.len());
    for other in bits {
        let mut best = (0isize, agreement(reference, other, 0));
        for shift in (-range..=range).filter(|&s| s != 0) {
            let score = agreement(reference, other, shift);
            // Prefer the smaller shift on equal agreement
            if score > best.1 + 1e-12 || ((score - best.1).abs() <= 1e-12 && shift.abs() < best.0.abs()) {
                best = (shift, score);
            }
        }
        offsets.push(best.0);
        scores.push(best.1);
    }

    let start = offsets.iter().map(|&o| (-o).max(0)).max().unwrap_or(0);
    let length = bits
        .iter()
        .zip(&offsets)
        .map(|(b, &o)| b.len() as isize - (start + o))
        .min()
        .unwrap_or(0)
        .max(0) as usize;

    let aligned = bits
        .iter()
        .zip(&offsets)
        .map(|(b, &o)| {
            let from = (start + o) as usize;
            b[from..from + length].to_vec()
        })
        .collect();

    Alignment {
        bits: aligned,
        offsets,
        scores,
    }
}
