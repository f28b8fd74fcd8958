//! Candidate (cell width, phase) pairs around the histogram estimate

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::HypothesisConfig;
use crate::hypothesis::HypothesisSet;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingHypothesis {
    pub cell_ns: f64,
    /// Initial phase offset as a fraction of the cell
    pub phase: f64,
    pub perturbation_pct: f64,
    pub evidence: TimingEvidence,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingEvidence {
    pub sync_hits: usize,
    pub crc_passes: usize,
}

/// Nominal first, then perturbations in configured order, capped
pub fn generate_timing_hypotheses(
    nominal_cell_ns: f64,
    config: &HypothesisConfig,
) -> HypothesisSet<TimingHypothesis> {
    let mut set = HypothesisSet::new();
    let mut perturbations = config.perturbations_pct.clone();
    if let Some(pos) = perturbations.iter().position(|p| *p == 0.0) {
        perturbations.remove(pos);
    }
    perturbations.insert(0, 0.0);

    'outer: for &pct in &perturbations {
        for &phase in &config.phases {
            if set.len() >= config.max_hypotheses {
                break 'outer;
            }
            set.push(
                TimingHypothesis {
                    cell_ns: nominal_cell_ns * (1.0 + pct / 100.0),
                    phase,
                    perturbation_pct: pct,
                    evidence: TimingEvidence::default(),
                },
                0.0,
                0,
            );
        }
    }
    set
}

/// Score every hypothesis with caller-supplied evidence, then rank
///
/// Confidence is relative to the strongest hypothesis in the set; ranking is
/// advisory and nothing is rejected here.
pub fn score_timing_hypotheses<F>(
    set: &mut HypothesisSet<TimingHypothesis>,
    config: &HypothesisConfig,
    evaluator: F,
) where
    F: Fn(&TimingHypothesis) -> TimingEvidence + Sync,
{
    let evidence: Vec<TimingEvidence> = set
        .all()
        .par_iter()
        .map(|h| evaluator(&h.value))
        .collect();

    for (hypothesis, evidence) in set.iter_mut().zip(evidence) {
        hypothesis.value.evidence = evidence;
        hypothesis.score = config.sync_weight * evidence.sync_hits as f64
            + config.crc_weight * evidence.crc_passes as f64;
        hypothesis.reasons = vec![
            format!("{} sync marks", evidence.sync_hits),
            format!("{} CRC passes", evidence.crc_passes),
        ];
    }

    let top = set.all().iter().map(|h| h.score).fold(0.0, f64::max);
    for hypothesis in set.iter_mut() {
        hypothesis.confidence = if top > 0.0 {
            (hypothesis.score / top * 100.0).round() as u8
        } else {
            0
        };
    }
    set.rank();
}
