//! Scored alternative interpretations with explicit, reversible decisions

pub mod engine;
pub mod merge;

pub use engine::{
    CellSource, DecodeAssumption, DecodeHypothesis, DecodeHypothesisEngine, DecodeProgress,
    FluxAnalysis, TrackDecode, WorkingRevolution, CELL_UNDETERMINED,
};
pub use merge::{merge_hypotheses, CompositeDecode, FieldKey, MergedRegion};

use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, Result};
use crate::types::HypothesisId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HypothesisStatus {
    Candidate,
    Rejected { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis<T> {
    id: HypothesisId,
    status: HypothesisStatus,
    pub value: T,
    pub score: f64,
    pub confidence: u8,
    pub reasons: Vec<String>,
}

impl<T> Hypothesis<T> {
    pub fn id(&self) -> HypothesisId {
        self.id
    }

    pub fn status(&self) -> &HypothesisStatus {
        &self.status
    }

    pub fn is_valid(&self) -> bool {
        self.status == HypothesisStatus::Candidate
    }
}

/// One reversible decision in the history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    Reject {
        id: HypothesisId,
        reason: String,
        was_selected: bool,
    },
    Restore {
        id: HypothesisId,
        reason: String,
    },
    Select {
        id: HypothesisId,
        previous: Option<HypothesisId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Confident {
        best: HypothesisId,
        confidence: u8,
    },
    Inconclusive {
        best: Option<HypothesisId>,
        confidence: u8,
        required: u8,
    },
}

impl Verdict {
    pub fn is_confident(&self) -> bool {
        matches!(self, Verdict::Confident { .. })
    }

    /// The winning id, or an `Inconclusive` error for callers that need one
    pub fn require_confident(self) -> Result<HypothesisId> {
        match self {
            Verdict::Confident { best, .. } => Ok(best),
            Verdict::Inconclusive {
                best,
                confidence,
                required,
            } => Err(RecoveryError::Inconclusive {
                best: best.map(|id| id.0).unwrap_or(u32::MAX),
                confidence,
                required,
            }),
        }
    }
}

/// Owned hypotheses plus a selection and an undo/redo history
///
/// Nothing is ever removed: rejection flips a status and records the reason,
/// and every decision can be undone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypothesisSet<T> {
    entries: Vec<Hypothesis<T>>,
    selected: Option<HypothesisId>,
    history: Vec<Decision>,
    cursor: usize,
    next_id: u32,
}

impl<T> Default for HypothesisSet<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            selected: None,
            history: Vec::new(),
            cursor: 0,
            next_id: 0,
        }
    }
}

impl<T> HypothesisSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: T, score: f64, confidence: u8) -> HypothesisId {
        let id = HypothesisId(self.next_id);
        self.next_id += 1;
        self.entries.push(Hypothesis {
            id,
            status: HypothesisStatus::Candidate,
            value,
            score,
            confidence: confidence.min(100),
            reasons: Vec::new(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn all(&self) -> &[Hypothesis<T>] {
        &self.entries
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Hypothesis<T>> {
        self.entries.iter_mut()
    }

    pub fn get(&self, id: HypothesisId) -> Option<&Hypothesis<T>> {
        self.entries.iter().find(|h| h.id == id)
    }

    fn position(&self, id: HypothesisId) -> Result<usize> {
        self.entries
            .iter()
            .position(|h| h.id == id)
            .ok_or_else(|| RecoveryError::InvalidInput(format!("unknown hypothesis {}", id)))
    }

    pub fn get_valid(&self) -> Vec<&Hypothesis<T>> {
        self.entries.iter().filter(|h| h.is_valid()).collect()
    }

    pub fn rejected_count(&self) -> usize {
        self.entries.iter().filter(|h| !h.is_valid()).count()
    }

    /// Stable sort by score, best first
    pub fn rank(&mut self) {
        self.entries.sort_by(|a, b| b.score.total_cmp(&a.score));
    }

    pub fn selected(&self) -> Option<&Hypothesis<T>> {
        self.selected.and_then(|id| self.get(id))
    }

    /// The explicit selection, else the highest scoring valid hypothesis
    pub fn best(&self) -> Option<&Hypothesis<T>> {
        if let Some(selected) = self.selected() {
            return Some(selected);
        }
        self.entries
            .iter()
            .filter(|h| h.is_valid())
            .fold(None, |best: Option<&Hypothesis<T>>, h| match best {
                Some(b) if b.score >= h.score => Some(b),
                _ => Some(h),
            })
    }

    pub fn verdict(&self, min_confidence: u8) -> Verdict {
        match self.best() {
            Some(best) if best.confidence >= min_confidence => Verdict::Confident {
                best: best.id,
                confidence: best.confidence,
            },
            Some(best) => Verdict::Inconclusive {
                best: Some(best.id),
                confidence: best.confidence,
                required: min_confidence,
            },
            None => Verdict::Inconclusive {
                best: None,
                confidence: 0,
                required: min_confidence,
            },
        }
    }

    pub fn reject(&mut self, id: HypothesisId, reason: impl Into<String>) -> Result<()> {
        let pos = self.position(id)?;
        if !self.entries[pos].is_valid() {
            return Err(RecoveryError::InvalidInput(format!(
                "hypothesis {} is already rejected",
                id
            )));
        }
        let decision = Decision::Reject {
            id,
            reason: reason.into(),
            was_selected: self.selected == Some(id),
        };
        self.apply(&decision);
        self.record(decision);
        Ok(())
    }

    pub fn restore(&mut self, id: HypothesisId) -> Result<()> {
        let pos = self.position(id)?;
        let reason = match &self.entries[pos].status {
            HypothesisStatus::Rejected { reason } => reason.clone(),
            HypothesisStatus::Candidate => {
                return Err(RecoveryError::InvalidInput(format!(
                    "hypothesis {} is not rejected",
                    id
                )))
            }
        };
        let decision = Decision::Restore { id, reason };
        self.apply(&decision);
        self.record(decision);
        Ok(())
    }

    pub fn select(&mut self, id: HypothesisId) -> Result<()> {
        let pos = self.position(id)?;
        if !self.entries[pos].is_valid() {
            return Err(RecoveryError::InvalidInput(format!(
                "hypothesis {} is rejected and cannot be selected",
                id
            )));
        }
        let decision = Decision::Select {
            id,
            previous: self.selected,
        };
        self.apply(&decision);
        self.record(decision);
        Ok(())
    }

    pub fn history(&self) -> &[Decision] {
        &self.history[..self.cursor]
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.history.len()
    }

    pub fn undo(&mut self) -> bool {
        if !self.can_undo() {
            return false;
        }
        self.cursor -= 1;
        let decision = self.history[self.cursor].clone();
        self.revert(&decision);
        true
    }

    pub fn redo(&mut self) -> bool {
        if !self.can_redo() {
            return false;
        }
        let decision = self.history[self.cursor].clone();
        self.apply(&decision);
        self.cursor += 1;
        true
    }

    fn record(&mut self, decision: Decision) {
        self.history.truncate(self.cursor);
        self.history.push(decision);
        self.cursor = self.history.len();
    }

    fn set_status(&mut self, id: HypothesisId, status: HypothesisStatus) {
        if let Some(entry) = self.entries.iter_mut().find(|h| h.id == id) {
            entry.status = status;
        }
    }

    fn apply(&mut self, decision: &Decision) {
        match decision {
            Decision::Reject {
                id,
                reason,
                was_selected,
            } => {
                self.set_status(
                    *id,
                    HypothesisStatus::Rejected {
                        reason: reason.clone(),
                    },
                );
                if *was_selected {
                    self.selected = None;
                }
            }
            Decision::Restore { id, .. } => self.set_status(*id, HypothesisStatus::Candidate),
            Decision::Select { id, .. } => self.selected = Some(*id),
        }
    }

    fn revert(&mut self, decision: &Decision) {
        match decision {
            Decision::Reject {
                id, was_selected, ..
            } => {
                self.set_status(*id, HypothesisStatus::Candidate);
                if *was_selected {
                    self.selected = Some(*id);
                }
            }
            Decision::Restore { id, reason } => self.set_status(
                *id,
                HypothesisStatus::Rejected {
                    reason: reason.clone(),
                },
            ),
            Decision::Select { previous, .. } => self.selected = *previous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> (HypothesisSet<&'static str>, Vec<HypothesisId>) {
        let mut set = HypothesisSet::new();
        let ids = vec![
            set.push("mfm", 3.0, 60),
            set.push("fm", 9.0, 90),
            set.push("gcr", 1.0, 10),
        ];
        (set, ids)
    }

    #[test]
    fn test_rank_is_stable_and_keeps_everything() {
        let mut set = HypothesisSet::new();
        set.push("a", 1.0, 50);
        set.push("b", 2.0, 50);
        set.push("c", 1.0, 50);
        set.rank();
        let order: Vec<_> = set.all().iter().map(|h| h.value).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
        assert_eq!(set.get_valid().len(), 3);
    }

    #[test]
    fn test_reject_and_restore() {
        let (mut set, ids) = sample_set();
        set.reject(ids[1], "crc mismatch").unwrap();
        assert_eq!(set.get_valid().len(), 2);
        assert_eq!(set.len(), 3);
        assert_eq!(
            set.get(ids[1]).unwrap().status(),
            &HypothesisStatus::Rejected {
                reason: "crc mismatch".to_string()
            }
        );
        assert_eq!(set.best().unwrap().value, "mfm");

        set.restore(ids[1]).unwrap();
        assert_eq!(set.get_valid().len(), 3);
        assert!(set.reject(ids[0], "x").is_ok());
        assert!(set.reject(ids[0], "again").is_err());
    }

    #[test]
    fn test_undo_redo_selection() {
        let (mut set, ids) = sample_set();
        set.select(ids[0]).unwrap();
        set.reject(ids[0], "slip").unwrap();
        assert!(set.selected().is_none());

        assert!(set.undo());
        assert_eq!(set.selected().unwrap().id(), ids[0]);
        assert!(set.get(ids[0]).unwrap().is_valid());

        assert!(set.redo());
        assert!(!set.get(ids[0]).unwrap().is_valid());

        assert!(set.undo());
        assert!(set.undo());
        assert!(set.selected().is_none());
        assert!(!set.undo());

        // A new decision drops the redo tail
        set.select(ids[2]).unwrap();
        assert!(!set.can_redo());
        assert_eq!(set.history().len(), 1);
    }

    #[test]
    fn test_cannot_select_rejected() {
        let (mut set, ids) = sample_set();
        set.reject(ids[2], "illegal runs").unwrap();
        assert!(matches!(
            set.select(ids[2]),
            Err(RecoveryError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_verdicts() {
        let (set, ids) = sample_set();
        assert_eq!(
            set.verdict(75),
            Verdict::Confident {
                best: ids[1],
                confidence: 90
            }
        );
        let verdict = set.verdict(95);
        assert!(!verdict.is_confident());
        assert!(matches!(
            verdict.require_confident(),
            Err(RecoveryError::Inconclusive { confidence: 90, required: 95, .. })
        ));

        let empty: HypothesisSet<()> = HypothesisSet::new();
        assert!(matches!(
            empty.verdict(0),
            Verdict::Inconclusive { best: None, .. }
        ));
    }
}
