//! Composite output: the best-supported version of every field across all
//! valid hypotheses of a track

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::bitstream::{FieldKind, SectorId};
use crate::config::LowConfidencePolicy;
use crate::hypothesis::engine::DecodeHypothesis;
use crate::hypothesis::{Hypothesis, HypothesisSet};
use crate::types::HypothesisId;

/// Where a field sits on the track, independent of any one decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldKey {
    pub kind: FieldKind,
    pub id: Option<SectorId>,
    /// Repeat count of the same kind and ID within one decode
    pub ordinal: u16,
}

impl FieldKey {
    fn sort_key(&self) -> (Option<(u8, u8, u8)>, FieldKind, u16) {
        (
            self.id.map(|id| (id.track, id.head, id.sector)),
            self.kind,
            self.ordinal,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRegion {
    pub key: FieldKey,
    pub source: HypothesisId,
    pub confidence: u8,
    pub crc_ok: bool,
    pub bytes: Vec<u8>,
    pub start_bit: usize,
    pub end_bit: usize,
    /// Other hypotheses that decoded the same field
    pub alternatives: usize,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeDecode {
    pub regions: Vec<MergedRegion>,
    /// Payloads of data fields with a known sector ID, in sector order
    pub bytes: Vec<u8>,
    /// Regions dropped under the discard policy
    pub discarded: usize,
    /// Whole-track hypothesis used when no field could be placed
    pub fallback: Option<HypothesisId>,
    pub confidence: u8,
}

impl CompositeDecode {
    pub fn crc_passes(&self) -> usize {
        self.regions.iter().filter(|r| r.crc_ok).count()
    }

    pub fn low_confidence_regions(&self) -> usize {
        self.regions.iter().filter(|r| r.low_confidence).count()
    }
}

struct Candidate<'a> {
    hypothesis: &'a Hypothesis<DecodeHypothesis>,
    field: usize,
    confidence: u8,
}

impl Candidate<'_> {
    /// Higher confidence, then higher score, then the older hypothesis
    fn beats(&self, other: &Candidate<'_>) -> bool {
        if self.confidence != other.confidence {
            return self.confidence > other.confidence;
        }
        match self.hypothesis.score.total_cmp(&other.hypothesis.score) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.hypothesis.id() < other.hypothesis.id(),
        }
    }
}

/// Pick, for every field position, the version from the hypothesis that
/// supports it best
///
/// A field that fails its CRC counts at half its hypothesis' confidence.
pub fn merge_hypotheses(
    set: &HypothesisSet<DecodeHypothesis>,
    policy: LowConfidencePolicy,
    floor: u8,
) -> CompositeDecode {
    let mut candidates: AHashMap<FieldKey, Vec<Candidate<'_>>> = AHashMap::new();
    for hypothesis in set.all().iter().filter(|h| h.is_valid()) {
        let mut seen: AHashMap<(FieldKind, Option<SectorId>), u16> = AHashMap::new();
        for (index, field) in hypothesis.value.fields.iter().enumerate() {
            let ordinal = seen.entry((field.kind, field.id)).or_insert(0);
            let key = FieldKey {
                kind: field.kind,
                id: field.id,
                ordinal: *ordinal,
            };
            *ordinal += 1;
            let confidence = if field.crc_ok {
                hypothesis.confidence
            } else {
                hypothesis.confidence / 2
            };
            candidates.entry(key).or_default().push(Candidate {
                hypothesis,
                field: index,
                confidence,
            });
        }
    }

    let mut composite = CompositeDecode::default();
    let mut keys: Vec<FieldKey> = candidates.keys().copied().collect();
    keys.sort_by_key(|k| k.sort_key());

    for key in keys {
        let Some(entries) = candidates.get(&key) else {
            continue;
        };
        let Some(winner) = entries
            .iter()
            .fold(None, |best: Option<&Candidate<'_>>, c| match best {
                Some(b) if !c.beats(b) => Some(b),
                _ => Some(c),
            })
        else {
            continue;
        };
        let field = &winner.hypothesis.value.fields[winner.field];
        let low_confidence = winner.confidence < floor;
        if low_confidence && policy == LowConfidencePolicy::Discard {
            composite.discarded += 1;
            continue;
        }
        composite.regions.push(MergedRegion {
            key,
            source: winner.hypothesis.id(),
            confidence: winner.confidence,
            crc_ok: field.crc_ok,
            bytes: field.bytes.clone(),
            start_bit: field.start_bit,
            end_bit: field.end_bit,
            alternatives: entries.len() - 1,
            low_confidence,
        });
    }

    composite.bytes = composite
        .regions
        .iter()
        .filter(|r| r.key.kind == FieldKind::Data && r.key.id.is_some())
        .flat_map(|r| r.bytes.iter().copied())
        .collect();
    if composite.regions.is_empty() {
        composite.fallback = set.best().map(|h| h.id());
        composite.confidence = set.best().map_or(0, |h| h.confidence);
    } else {
        let total: u32 = composite.regions.iter().map(|r| r.confidence as u32).sum();
        composite.confidence = (total / composite.regions.len() as u32) as u8;
    }
    composite
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::{Encoding, FieldCheck};
    use crate::confidence::ConfidenceBreakdown;
    use crate::hypothesis::DecodeAssumption;

    fn field(kind: FieldKind, sector: u8, crc_ok: bool, fill: u8) -> FieldCheck {
        FieldCheck {
            kind,
            offset: 0,
            id: Some(SectorId::new(0, 0, sector, 0)),
            crc_ok,
            bytes: vec![fill; 4],
            start_bit: 0,
            end_bit: 64,
        }
    }

    fn hypothesis(fields: Vec<FieldCheck>) -> DecodeHypothesis {
        DecodeHypothesis {
            assumption: DecodeAssumption::bitstream(Encoding::Mfm),
            bits: Vec::new(),
            records: Vec::new(),
            syncs: Vec::new(),
            slips: Vec::new(),
            slip_rejected: false,
            missing_clocks: Vec::new(),
            restored_clocks: Vec::new(),
            regions: Vec::new(),
            encoding_segments: Vec::new(),
            fields,
            repairs: Vec::new(),
            weak_zones: Vec::new(),
            revolutions_voted: 0,
            breakdown: ConfidenceBreakdown::default(),
            source: None,
            failure: None,
        }
    }

    #[test]
    fn test_each_field_from_its_best_hypothesis() {
        let mut set = HypothesisSet::new();
        let a = set.push(
            hypothesis(vec![
                field(FieldKind::Data, 1, true, 0xAA),
                field(FieldKind::Data, 2, false, 0x11),
            ]),
            10.0,
            80,
        );
        let b = set.push(
            hypothesis(vec![
                field(FieldKind::Data, 1, false, 0x22),
                field(FieldKind::Data, 2, true, 0xBB),
            ]),
            8.0,
            70,
        );

        let composite = merge_hypotheses(&set, LowConfidencePolicy::Preserve, 25);
        assert_eq!(composite.regions.len(), 2);
        assert_eq!(composite.regions[0].source, a);
        assert_eq!(composite.regions[1].source, b);
        assert_eq!(composite.crc_passes(), 2);
        assert_eq!(composite.bytes, [vec![0xAA; 4], vec![0xBB; 4]].concat());
        assert_eq!(composite.regions[0].alternatives, 1);
    }

    #[test]
    fn test_rejected_hypotheses_are_ignored() {
        let mut set = HypothesisSet::new();
        let a = set.push(hypothesis(vec![field(FieldKind::Data, 1, true, 0xAA)]), 1.0, 90);
        set.push(hypothesis(vec![field(FieldKind::Data, 1, true, 0x55)]), 2.0, 60);
        set.reject(a, "test").unwrap();

        let composite = merge_hypotheses(&set, LowConfidencePolicy::Preserve, 25);
        assert_eq!(composite.bytes, vec![0x55; 4]);
    }

    #[test]
    fn test_low_confidence_policy() {
        let mut set = HypothesisSet::new();
        set.push(hypothesis(vec![field(FieldKind::Data, 1, false, 0x01)]), 1.0, 30);

        let kept = merge_hypotheses(&set, LowConfidencePolicy::Preserve, 25);
        assert_eq!(kept.regions.len(), 1);
        assert!(kept.regions[0].low_confidence);
        assert_eq!(kept.regions[0].confidence, 15);

        let dropped = merge_hypotheses(&set, LowConfidencePolicy::Discard, 25);
        assert!(dropped.regions.is_empty());
        assert_eq!(dropped.discarded, 1);
    }

    #[test]
    fn test_fallback_without_fields() {
        let mut set = HypothesisSet::new();
        let id = set.push(hypothesis(Vec::new()), 3.0, 40);
        let composite = merge_hypotheses(&set, LowConfidencePolicy::Preserve, 25);
        assert_eq!(composite.fallback, Some(id));
        assert_eq!(composite.confidence, 40);
    }

    #[test]
    fn test_tie_goes_to_higher_score_then_older() {
        let mut set = HypothesisSet::new();
        set.push(hypothesis(vec![field(FieldKind::Data, 1, true, 0x01)]), 1.0, 80);
        let strong = set.push(hypothesis(vec![field(FieldKind::Data, 1, true, 0x02)]), 5.0, 80);
        set.push(hypothesis(vec![field(FieldKind::Data, 1, true, 0x03)]), 5.0, 80);

        let composite = merge_hypotheses(&set, LowConfidencePolicy::Preserve, 25);
        assert_eq!(composite.regions[0].source, strong);
    }
}
