//! CRC-guided repair of clocked fields that fail their check
//!
//! The least certain data cells of a failing field are flipped one at a
//! time, then in pairs, until the CRC passes. A repair records every cell
//! it changed with the previous value, so it can be undone.

use serde::{Deserialize, Serialize};

use crate::bitstream::crc::crc16;
use crate::bitstream::encoding::{clocked_decode, read_word, Encoding};
use crate::bitstream::fields::{FieldCheck, FieldKind, DATA_MARK, DELETED_DATA_MARK, ID_MARK};
use crate::bitstream::sync::FM_DELETED_DAM;
use crate::config::RepairConfig;

/// Header body: four id bytes and the CRC
const HEADER_BODY_BYTES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellChange {
    pub offset: usize,
    pub before: u8,
    pub after: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRepair {
    /// Sync offset of the repaired field
    pub field_offset: usize,
    pub kind: FieldKind,
    /// Data cells whose value was flipped
    pub flipped: Vec<usize>,
    /// Every changed cell, recomputed MFM clocks included
    pub changes: Vec<CellChange>,
}

impl FieldRepair {
    pub fn apply(&self, bits: &mut [u8]) {
        for change in &self.changes {
            if let Some(bit) = bits.get_mut(change.offset) {
                *bit = change.after;
            }
        }
    }

    pub fn revert(&self, bits: &mut [u8]) {
        for change in &self.changes {
            if let Some(bit) = bits.get_mut(change.offset) {
                *bit = change.before;
            }
        }
    }

    pub fn shifted(mut self, base: usize) -> Self {
        self.field_offset += base;
        for offset in &mut self.flipped {
            *offset += base;
        }
        for change in &mut self.changes {
            change.offset += base;
        }
        self
    }
}

/// Where a field's CRC-covered body sits and the mark bytes that precede it
struct Layout {
    body_start: usize,
    body_bytes: usize,
    prefix: Vec<u8>,
}

impl Layout {
    fn of(bits: &[u8], encoding: Encoding, field: &FieldCheck) -> Option<Self> {
        let body_bytes = match field.kind {
            FieldKind::Header => HEADER_BODY_BYTES,
            FieldKind::Data => field.bytes.len() + 2,
        };
        match encoding {
            Encoding::Mfm => {
                let mark = clocked_decode(bits, field.start_bit, 1)?[0];
                Some(Self {
                    body_start: field.start_bit + 16,
                    body_bytes,
                    prefix: vec![0xA1, 0xA1, 0xA1, mark],
                })
            }
            Encoding::Fm => {
                let mark = match field.kind {
                    FieldKind::Header => ID_MARK,
                    FieldKind::Data if read_word(bits, field.offset, 16) == Some(FM_DELETED_DAM as u32) => {
                        DELETED_DATA_MARK
                    }
                    FieldKind::Data => DATA_MARK,
                };
                Some(Self {
                    body_start: field.start_bit,
                    body_bytes,
                    prefix: vec![mark],
                })
            }
            // GCR checksums are not CRCs and a flipped cell rarely leaves a legal code
            Encoding::Gcr => None,
        }
    }

    fn end(&self) -> usize {
        self.body_start + self.body_bytes * 16
    }

    /// CRC over a copy of the body cells
    fn passes(&self, body: &[u8]) -> bool {
        clocked_decode(body, 0, self.body_bytes)
            .is_some_and(|bytes| crc16(&[&self.prefix[..], &bytes[..]].concat()) == 0)
    }
}

fn passes_with(body: &mut [u8], flips: &[usize], layout: &Layout) -> bool {
    for &p in flips {
        body[p] ^= 1;
    }
    let ok = layout.passes(body);
    for &p in flips {
        body[p] ^= 1;
    }
    ok
}

/// Search for the smallest set of doubtful data cells whose flip makes the
/// field's CRC pass
///
/// `confidences` holds one value per cell of `bits`. Only cells at or below
/// `config.max_confidence` are candidates, lowest first.
pub fn repair_field(
    bits: &[u8],
    encoding: Encoding,
    field: &FieldCheck,
    confidences: &[u8],
    config: &RepairConfig,
) -> Option<FieldRepair> {
    if !config.enabled || field.crc_ok || field.bytes.is_empty() || config.max_flips == 0 {
        return None;
    }
    let layout = Layout::of(bits, encoding, field)?;
    let end = layout.end();
    if end > bits.len() || end > confidences.len() {
        return None;
    }

    let mut candidates: Vec<(u8, usize)> = (layout.body_start + 1..end)
        .step_by(2)
        .map(|p| (confidences[p], p))
        .filter(|&(confidence, _)| confidence <= config.max_confidence)
        .collect();
    candidates.sort_unstable();
    candidates.truncate(config.candidates);
    let local: Vec<usize> = candidates.iter().map(|&(_, p)| p - layout.body_start).collect();

    let mut body = bits[layout.body_start..end].to_vec();
    let mut flips = local
        .iter()
        .map(|&a| vec![a])
        .find(|f| passes_with(&mut body, f, &layout));
    if flips.is_none() && config.max_flips >= 2 {
        flips = (0..local.len())
            .flat_map(|i| (i + 1..local.len()).map(move |j| (i, j)))
            .map(|(i, j)| vec![local[i], local[j]])
            .find(|f| passes_with(&mut body, f, &layout));
    }
    let flipped: Vec<usize> = flips?.into_iter().map(|p| p + layout.body_start).collect();

    let mut repaired = bits.to_vec();
    let mut changes: Vec<CellChange> = Vec::new();
    for &p in &flipped {
        changes.push(CellChange {
            offset: p,
            before: repaired[p],
            after: repaired[p] ^ 1,
        });
        repaired[p] ^= 1;
    }
    if encoding == Encoding::Mfm {
        // Clocks either side of a flipped data cell follow the new value
        for &p in &flipped {
            for c in [p - 1, p + 1] {
                if c == 0 || c + 1 >= repaired.len() || changes.iter().any(|ch| ch.offset == c) {
                    continue;
                }
                let expected = u8::from(repaired[c - 1] == 0 && repaired[c + 1] == 0);
                if repaired[c] != expected {
                    changes.push(CellChange {
                        offset: c,
                        before: repaired[c],
                        after: expected,
                    });
                    repaired[c] = expected;
                }
            }
        }
    }

    Some(FieldRepair {
        field_offset: field.offset,
        kind: field.kind,
        flipped,
        changes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::fields::{check_fields, SectorId, TrackWriter};
    use crate::bitstream::sync::locate_syncs;

    fn mfm_track() -> Vec<u8> {
        let mut writer = TrackWriter::new(Encoding::Mfm);
        writer.gap(0x4E, 32);
        for sector in 1..=2u8 {
            let payload: Vec<u8> = (0..128u32).map(|i| (i * 3 + sector as u32) as u8).collect();
            writer.sector(SectorId::new(4, 0, sector, 0), &payload);
        }
        writer.into_bits()
    }

    fn data_field(bits: &[u8], encoding: Encoding) -> FieldCheck {
        let syncs = locate_syncs(bits, encoding);
        check_fields(bits, encoding, &syncs)
            .into_iter()
            .find(|f| f.kind == FieldKind::Data)
            .unwrap()
    }

    #[test]
    fn test_single_doubtful_cell_repaired() {
        let original = mfm_track();
        let start = data_field(&original, Encoding::Mfm).start_bit;
        let at = start + 16 * 10 + 3;
        let mut bits = original.clone();
        bits[at] ^= 1;

        let field = data_field(&bits, Encoding::Mfm);
        assert!(!field.crc_ok);
        let mut confidences = vec![100u8; bits.len()];
        confidences[at] = 40;
        confidences[start + 16 * 30 + 5] = 60;
        confidences[start + 16 * 50 + 9] = 70;

        let repair =
            repair_field(&bits, Encoding::Mfm, &field, &confidences, &RepairConfig::default()).unwrap();
        assert_eq!(repair.flipped, vec![at]);
        assert_eq!(repair.changes.len(), 1);
        repair.apply(&mut bits);
        assert_eq!(bits, original);
        let syncs = locate_syncs(&bits, Encoding::Mfm);
        assert!(check_fields(&bits, Encoding::Mfm, &syncs).iter().all(|f| f.crc_ok));
    }

    #[test]
    fn test_two_doubtful_cells_repaired() {
        let original = mfm_track();
        let start = data_field(&original, Encoding::Mfm).start_bit;
        let (a, b) = (start + 16 * 12 + 1, start + 16 * 40 + 7);
        let mut bits = original.clone();
        bits[a] ^= 1;
        bits[b] ^= 1;

        let field = data_field(&bits, Encoding::Mfm);
        let mut confidences = vec![100u8; bits.len()];
        confidences[a] = 40;
        confidences[b] = 45;

        let repair =
            repair_field(&bits, Encoding::Mfm, &field, &confidences, &RepairConfig::default()).unwrap();
        let mut flipped = repair.flipped.clone();
        flipped.sort_unstable();
        assert_eq!(flipped, vec![a, b]);

        let corrupted = bits.clone();
        repair.apply(&mut bits);
        assert_eq!(bits, original);
        repair.revert(&mut bits);
        assert_eq!(bits, corrupted);
    }

    #[test]
    fn test_single_flip_limit_leaves_double_error() {
        let original = mfm_track();
        let start = data_field(&original, Encoding::Mfm).start_bit;
        let (a, b) = (start + 16 * 12 + 1, start + 16 * 40 + 7);
        let mut bits = original;
        bits[a] ^= 1;
        bits[b] ^= 1;

        let field = data_field(&bits, Encoding::Mfm);
        let mut confidences = vec![100u8; bits.len()];
        confidences[a] = 40;
        confidences[b] = 45;
        let config = RepairConfig {
            max_flips: 1,
            ..RepairConfig::default()
        };
        assert!(repair_field(&bits, Encoding::Mfm, &field, &confidences, &config).is_none());
    }

    #[test]
    fn test_confident_cells_are_never_flipped() {
        let mut bits = mfm_track();
        let start = data_field(&bits, Encoding::Mfm).start_bit;
        bits[start + 16 * 10 + 3] ^= 1;
        let field = data_field(&bits, Encoding::Mfm);
        let confidences = vec![100u8; bits.len()];
        assert!(repair_field(&bits, Encoding::Mfm, &field, &confidences, &RepairConfig::default()).is_none());
    }

    #[test]
    fn test_fm_data_field_repaired() {
        let mut writer = TrackWriter::new(Encoding::Fm);
        writer.gap(0xFF, 16);
        writer.sector(SectorId::new(1, 0, 1, 0), &[0xE5; 128]);
        let original = writer.into_bits();
        let start = data_field(&original, Encoding::Fm).start_bit;
        let at = start + 16 * 5 + 1;
        let mut bits = original.clone();
        bits[at] ^= 1;

        let field = data_field(&bits, Encoding::Fm);
        assert!(!field.crc_ok);
        let mut confidences = vec![100u8; bits.len()];
        confidences[at] = 30;
        let repair =
            repair_field(&bits, Encoding::Fm, &field, &confidences, &RepairConfig::default()).unwrap();
        assert_eq!(repair.flipped, vec![at]);
        repair.apply(&mut bits);
        assert_eq!(bits, original);
    }
}
