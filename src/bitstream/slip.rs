//! Bit-slip detection by clock-parity tracking, and verified correction

use serde::{Deserialize, Serialize};

use crate::bitstream::encoding::{clock_violations, violation_count, Encoding};
use crate::bitstream::sync::locate_syncs;
use crate::config::SlipConfig;
use crate::error::{RecoveryError, Result};

/// One localised slip, in the coordinates of the uncorrected stream
///
/// `amount` is +1 for a spurious extra cell (fixed by deleting `offset`) and
/// -1 for a lost cell (fixed by inserting `fill_value` at `offset`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitSlip {
    pub offset: usize,
    pub amount: i8,
    pub fill_value: u8,
    pub confidence: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Delete,
    Insert(u8),
}

/// Structural health of a stream; higher `value` is better
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuralScore {
    pub violations: usize,
    pub syncs: usize,
    /// 1.0 for perfectly even sync spacing
    pub regularity: f64,
}

impl StructuralScore {
    pub fn measure(bits: &[u8], encoding: Encoding) -> Self {
        let syncs = locate_syncs(bits, encoding);
        let offsets: Vec<usize> = syncs.iter().map(|s| s.offset).collect();
        Self {
            violations: violation_count(bits, encoding),
            syncs: syncs.len(),
            regularity: spacing_regularity(&offsets),
        }
    }

    pub fn value(&self) -> i64 {
        self.syncs as i64 * 2 + (self.regularity * 10.0).round() as i64 - self.violations as i64 * 4
    }
}

fn spacing_regularity(offsets: &[usize]) -> f64 {
    if offsets.len() < 3 {
        return 0.0;
    }
    let spacings: Vec<f64> = offsets.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    let mean = spacings.iter().sum::<f64>() / spacings.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = spacings.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / spacings.len() as f64;
    (1.0 - variance.sqrt() / mean).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlipCorrection {
    pub bits: Vec<u8>,
    pub slips: Vec<BitSlip>,
    pub before: StructuralScore,
    pub after: StructuralScore,
}

impl SlipCorrection {
    pub fn slip_corrections(&self) -> usize {
        self.slips.len()
    }
}

fn other(parity: usize) -> usize {
    1 - (parity & 1)
}

fn initial_parity(bits: &[u8], encoding: Encoding, config: &SlipConfig) -> usize {
    let mut even = 0usize;
    let mut odd = 0usize;
    let mut start = 0usize;
    while start < bits.len() {
        let end = (start + config.window).min(bits.len());
        even += clock_violations(bits, encoding, 0, start..end);
        odd += clock_violations(bits, encoding, 1, start..end);
        if even.abs_diff(odd) >= config.min_margin {
            break;
        }
        start = end;
    }
    usize::from(odd < even)
}

/// First window from `from` where the other parity wins by the margin,
/// with the start of the last window the reference parity clearly held
fn find_flip(
    bits: &[u8],
    encoding: Encoding,
    reference: usize,
    from: usize,
    config: &SlipConfig,
) -> Option<(usize, usize)> {
    let mut last_good = from;
    let mut start = from;
    while start + config.window / 2 < bits.len() {
        let end = (start + config.window).min(bits.len());
        let held = clock_violations(bits, encoding, reference, start..end);
        let flipped = clock_violations(bits, encoding, other(reference), start..end);
        if held >= flipped + config.min_margin {
            return Some((start, last_good));
        }
        if held < flipped {
            last_good = start;
        }
        start = end;
    }
    None
}

/// Violations under `reference` after applying `edit` at `pos` to the
/// window `[lo, eval_end)`
fn edited_violations(
    bits: &[u8],
    encoding: Encoding,
    reference: usize,
    lo: usize,
    eval_end: usize,
    pos: usize,
    edit: Edit,
) -> usize {
    let local_start = lo.saturating_sub(1);
    let local_end = (eval_end + 1).min(bits.len());
    let mut local = bits[local_start..local_end].to_vec();
    let at = pos - local_start;
    match edit {
        Edit::Delete => {
            local.remove(at);
        }
        Edit::Insert(fill) => local.insert(at, fill),
    }
    let parity = (reference + local_start) % 2;
    let end = local.len().saturating_sub(1);
    clock_violations(&local, encoding, parity, (lo - local_start)..end)
}

/// Exhaustive single-edit search; deletions win ties
fn localise(
    bits: &[u8],
    encoding: Encoding,
    reference: usize,
    lo: usize,
    hi: usize,
    config: &SlipConfig,
) -> Option<(usize, Edit, u8)> {
    let eval_end = (hi + config.window).min(bits.len());
    let base = clock_violations(bits, encoding, reference, lo..eval_end);

    let mut best_delete: Option<(usize, usize)> = None;
    let mut best_insert: Option<(usize, usize, u8)> = None;
    for pos in lo..hi {
        let deleted = edited_violations(bits, encoding, reference, lo, eval_end, pos, Edit::Delete);
        if best_delete.map_or(true, |(v, _)| deleted < v) {
            best_delete = Some((deleted, pos));
        }
        for fill in [0u8, 1u8] {
            let inserted =
                edited_violations(bits, encoding, reference, lo, eval_end, pos, Edit::Insert(fill));
            if best_insert.map_or(true, |(v, _, _)| inserted < v) {
                best_insert = Some((inserted, pos, fill));
            }
        }
    }

    let (violations, pos, edit) = match (best_delete, best_insert) {
        (Some((d, dp)), Some((i, _, _))) if d <= i => (d, dp, Edit::Delete),
        (_, Some((i, ip, fill))) => (i, ip, Edit::Insert(fill)),
        (Some((d, dp)), None) => (d, dp, Edit::Delete),
        (None, None) => return None,
    };

    if violations + config.min_margin > base {
        return None;
    }
    let confidence = ((base - violations) as f64 / base.max(1) as f64 * 100.0).round() as u8;
    Some((pos, edit, confidence))
}

pub fn detect_slips(bits: &[u8], encoding: Encoding, config: &SlipConfig) -> Vec<BitSlip> {
    if !encoding.has_clock() || config.window == 0 || bits.len() < config.window * 2 {
        return Vec::new();
    }

    let reference = initial_parity(bits, encoding, config);
    let mut work = bits.to_vec();
    let mut slips = Vec::new();
    // original offset = working offset + shift
    let mut shift: isize = 0;
    let mut scan_from = 0usize;

    while slips.len() < config.max_slips {
        let Some((flip_start, last_good)) = find_flip(&work, encoding, reference, scan_from, config)
        else {
            break;
        };
        let lo = last_good.max(scan_from);
        let hi = (flip_start + config.window).min(work.len());

        match localise(&work, encoding, reference, lo, hi, config) {
            Some((pos, edit, confidence)) => {
                let offset = (pos as isize + shift).max(0) as usize;
                match edit {
                    Edit::Delete => {
                        work.remove(pos);
                        slips.push(BitSlip {
                            offset,
                            amount: 1,
                            fill_value: 0,
                            confidence,
                        });
                        shift += 1;
                    }
                    Edit::Insert(fill) => {
                        work.insert(pos, fill);
                        slips.push(BitSlip {
                            offset,
                            amount: -1,
                            fill_value: fill,
                            confidence,
                        });
                        shift -= 1;
                    }
                }
                scan_from = pos;
            }
            // A flip no single edit explains, e.g. inside a mark
            None => scan_from = flip_start + config.window,
        }
    }
    slips
}

/// Apply slips to a copy of the stream
pub fn correct_slips(bits: &[u8], slips: &[BitSlip]) -> Vec<u8> {
    let mut corrected = bits.to_vec();
    let mut ordered: Vec<&BitSlip> = slips.iter().collect();
    ordered.sort_by(|a, b| b.offset.cmp(&a.offset));
    for slip in ordered {
        if slip.amount > 0 {
            if slip.offset < corrected.len() {
                corrected.remove(slip.offset);
            }
        } else {
            corrected.insert(slip.offset.min(corrected.len()), slip.fill_value & 1);
        }
    }
    corrected
}

/// Detect and correct slips, keeping the result only if the stream's
/// structure measurably improves
pub fn correct_and_verify(
    bits: &[u8],
    encoding: Encoding,
    config: &SlipConfig,
) -> Result<SlipCorrection> {
    let before = StructuralScore::measure(bits, encoding);
    let slips = detect_slips(bits, encoding, config);
    if slips.is_empty() {
        return Ok(SlipCorrection {
            bits: bits.to_vec(),
            slips,
            before,
            after: before,
        });
    }

    let corrected = correct_slips(bits, &slips);
    let after = StructuralScore::measure(&corrected, encoding);
    if after.value() <= before.value() {
        return Err(RecoveryError::StructuralViolation {
            stage: "bit-slip",
            before: before.value(),
            after: after.value(),
        });
    }
    Ok(SlipCorrection {
        bits: corrected,
        slips,
        before,
        after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::encoding::mfm_encode;

    fn random_mfm(bytes: usize, seed: u32) -> Vec<u8> {
        let mut state = seed;
        let data: Vec<u8> = (0..bytes)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect();
        mfm_encode(&data, 0)
    }

    #[test]
    fn test_clean_stream_has_no_slips() {
        let bits = random_mfm(256, 11);
        assert!(detect_slips(&bits, Encoding::Mfm, &SlipConfig::default()).is_empty());
        let correction = correct_and_verify(&bits, Encoding::Mfm, &SlipConfig::default()).unwrap();
        assert_eq!(correction.slip_corrections(), 0);
        assert_eq!(correction.bits, bits);
    }

    #[test]
    fn test_inserted_cell_is_removed() {
        let original = random_mfm(256, 5);
        let at = (2000..original.len()).find(|&i| original[i] == 1).unwrap();
        let mut slipped = original.clone();
        slipped.insert(at + 1, 1);

        let correction = correct_and_verify(&slipped, Encoding::Mfm, &SlipConfig::default()).unwrap();
        assert_eq!(correction.slip_corrections(), 1);
        assert_eq!(correction.slips[0].amount, 1);
        assert_eq!(correction.bits, original);
        assert!(correction.after.value() > correction.before.value());
    }

    #[test]
    fn test_dropped_cell_is_restored_structurally() {
        let original = random_mfm(256, 9);
        let mut slipped = original.clone();
        slipped.remove(1501);

        assert!(violation_count(&slipped, Encoding::Mfm) > 0);
        let slips = detect_slips(&slipped, Encoding::Mfm, &SlipConfig::default());
        assert_eq!(slips.len(), 1);
        assert!(slips[0].offset.abs_diff(1501) <= 64);
        let corrected = correct_slips(&slipped, &slips);
        assert_eq!(violation_count(&corrected, Encoding::Mfm), 0);
    }

    #[test]
    fn test_gcr_has_no_slip_detection() {
        let bits = vec![1, 0, 1, 1, 0, 1, 0, 1, 1, 1].repeat(20);
        assert!(detect_slips(&bits, Encoding::Gcr, &SlipConfig::default()).is_empty());
    }

    #[test]
    fn test_correct_slips_reverse_order() {
        let bits = vec![0, 1, 2, 3, 4, 5];
        let slips = [
            BitSlip { offset: 1, amount: 1, fill_value: 0, confidence: 90 },
            BitSlip { offset: 4, amount: -1, fill_value: 1, confidence: 90 },
        ];
        assert_eq!(correct_slips(&bits, &slips), vec![0, 2, 3, 1, 4, 5]);
    }
}
