//! Sync mark location and reconstruction

use serde::{Deserialize, Serialize};

use crate::bitstream::encoding::{read_word, word_bits, Encoding};
use crate::config::SyncConfig;

pub const MFM_A1: u16 = 0x4489;
pub const MFM_C2: u16 = 0x5224;
pub const FM_IDAM: u16 = 0xF57E;
pub const FM_DAM: u16 = 0xF56F;
pub const FM_DELETED_DAM: u16 = 0xF56A;
pub const FM_IAM: u16 = 0xF77A;
/// Shortest run of ones that counts as a GCR sync
pub const GCR_SYNC_MIN_ONES: usize = 10;

const MFM_GROUP_LEN: usize = 3;
const MARK_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMark {
    MfmA1,
    MfmC2,
    FmIdam,
    FmDam,
    FmDeletedDam,
    FmIam,
    GcrSync,
}

impl SyncMark {
    fn patterns(encoding: Encoding) -> &'static [(u16, SyncMark)] {
        match encoding {
            Encoding::Mfm => &[(MFM_A1, SyncMark::MfmA1), (MFM_C2, SyncMark::MfmC2)],
            Encoding::Fm => &[
                (FM_IDAM, SyncMark::FmIdam),
                (FM_DAM, SyncMark::FmDam),
                (FM_DELETED_DAM, SyncMark::FmDeletedDam),
                (FM_IAM, SyncMark::FmIam),
            ],
            Encoding::Gcr => &[],
        }
    }
}

/// A sync either read as-is or reconstructed; never both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOrigin {
    Original,
    Reconstructed { distance: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMatch {
    pub offset: usize,
    pub pattern: u32,
    pub pattern_len: usize,
    pub mark: SyncMark,
    pub encoding: Encoding,
    pub confidence: u8,
    pub origin: SyncOrigin,
}

impl SyncMatch {
    pub fn end(&self) -> usize {
        self.offset + self.pattern_len
    }

    pub fn is_reconstructed(&self) -> bool {
        matches!(self.origin, SyncOrigin::Reconstructed { .. })
    }

    pub fn contains(&self, bit: usize) -> bool {
        bit >= self.offset && bit < self.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReconstruction {
    pub matches: Vec<SyncMatch>,
    pub repaired_bits: Vec<u8>,
    pub reconstructed: usize,
}

/// Exact scan for the encoding's sync patterns
pub fn locate_syncs(bits: &[u8], encoding: Encoding) -> Vec<SyncMatch> {
    let mut found = Vec::new();
    if encoding == Encoding::Gcr {
        let mut i = 0;
        while i < bits.len() {
            if bits[i] == 0 {
                i += 1;
                continue;
            }
            let run = bits[i..].iter().take_while(|&&b| b == 1).count();
            if run >= GCR_SYNC_MIN_ONES {
                found.push(SyncMatch {
                    offset: i,
                    pattern: u32::MAX >> (32 - run.min(32)),
                    pattern_len: run,
                    mark: SyncMark::GcrSync,
                    encoding,
                    confidence: 100,
                    origin: SyncOrigin::Original,
                });
            }
            i += run;
        }
        return found;
    }

    let patterns = SyncMark::patterns(encoding);
    let mut i = 0;
    while i + MARK_LEN <= bits.len() {
        let word = read_word(bits, i, MARK_LEN).unwrap_or_default();
        match patterns.iter().find(|(p, _)| *p as u32 == word) {
            Some(&(pattern, mark)) => {
                found.push(SyncMatch {
                    offset: i,
                    pattern: pattern as u32,
                    pattern_len: MARK_LEN,
                    mark,
                    encoding,
                    confidence: 100,
                    origin: SyncOrigin::Original,
                });
                i += MARK_LEN;
            }
            None => i += 1,
        }
    }
    found
}

fn distance_at(bits: &[u8], offset: usize, pattern: u32) -> Option<u32> {
    read_word(bits, offset, MARK_LEN).map(|word| (word ^ pattern).count_ones())
}

fn overlaps(matches: &[SyncMatch], offset: usize) -> bool {
    matches
        .iter()
        .any(|m| offset < m.end() && m.offset < offset + MARK_LEN)
}

fn reconstructed(template: &SyncMatch, offset: usize, distance: u32) -> SyncMatch {
    SyncMatch {
        offset,
        origin: SyncOrigin::Reconstructed { distance },
        confidence: 90u8.saturating_sub(20 * distance.min(4) as u8),
        ..template.clone()
    }
}

/// Starts of runs of identical marks spaced one mark apart
fn group_starts(matches: &[SyncMatch]) -> Vec<usize> {
    let mut starts = Vec::new();
    for (i, m) in matches.iter().enumerate() {
        let continues = i > 0 && {
            let prev = &matches[i - 1];
            prev.mark == m.mark && m.offset == prev.offset + MARK_LEN
        };
        if !continues {
            starts.push(i);
        }
    }
    starts
}

/// Fill out MFM groups that lost one or two of their three marks
fn complete_groups(bits: &[u8], matches: &mut Vec<SyncMatch>, config: &SyncConfig) {
    let mut changed = true;
    while changed {
        changed = false;
        matches.sort_by_key(|m| m.offset);
        let starts = group_starts(matches);
        for (n, &start) in starts.iter().enumerate() {
            let end = starts.get(n + 1).copied().unwrap_or(matches.len());
            let size = end - start;
            if size >= MFM_GROUP_LEN || matches[start].mark != SyncMark::MfmA1 {
                continue;
            }
            let template = matches[start].clone();
            let last = matches[end - 1].offset;
            let candidates = [Some(last + MARK_LEN), template.offset.checked_sub(MARK_LEN)];
            for offset in candidates.into_iter().flatten() {
                if overlaps(matches, offset) {
                    continue;
                }
                if let Some(distance) = distance_at(bits, offset, template.pattern) {
                    if distance <= config.max_distance {
                        matches.push(reconstructed(&template, offset, distance));
                        changed = true;
                        break;
                    }
                }
            }
            if changed {
                break;
            }
        }
    }
}

fn median(values: &mut [usize]) -> usize {
    values.sort_unstable();
    values[values.len() / 2]
}

/// Period between group starts at lag 1 or 2, if one is well supported
fn group_period(starts: &[usize], config: &SyncConfig) -> Option<usize> {
    for lag in 1..=2 {
        if starts.len() < lag + 2 {
            continue;
        }
        let mut sums: Vec<usize> = starts.windows(lag + 1).map(|w| w[lag] - w[0]).collect();
        let period = median(&mut sums);
        let support = sums
            .iter()
            .filter(|&&s| s.abs_diff(period) <= config.search_tolerance)
            .count() as f64
            / sums.len() as f64;
        if support >= config.min_period_support && period > config.search_tolerance {
            return Some(period);
        }
    }
    None
}

fn predict_groups(bits: &[u8], matches: &mut Vec<SyncMatch>, config: &SyncConfig) -> bool {
    matches.sort_by_key(|m| m.offset);
    let starts: Vec<usize> = group_starts(matches)
        .into_iter()
        .map(|i| matches[i].offset)
        .collect();
    let Some(period) = group_period(&starts, config) else {
        return false;
    };

    let mut added = false;
    let mut worklist: Vec<SyncMatch> = group_starts(matches)
        .into_iter()
        .map(|i| matches[i].clone())
        .collect();
    while let Some(anchor) = worklist.pop() {
        let forward = Some(anchor.offset + period);
        let backward = anchor.offset.checked_sub(period);
        for predicted in [forward, backward].into_iter().flatten() {
            if predicted + MARK_LEN > bits.len() {
                continue;
            }
            let lo = predicted.saturating_sub(config.search_tolerance);
            let hi = predicted + config.search_tolerance;
            if matches.iter().any(|m| m.offset >= lo && m.offset <= hi) {
                continue;
            }
            let best = (lo..=hi)
                .filter(|&o| !overlaps(matches, o))
                .filter_map(|o| distance_at(bits, o, anchor.pattern).map(|d| (d, o.abs_diff(predicted), o)))
                .min();
            if let Some((distance, _, offset)) = best {
                if distance <= config.max_distance {
                    let found = reconstructed(&anchor, offset, distance);
                    matches.push(found.clone());
                    worklist.push(found);
                    added = true;
                }
            }
        }
    }
    added
}

/// Complete damaged mark groups and predict missing groups from the
/// track's sector period; repairs apply to a copy
pub fn reconstruct_syncs(
    bits: &[u8],
    encoding: Encoding,
    found: &[SyncMatch],
    config: &SyncConfig,
) -> SyncReconstruction {
    let mut matches = found.to_vec();
    if encoding != Encoding::Gcr && !matches.is_empty() {
        if encoding == Encoding::Mfm {
            complete_groups(bits, &mut matches, config);
        }
        if predict_groups(bits, &mut matches, config) && encoding == Encoding::Mfm {
            complete_groups(bits, &mut matches, config);
        }
    }
    matches.sort_by_key(|m| m.offset);

    let mut repaired_bits = bits.to_vec();
    let mut reconstructed = 0;
    for m in matches.iter().filter(|m| m.is_reconstructed()) {
        let cells = word_bits(m.pattern as u16);
        repaired_bits[m.offset..m.offset + MARK_LEN].copy_from_slice(&cells);
        reconstructed += 1;
    }

    SyncReconstruction {
        matches,
        repaired_bits,
        reconstructed,
    }
}
