//! Missing clock detection and restoration for clocked encodings

use serde::{Deserialize, Serialize};

use crate::bitstream::encoding::{best_parity, clock_violations, Encoding};
use crate::bitstream::sync::SyncMatch;

/// Half-width of the neighbourhood checked before restoring a clock
const LOCAL_WINDOW: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingClockKind {
    /// Deliberately omitted inside an address mark
    SyncMark,
    Anomalous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingClock {
    pub offset: usize,
    pub kind: MissingClockKind,
}

fn clock_expected(bits: &[u8], encoding: Encoding, c: usize) -> bool {
    match encoding {
        Encoding::Mfm => c > 0 && c + 1 < bits.len() && bits[c - 1] == 0 && bits[c + 1] == 0,
        Encoding::Fm => true,
        Encoding::Gcr => false,
    }
}

/// Clock cells that should be set but read as zero
pub fn detect_missing_clocks(bits: &[u8], encoding: Encoding, syncs: &[SyncMatch]) -> Vec<MissingClock> {
    if !encoding.has_clock() {
        return Vec::new();
    }
    let parity = best_parity(bits, encoding);
    (parity..bits.len())
        .step_by(2)
        .filter(|&c| bits[c] == 0 && clock_expected(bits, encoding, c))
        .map(|offset| MissingClock {
            offset,
            kind: if syncs.iter().any(|s| s.contains(offset)) {
                MissingClockKind::SyncMark
            } else {
                MissingClockKind::Anomalous
            },
        })
        .collect()
}

fn local_violations(bits: &[u8], encoding: Encoding, c: usize) -> usize {
    let lo = c.saturating_sub(LOCAL_WINDOW);
    let hi = (c + LOCAL_WINDOW + 1).min(bits.len());
    clock_violations(bits, encoding, c % 2, lo..hi)
}

/// Restore anomalous missing clocks on a copy; mark clocks are left alone
///
/// Returns the repaired stream and the offsets actually restored.
pub fn reconstruct_missing_clocks(
    bits: &[u8],
    encoding: Encoding,
    missing: &[MissingClock],
) -> (Vec<u8>, Vec<usize>) {
    let mut repaired = bits.to_vec();
    let mut restored = Vec::new();
    for clock in missing.iter().filter(|m| m.kind == MissingClockKind::Anomalous) {
        if clock.offset >= repaired.len() {
            continue;
        }
        let before = local_violations(&repaired, encoding, clock.offset);
        repaired[clock.offset] = 1;
        let after = local_violations(&repaired, encoding, clock.offset);
        if after <= before {
            restored.push(clock.offset);
        } else {
            repaired[clock.offset] = 0;
        }
    }
    (repaired, restored)
}
