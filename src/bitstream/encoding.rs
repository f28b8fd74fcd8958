//! Raw-cell encodings and their structural rules
//!
//! Raw streams are `Vec<u8>` of 0/1 cells. Clocked encodings (FM, MFM)
//! interleave clock and data cells, clock first.

use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Fm,
    Mfm,
    Gcr,
}

impl Encoding {
    /// Strictest first; used when several encodings fit a window
    pub const PREFERENCE: [Encoding; 3] = [Encoding::Mfm, Encoding::Fm, Encoding::Gcr];

    pub fn has_clock(&self) -> bool {
        matches!(self, Encoding::Fm | Encoding::Mfm)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Fm => "fm",
            Encoding::Mfm => "mfm",
            Encoding::Gcr => "gcr",
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fm" => Ok(Encoding::Fm),
            "mfm" => Ok(Encoding::Mfm),
            "gcr" => Ok(Encoding::Gcr),
            other => Err(format!("unknown encoding '{}'", other)),
        }
    }
}

/// Longest legal zero run in GCR
const GCR_MAX_ZEROS: usize = 2;

/// True when the clock cell at `c` breaks the encoding's clock rule
///
/// MFM clocks are the NOR of the neighbouring data cells; FM clocks are
/// always set outside address marks.
pub fn clock_violation_at(bits: &[u8], encoding: Encoding, c: usize) -> bool {
    match encoding {
        Encoding::Mfm => {
            if c == 0 || c + 1 >= bits.len() {
                return false;
            }
            let expected = u8::from(bits[c - 1] == 0 && bits[c + 1] == 0);
            bits[c] != expected
        }
        Encoding::Fm => c < bits.len() && bits[c] == 0,
        Encoding::Gcr => false,
    }
}

/// Clock-rule violations at positions of the given parity inside `range`
pub fn clock_violations(bits: &[u8], encoding: Encoding, parity: usize, range: Range<usize>) -> usize {
    let end = range.end.min(bits.len());
    let mut start = range.start;
    if start % 2 != parity % 2 {
        start += 1;
    }
    (start..end)
        .step_by(2)
        .filter(|&c| clock_violation_at(bits, encoding, c))
        .count()
}

/// Clock parity with the fewest violations over the whole stream
pub fn best_parity(bits: &[u8], encoding: Encoding) -> usize {
    let even = clock_violations(bits, encoding, 0, 0..bits.len());
    let odd = clock_violations(bits, encoding, 1, 0..bits.len());
    usize::from(odd < even)
}

/// Positions where a GCR zero run exceeds its limit
pub fn gcr_violation_at(bits: &[u8], i: usize) -> bool {
    i >= GCR_MAX_ZEROS && bits[i - GCR_MAX_ZEROS..=i].iter().all(|&b| b == 0)
}

/// Per-position violation indicator under a fixed clock parity
pub fn violation_mask(bits: &[u8], encoding: Encoding, parity: usize) -> Vec<bool> {
    (0..bits.len())
        .map(|i| match encoding {
            Encoding::Gcr => gcr_violation_at(bits, i),
            _ => i % 2 == parity % 2 && clock_violation_at(bits, encoding, i),
        })
        .collect()
}

/// Structural rule violations under the best parity
pub fn violation_count(bits: &[u8], encoding: Encoding) -> usize {
    match encoding {
        Encoding::Gcr => (0..bits.len()).filter(|&i| gcr_violation_at(bits, i)).count(),
        _ => {
            let even = clock_violations(bits, encoding, 0, 0..bits.len());
            let odd = clock_violations(bits, encoding, 1, 0..bits.len());
            even.min(odd)
        }
    }
}

/// Violations per cell, comparable across encodings
pub fn violation_rate(bits: &[u8], encoding: Encoding) -> f64 {
    if bits.is_empty() {
        return 0.0;
    }
    violation_count(bits, encoding) as f64 / bits.len() as f64
}

fn push_byte_bits(out: &mut Vec<u8>, byte: u8) {
    for shift in (0..8).rev() {
        out.push((byte >> shift) & 1);
    }
}

/// Raw cells of a 16-bit mark word
pub fn word_bits(word: u16) -> Vec<u8> {
    (0..16).rev().map(|shift| ((word >> shift) & 1) as u8).collect()
}

/// Value of `len` cells starting at `offset`, MSB first
pub fn read_word(bits: &[u8], offset: usize, len: usize) -> Option<u32> {
    let slice = bits.get(offset..offset + len)?;
    Some(slice.iter().fold(0u32, |acc, &b| (acc << 1) | (b & 1) as u32))
}

pub fn mfm_encode(bytes: &[u8], previous_data: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 16);
    let mut previous = previous_data & 1;
    for &byte in bytes {
        let mut data = Vec::with_capacity(8);
        push_byte_bits(&mut data, byte);
        for d in data {
            out.push(u8::from(previous == 0 && d == 0));
            out.push(d);
            previous = d;
        }
    }
    out
}

/// Data bytes from raw MFM or FM cells starting at a clock cell
pub fn clocked_decode(bits: &[u8], offset: usize, count: usize) -> Option<Vec<u8>> {
    if offset + count * 16 > bits.len() {
        return None;
    }
    Some(
        (0..count)
            .map(|byte| {
                (0..8).fold(0u8, |acc, j| {
                    (acc << 1) | (bits[offset + byte * 16 + 2 * j + 1] & 1)
                })
            })
            .collect(),
    )
}

pub fn fm_encode(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 16);
    for &byte in bytes {
        for shift in (0..8).rev() {
            out.push(1);
            out.push((byte >> shift) & 1);
        }
    }
    out
}

/// Commodore 4-to-5 group code, indexed by nybble
const GCR_TABLE: [u8; 16] = [
    0b01010, 0b01011, 0b10010, 0b10011, 0b01110, 0b01111, 0b10110, 0b10111,
    0b01001, 0b11001, 0b11010, 0b11011, 0b01101, 0b11101, 0b11110, 0b10101,
];

fn gcr_nybble(code: u8) -> Option<u8> {
    GCR_TABLE.iter().position(|&c| c == code).map(|n| n as u8)
}

pub fn gcr_encode(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 10);
    for &byte in bytes {
        for nybble in [byte >> 4, byte & 0x0F] {
            let code = GCR_TABLE[nybble as usize];
            for shift in (0..5).rev() {
                out.push((code >> shift) & 1);
            }
        }
    }
    out
}

/// Decode `count` bytes of GCR; `None` on a short stream or an illegal code
pub fn gcr_decode(bits: &[u8], offset: usize, count: usize) -> Option<Vec<u8>> {
    if offset + count * 10 > bits.len() {
        return None;
    }
    (0..count)
        .map(|byte| {
            let base = offset + byte * 10;
            let high = gcr_nybble(read_word(bits, base, 5)? as u8)?;
            let low = gcr_nybble(read_word(bits, base + 5, 5)? as u8)?;
            Some((high << 4) | low)
        })
        .collect()
}
