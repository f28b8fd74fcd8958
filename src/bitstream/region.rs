//! Region segmentation and mixed-encoding separation

use serde::{Deserialize, Serialize};

use crate::bitstream::encoding::{best_parity, violation_mask, violation_rate, Encoding};
use crate::config::RegionConfig;

/// Confidence below which a region is re-decoded on its own
const REDECODE_CONFIDENCE: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryKind {
    Start,
    EncodingChange,
    TimingBreak,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitstreamRegion {
    pub start_bit: usize,
    pub end_bit: usize,
    pub encoding: Option<Encoding>,
    pub confidence: u8,
    pub needs_redecode: bool,
    pub boundary: BoundaryKind,
}

impl BitstreamRegion {
    pub fn new(start_bit: usize, end_bit: usize, encoding: Option<Encoding>) -> Self {
        Self {
            start_bit,
            end_bit,
            encoding,
            confidence: if encoding.is_some() { 100 } else { 0 },
            needs_redecode: encoding.is_none(),
            boundary: BoundaryKind::Start,
        }
    }

    pub fn len(&self) -> usize {
        self.end_bit - self.start_bit
    }

    pub fn is_empty(&self) -> bool {
        self.end_bit <= self.start_bit
    }

    fn finish(&mut self, bits: &[u8]) {
        self.confidence = match self.encoding {
            Some(encoding) => {
                let rate = violation_rate(&bits[self.start_bit..self.end_bit], encoding);
                (100.0 * (1.0 - rate * 10.0)).clamp(0.0, 100.0).round() as u8
            }
            None => 0,
        };
        self.needs_redecode = self.encoding.is_none()
            || self.confidence < REDECODE_CONFIDENCE
            || self.boundary == BoundaryKind::TimingBreak;
    }
}

fn classify_window(window: &[u8], config: &RegionConfig) -> Option<Encoding> {
    Encoding::PREFERENCE
        .into_iter()
        .find(|&encoding| violation_rate(window, encoding) <= config.max_violation_rate)
}

fn window_ranges(len: usize, window: usize) -> Vec<(usize, usize)> {
    let window = window.max(1);
    let mut ranges: Vec<(usize, usize)> = (0..len)
        .step_by(window)
        .map(|start| (start, (start + window).min(len)))
        .collect();
    // A short tail joins the window before it
    if ranges.len() > 1 {
        if let Some(&(start, end)) = ranges.last() {
            if end - start < window / 2 {
                ranges.pop();
                if let Some(last) = ranges.last_mut() {
                    last.1 = end;
                }
            }
        }
    }
    ranges
}

/// Split a stream where its encoding signature or cell timing changes
///
/// `cell_trace` holds the PLL cell width per bit; pass an empty slice when
/// only the bits are known.
pub fn segment(bits: &[u8], cell_trace: &[f64], config: &RegionConfig) -> Vec<BitstreamRegion> {
    if bits.is_empty() {
        return Vec::new();
    }
    let timed = cell_trace.len() == bits.len();

    let mut regions: Vec<BitstreamRegion> = Vec::new();
    let mut previous_cell: Option<f64> = None;
    for (start, end) in window_ranges(bits.len(), config.window_bits) {
        let encoding = classify_window(&bits[start..end], config);
        let mean_cell = timed.then(|| {
            cell_trace[start..end].iter().sum::<f64>() / (end - start) as f64
        });

        let boundary = match regions.last() {
            None => Some(BoundaryKind::Start),
            Some(current) if current.encoding != encoding => Some(BoundaryKind::EncodingChange),
            Some(_) => match (previous_cell, mean_cell) {
                (Some(prev), Some(cell))
                    if prev > 0.0 && (cell - prev).abs() / prev > config.timing_break_ratio =>
                {
                    Some(BoundaryKind::TimingBreak)
                }
                _ => None,
            },
        };
        previous_cell = mean_cell;

        match boundary {
            Some(kind) => {
                let mut region = BitstreamRegion::new(start, end, encoding);
                region.boundary = kind;
                regions.push(region);
            }
            None => {
                if let Some(current) = regions.last_mut() {
                    current.end_bit = end;
                }
            }
        }
    }

    for region in &mut regions {
        region.finish(bits);
    }
    regions
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingSegment {
    pub start_bit: usize,
    pub end_bit: usize,
    pub encoding: Option<Encoding>,
}

fn prefix_counts(mask: &[bool]) -> Vec<usize> {
    let mut prefix = Vec::with_capacity(mask.len() + 1);
    prefix.push(0);
    for &v in mask {
        prefix.push(prefix[prefix.len() - 1] + usize::from(v));
    }
    prefix
}

/// Encoding runs with the switch points refined to the bit
///
/// Runs no longer than one window that sit between two other runs are
/// treated as transition windows; each switch between two known encodings
/// is then placed where violations on either side are fewest.
pub fn separate_mixed_encoding(bits: &[u8], config: &RegionConfig) -> Vec<EncodingSegment> {
    let regions = segment(bits, &[], config);
    let window = config.window_bits.max(1);

    let mut runs: Vec<EncodingSegment> = Vec::new();
    for (i, region) in regions.iter().enumerate() {
        let transitional = i > 0 && i + 1 < regions.len() && region.len() <= window;
        if transitional {
            continue;
        }
        match runs.last_mut() {
            Some(last) if last.encoding == region.encoding => last.end_bit = region.end_bit,
            _ => runs.push(EncodingSegment {
                start_bit: region.start_bit,
                end_bit: region.end_bit,
                encoding: region.encoding,
            }),
        }
    }

    for i in 1..runs.len() {
        let (left, right) = (runs[i - 1], runs[i]);
        let split = match (left.encoding, right.encoding) {
            (Some(a), Some(b)) => {
                let left_mask = violation_mask(
                    bits,
                    a,
                    best_parity(&bits[left.start_bit..left.end_bit], a) + left.start_bit,
                );
                let right_mask = violation_mask(
                    bits,
                    b,
                    best_parity(&bits[right.start_bit..right.end_bit], b) + right.start_bit,
                );
                let left_prefix = prefix_counts(&left_mask);
                let right_prefix = prefix_counts(&right_mask);

                let lo = left.end_bit.saturating_sub(window).max(left.start_bit + 1);
                let hi = (right.start_bit + window).min(right.end_bit.saturating_sub(1));
                (lo..=hi.max(lo))
                    .map(|s| {
                        let cost = (left_prefix[s] - left_prefix[left.start_bit])
                            + (right_prefix[right.end_bit] - right_prefix[s]);
                        (cost, s)
                    })
                    .min()
                    .map(|(_, s)| s)
                    .unwrap_or(right.start_bit)
            }
            _ => (left.end_bit + right.start_bit) / 2,
        };
        runs[i - 1].end_bit = split;
        runs[i].start_bit = split;
    }
    runs
}
