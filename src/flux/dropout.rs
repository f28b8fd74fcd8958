//! Dropout detection and recovery, weak-zone detection and classification

use serde::{Deserialize, Serialize};

use crate::config::{DropoutConfig, PllConfig, WeakZoneConfig};
use crate::flux::pll::AdaptivePll;
use crate::types::{FluxSample, Revolution, SampleFlags};

/// A span with no flux transitions for longer than the gap threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropoutRegion {
    pub revolution: u16,
    /// Index of the sample that closes the gap
    pub start_sample: usize,
    pub start_ns: u64,
    pub end_ns: u64,
    /// Gap length in nominal cells
    pub severity: f64,
    pub recovered: bool,
    pub recovered_from: Option<u16>,
    pub recovered_intervals: Vec<u32>,
    pub recovered_bits: Vec<u8>,
}

impl DropoutRegion {
    pub fn duration_ns(&self) -> u64 {
        self.end_ns - self.start_ns
    }
}

pub fn detect_dropouts(
    revolution: &Revolution,
    nominal_cell_ns: f64,
    config: &DropoutConfig,
) -> Vec<DropoutRegion> {
    if nominal_cell_ns <= 0.0 {
        return Vec::new();
    }
    let limit = config.gap_multiple * nominal_cell_ns;
    let mut previous = 0u64;
    let mut regions = Vec::new();

    for (i, sample) in revolution.samples().iter().enumerate() {
        let gap = (sample.timestamp_ns - previous) as f64;
        if gap > limit {
            regions.push(DropoutRegion {
                revolution: revolution.index(),
                start_sample: i,
                start_ns: previous,
                end_ns: sample.timestamp_ns,
                severity: gap / nominal_cell_ns,
                recovered: false,
                recovered_from: None,
                recovered_intervals: Vec::new(),
                recovered_bits: Vec::new(),
            });
        }
        previous = sample.timestamp_ns;
    }
    regions
}

/// Index of the sample nearest `target`; index 0 stands for the index pulse
fn nearest_boundary(samples: &[FluxSample], target: u64) -> (usize, u64) {
    let pos = samples.partition_point(|s| s.timestamp_ns < target);
    let boundary = |i: usize| if i == 0 { 0 } else { samples[i - 1].timestamp_ns };
    // Boundaries are indexed 0..=len, where boundary i is sample i - 1
    let candidates = [pos, pos + 1];
    candidates
        .iter()
        .filter(|&&i| i <= samples.len())
        .map(|&i| (i, boundary(i)))
        .min_by_key(|&(_, t)| t.abs_diff(target))
        .unwrap_or((0, 0))
}

/// Fill each dropout from the best matching span of another revolution
///
/// Candidates are tried in order of capture quality. A span qualifies only if
/// it contains no gap of its own and its duration and end points agree with
/// the dropout within `span_tolerance_cells`.
pub fn recover_dropouts(
    regions: &mut [DropoutRegion],
    others: &[&Revolution],
    nominal_cell_ns: f64,
    pll_config: &PllConfig,
    config: &DropoutConfig,
) -> usize {
    let mut ranked: Vec<&Revolution> = others.to_vec();
    ranked.sort_by(|a, b| b.quality().total_cmp(&a.quality()));
    let tolerance = config.span_tolerance_cells * nominal_cell_ns;
    let gap_limit = config.gap_multiple * nominal_cell_ns;
    let mut recovered = 0usize;

    for region in regions.iter_mut().filter(|r| !r.recovered) {
        for candidate in &ranked {
            if candidate.index() == region.revolution {
                continue;
            }
            let samples = candidate.samples();
            let (from, from_ns) = nearest_boundary(samples, region.start_ns);
            let (to, to_ns) = nearest_boundary(samples, region.end_ns);
            if to <= from
                || from_ns.abs_diff(region.start_ns) as f64 > tolerance
                || to_ns.abs_diff(region.end_ns) as f64 > tolerance
            {
                continue;
            }

            let mut previous = from_ns;
            let intervals: Vec<u32> = samples[from..to]
                .iter()
                .map(|s| {
                    let interval = s.timestamp_ns - previous;
                    previous = s.timestamp_ns;
                    interval.min(u32::MAX as u64) as u32
                })
                .collect();
            if intervals.iter().any(|&i| i as f64 > gap_limit) {
                continue;
            }
            let duration = to_ns - from_ns;
            if duration.abs_diff(region.duration_ns()) as f64 > tolerance {
                continue;
            }

            let mut pll = AdaptivePll::new(nominal_cell_ns, pll_config.clone());
            region.recovered_bits = pll.decode(&intervals).bits;
            region.recovered_intervals = intervals;
            region.recovered_from = Some(candidate.index());
            region.recovered = true;
            recovered += 1;
            log::debug!(
                "dropout at {} ns in revolution {} filled from revolution {}",
                region.start_ns,
                region.revolution,
                candidate.index()
            );
            break;
        }
    }
    recovered
}

/// Copy of the revolution's samples with recovered spans spliced in
pub fn apply_recovery(revolution: &Revolution, regions: &[DropoutRegion]) -> Vec<FluxSample> {
    let samples = revolution.samples();
    let mut output = Vec::with_capacity(samples.len());

    for (i, sample) in samples.iter().enumerate() {
        let gap = regions.iter().find(|r| r.start_sample == i);
        let Some(region) = gap else {
            let closes_next_gap = regions.iter().any(|r| r.start_sample == i + 1);
            output.push(if closes_next_gap {
                sample.with_flags(SampleFlags::DROPOUT)
            } else {
                *sample
            });
            continue;
        };

        if region.recovered {
            let source = region.recovered_from.unwrap_or(region.revolution);
            let mut timestamp = region.start_ns;
            for &interval in &region.recovered_intervals {
                timestamp += interval as u64;
                if timestamp >= region.end_ns {
                    break;
                }
                output.push(FluxSample {
                    timestamp_ns: timestamp,
                    confidence: sample.confidence.min(90),
                    revolution: source,
                    flags: SampleFlags::INTERPOLATED,
                });
            }
        }
        output.push(sample.with_flags(SampleFlags::DROPOUT));
    }
    output
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeakZoneClass {
    RandomDecay,
    LikelyProtection,
}

/// A run of bit positions where revolutions disagree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeakZone {
    pub start_bit: usize,
    /// Exclusive
    pub end_bit: usize,
    pub avg_confidence: u8,
    /// Share of ones among the voted values in the zone
    pub bias: f64,
    pub class: WeakZoneClass,
}

impl WeakZone {
    pub fn len(&self) -> usize {
        self.end_bit - self.start_bit
    }

    pub fn is_empty(&self) -> bool {
        self.end_bit == self.start_bit
    }

    pub fn contains(&self, bit: usize) -> bool {
        (self.start_bit..self.end_bit).contains(&bit)
    }
}

pub fn detect_weak_zones(
    variability: &[f64],
    values: &[u8],
    confidences: &[u8],
    config: &WeakZoneConfig,
) -> Vec<WeakZone> {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for (pos, &v) in variability.iter().enumerate() {
        if v <= config.variability_threshold {
            continue;
        }
        match spans.last_mut() {
            Some(last) if pos - last.1 <= config.merge_gap => last.1 = pos + 1,
            _ => spans.push((pos, pos + 1)),
        }
    }

    spans
        .into_iter()
        .map(|(start, end)| {
            let len = (end - start) as f64;
            let confidence: f64 = confidences
                .get(start..end)
                .map(|c| c.iter().map(|&x| x as f64).sum())
                .unwrap_or(0.0);
            let ones = values
                .get(start..end)
                .map(|v| v.iter().filter(|&&b| b == 1).count())
                .unwrap_or(0);
            WeakZone {
                start_bit: start,
                end_bit: end,
                avg_confidence: (confidence / len).round() as u8,
                bias: ones as f64 / len,
                class: WeakZoneClass::RandomDecay,
            }
        })
        .collect()
}

/// Label zones as decay or probable protection; zones are never dropped
pub fn classify_weak_zones(zones: &mut [WeakZone], track_bits: usize, config: &WeakZoneConfig) {
    let periodic = zones.len() >= 3 && {
        let spacings: Vec<f64> = zones
            .windows(2)
            .map(|w| (w[1].start_bit - w[0].start_bit) as f64)
            .collect();
        let mean = spacings.iter().sum::<f64>() / spacings.len() as f64;
        let variance =
            spacings.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / spacings.len() as f64;
        mean > 0.0 && variance.sqrt() / mean <= config.periodicity_tolerance
    };

    for zone in zones.iter_mut() {
        let aligned = track_bits > 0
            && config.protection_positions.iter().any(|&position| {
                let at = zone.start_bit as f64 / track_bits as f64;
                (at - position).abs() <= config.alignment_tolerance
            });
        let long_balanced = zone.len() >= config.long_zone_bits
            && (config.balanced_bias_min..=config.balanced_bias_max).contains(&zone.bias);

        zone.class = if periodic || aligned || long_balanced {
            WeakZoneClass::LikelyProtection
        } else {
            WeakZoneClass::RandomDecay
        };
    }
}
