//! Flux interval histogram and nominal cell-width estimation

use serde::{Deserialize, Serialize};

use crate::bitstream::Encoding;
use crate::config::HistogramConfig;

/// Ratios of the 3T and 4T classes to the 2T class
const CLASS_RATIOS: [(f64, u8); 2] = [(1.5, 3), (2.0, 4)];

/// Bins either side of a peak used for its centroid
const CENTROID_RADIUS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramPeak {
    pub position_ns: f64,
    pub count: u32,
    /// Interval class in cells (2, 3 or 4); `None` when the ratio fits no class
    pub multiple: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CellEstimate {
    Determined { nominal_cell_ns: f64, variance_ns2: f64 },
    Undetermined,
}

impl CellEstimate {
    pub fn nominal(&self) -> Option<f64> {
        match self {
            CellEstimate::Determined { nominal_cell_ns, .. } => Some(*nominal_cell_ns),
            CellEstimate::Undetermined => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellHistogram {
    pub bin_width_ns: u32,
    pub bins: Vec<u32>,
    pub overflow: u32,
    pub total: usize,
    pub peaks: Vec<HistogramPeak>,
    pub estimate: CellEstimate,
}

impl CellHistogram {
    /// Raw cell width for an encoding, derived from the 2T class
    ///
    /// MFM transitions are at least two raw cells apart, so the cell is half
    /// the shortest peak. FM and GCR place transitions one raw cell apart.
    pub fn cell_width_for(&self, encoding: Encoding) -> Option<f64> {
        self.estimate.nominal().map(|nominal| encoding_cell_width(nominal, encoding))
    }

    pub fn shortest_peak(&self) -> Option<&HistogramPeak> {
        self.peaks.first()
    }

    pub fn is_determined(&self) -> bool {
        matches!(self.estimate, CellEstimate::Determined { .. })
    }
}

/// Raw cell width an encoding decodes at, given the MFM-scale nominal cell
pub fn encoding_cell_width(nominal_cell_ns: f64, encoding: Encoding) -> f64 {
    match encoding {
        Encoding::Mfm => nominal_cell_ns,
        Encoding::Fm | Encoding::Gcr => nominal_cell_ns * 2.0,
    }
}

/// Build the interval histogram, locate peaks and estimate the cell width
pub fn analyze_intervals(intervals: &[u32], config: &HistogramConfig) -> CellHistogram {
    let bin_width = config.bin_width_ns.max(1);
    let bin_count = (config.max_interval_ns / bin_width).max(1) as usize;
    let mut bins = vec![0u32; bin_count];
    let mut overflow = 0u32;

    for &interval in intervals {
        let bin = (interval / bin_width) as usize;
        if bin < bin_count {
            bins[bin] += 1;
        } else {
            overflow += 1;
        }
    }

    let peaks = find_peaks(&bins, bin_width, config);
    let estimate = estimate_cell(intervals, &peaks, config);

    CellHistogram {
        bin_width_ns: bin_width,
        bins,
        overflow,
        total: intervals.len(),
        peaks,
        estimate,
    }
}

fn smooth(bins: &[u32]) -> Vec<f64> {
    (0..bins.len())
        .map(|i| {
            let left = if i > 0 { bins[i - 1] } else { 0 } as f64;
            let right = bins.get(i + 1).copied().unwrap_or(0) as f64;
            (left + 2.0 * bins[i] as f64 + right) / 4.0
        })
        .collect()
}

fn find_peaks(bins: &[u32], bin_width: u32, config: &HistogramConfig) -> Vec<HistogramPeak> {
    let smoothed = smooth(bins);
    let max = smoothed.iter().copied().fold(0.0, f64::max);
    if max <= 0.0 {
        return Vec::new();
    }
    let threshold = (config.min_peak_count as f64).max(config.min_peak_fraction * max);

    // (bin, height) of every local maximum above the threshold
    let mut maxima: Vec<(usize, f64)> = Vec::new();
    for i in 0..smoothed.len() {
        let value = smoothed[i];
        let left = if i > 0 { smoothed[i - 1] } else { 0.0 };
        let right = smoothed.get(i + 1).copied().unwrap_or(0.0);
        if value >= threshold && value >= left && value > right {
            maxima.push((i, value));
        }
    }

    let mut merged: Vec<(usize, f64)> = Vec::new();
    for (bin, height) in maxima {
        match merged.last_mut() {
            Some(last) if bin - last.0 < config.min_peak_separation_bins => {
                if height > last.1 {
                    *last = (bin, height);
                }
            }
            _ => merged.push((bin, height)),
        }
    }

    let mut peaks: Vec<HistogramPeak> = merged
        .into_iter()
        .map(|(bin, _)| {
            let lo = bin.saturating_sub(CENTROID_RADIUS);
            let hi = (bin + CENTROID_RADIUS + 1).min(bins.len());
            let mut weight = 0u64;
            let mut moment = 0.0;
            for (i, &count) in bins.iter().enumerate().take(hi).skip(lo) {
                weight += count as u64;
                moment += count as f64 * (i as f64 + 0.5) * bin_width as f64;
            }
            let position_ns = if weight > 0 {
                moment / weight as f64
            } else {
                (bin as f64 + 0.5) * bin_width as f64
            };
            HistogramPeak {
                position_ns,
                count: weight.min(u32::MAX as u64) as u32,
                multiple: None,
            }
        })
        .collect();

    label_peaks(&mut peaks, config.ratio_tolerance);
    peaks
}

fn label_peaks(peaks: &mut [HistogramPeak], tolerance: f64) {
    let Some(base) = peaks.first().map(|p| p.position_ns) else {
        return;
    };
    peaks[0].multiple = Some(2);
    for peak in peaks.iter_mut().skip(1) {
        let ratio = peak.position_ns / base;
        peak.multiple = CLASS_RATIOS
            .iter()
            .find(|(expected, _)| (ratio - expected).abs() <= tolerance)
            .map(|&(_, multiple)| multiple);
    }
}

fn estimate_cell(
    intervals: &[u32],
    peaks: &[HistogramPeak],
    config: &HistogramConfig,
) -> CellEstimate {
    let labelled: Vec<(f64, f64)> = peaks
        .iter()
        .filter_map(|p| p.multiple.map(|m| (p.position_ns, m as f64)))
        .collect();
    if labelled.is_empty() {
        return CellEstimate::Undetermined;
    }

    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0usize;
    for &interval in intervals {
        let interval = interval as f64;
        let nearest = labelled
            .iter()
            .map(|&(pos, multiple)| ((interval - pos).abs() / pos, multiple))
            .filter(|&(deviation, _)| deviation <= config.capture_window)
            .min_by(|a, b| a.0.total_cmp(&b.0));
        if let Some((_, multiple)) = nearest {
            let cell = interval / multiple;
            sum += cell;
            sum_sq += cell * cell;
            n += 1;
        }
    }

    if n == 0 {
        return CellEstimate::Undetermined;
    }
    let mean = sum / n as f64;
    let variance = (sum_sq / n as f64 - mean * mean).max(0.0);
    CellEstimate::Determined {
        nominal_cell_ns: mean,
        variance_ns2: variance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jittered_mfm(count: usize, cell: f64, jitter: f64) -> Vec<u32> {
        let mut state = 0x2545_f491u32;
        (0..count)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                let cells = 2 + (state >> 16) % 3;
                let noise = ((state >> 8) % 1000) as f64 / 1000.0 - 0.5;
                (cells as f64 * cell + noise * 2.0 * jitter) as u32
            })
            .collect()
    }

    #[test]
    fn test_mfm_peaks_and_cell() {
        let intervals = jittered_mfm(20_000, 2000.0, 80.0);
        let histogram = analyze_intervals(&intervals, &HistogramConfig::default());

        assert_eq!(histogram.peaks.len(), 3);
        let multiples: Vec<_> = histogram.peaks.iter().map(|p| p.multiple).collect();
        assert_eq!(multiples, vec![Some(2), Some(3), Some(4)]);

        let nominal = histogram.estimate.nominal().unwrap();
        assert!((nominal - 2000.0).abs() < 20.0, "nominal {}", nominal);
        assert!((histogram.cell_width_for(Encoding::Fm).unwrap() - 2.0 * nominal).abs() < 1e-9);
    }

    #[test]
    fn test_empty_input_is_undetermined() {
        let histogram = analyze_intervals(&[], &HistogramConfig::default());
        assert_eq!(histogram.estimate, CellEstimate::Undetermined);
        assert!(histogram.cell_width_for(Encoding::Mfm).is_none());
    }

    #[test]
    fn test_sparse_input_below_threshold() {
        // Too few samples for any peak to clear the minimum count
        let histogram = analyze_intervals(&[4000, 6000, 8000], &HistogramConfig::default());
        assert!(!histogram.is_determined());
    }

    #[test]
    fn test_overflow_counted() {
        let mut intervals = vec![4000u32; 100];
        intervals.push(50_000);
        let histogram = analyze_intervals(&intervals, &HistogramConfig::default());
        assert_eq!(histogram.overflow, 1);
        assert_eq!(histogram.total, 101);
    }
}
