//! Within-revolution rotation speed drift

use serde::{Deserialize, Serialize};

use crate::config::DriftConfig;
use crate::types::{FluxSample, Revolution, SampleFlags};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftProfile {
    pub start_rpm: f64,
    pub end_rpm: f64,
    pub drift_rate_rpm_per_s: f64,
    pub max_deviation_pct: f64,
    /// Measured over nominal duration per segment; above 1.0 is slow
    pub speed_factors: Vec<f64>,
    /// Samples per segment (the last segment takes the remainder)
    pub segment_samples: usize,
}

impl DriftProfile {
    fn flat(rpm: f64, segments: usize, segment_samples: usize) -> Self {
        Self {
            start_rpm: rpm,
            end_rpm: rpm,
            drift_rate_rpm_per_s: 0.0,
            max_deviation_pct: 0.0,
            speed_factors: vec![1.0; segments],
            segment_samples,
        }
    }

    fn segment_of(&self, sample: usize) -> usize {
        if self.segment_samples == 0 {
            return 0;
        }
        (sample / self.segment_samples).min(self.speed_factors.len().saturating_sub(1))
    }

    /// Similarity in `[0, 1]` of two drift shapes
    pub fn similarity(&self, other: &DriftProfile, tolerance: f64) -> f64 {
        let n = self.speed_factors.len().min(other.speed_factors.len());
        if n == 0 || tolerance <= 0.0 {
            return 0.0;
        }
        let mean_sq = self
            .speed_factors
            .iter()
            .zip(&other.speed_factors)
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            / n as f64;
        (1.0 - mean_sq.sqrt() / tolerance).clamp(0.0, 1.0)
    }
}

/// Measure how the rotation speed changes across one revolution
pub fn compute_drift(revolution: &Revolution, nominal_cell_ns: f64, segments: usize) -> DriftProfile {
    let intervals = revolution.intervals();
    let segments = segments.clamp(1, intervals.len().max(1));
    let segment_samples = intervals.len().div_ceil(segments).max(1);

    if nominal_cell_ns <= 0.0 {
        return DriftProfile::flat(revolution.rpm(), segments, segment_samples);
    }

    let speed_factors: Vec<f64> = intervals
        .chunks(segment_samples)
        .map(|chunk| {
            let measured: f64 = chunk.iter().map(|&i| i as f64).sum();
            let cells: f64 = chunk
                .iter()
                .map(|&i| (i as f64 / nominal_cell_ns).round().max(1.0))
                .sum();
            measured / (cells * nominal_cell_ns)
        })
        .collect();

    if speed_factors.is_empty() {
        return DriftProfile::flat(revolution.rpm(), segments, segment_samples);
    }

    let mean = speed_factors.iter().sum::<f64>() / speed_factors.len() as f64;
    let rpm_at = |factor: f64| revolution.rpm() * mean / factor;
    let start_rpm = rpm_at(speed_factors[0]);
    let end_rpm = rpm_at(speed_factors[speed_factors.len() - 1]);
    let seconds = revolution.index_time_ns() as f64 / 1e9;
    let max_deviation_pct = speed_factors
        .iter()
        .map(|f| (f / mean - 1.0).abs() * 100.0)
        .fold(0.0, f64::max);

    DriftProfile {
        start_rpm,
        end_rpm,
        drift_rate_rpm_per_s: if seconds > 0.0 { (end_rpm - start_rpm) / seconds } else { 0.0 },
        max_deviation_pct,
        speed_factors,
        segment_samples,
    }
}

/// Rescale a caller-owned copy of the samples to constant speed
pub fn compensate_drift(profile: &DriftProfile, samples: &mut [FluxSample]) {
    let mut previous_in = 0u64;
    let mut previous_out = 0u64;
    for (i, sample) in samples.iter_mut().enumerate() {
        let interval = sample.timestamp_ns.saturating_sub(previous_in);
        previous_in = sample.timestamp_ns;

        let factor = profile
            .speed_factors
            .get(profile.segment_of(i))
            .copied()
            .filter(|f| *f > 0.0)
            .unwrap_or(1.0);
        let scaled = ((interval as f64 / factor).round() as u64).max(1);

        previous_out += scaled;
        sample.timestamp_ns = previous_out;
        sample.flags.insert(SampleFlags::COMPENSATED);
        sample.flags.remove(SampleFlags::ORIGINAL);
    }
}

/// Drift similarity with the default tolerance
pub fn drift_similarity(a: &DriftProfile, b: &DriftProfile) -> f64 {
    a.similarity(b, DriftConfig::default().similarity_tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drifting_revolution(start_cell: f64, end_cell: f64, count: usize) -> Revolution {
        let intervals: Vec<u32> = (0..count)
            .map(|i| {
                let t = i as f64 / count as f64;
                let cell = start_cell + (end_cell - start_cell) * t;
                (2.0 * cell) as u32
            })
            .collect();
        Revolution::from_intervals(0, &intervals).unwrap()
    }

    #[test]
    fn test_flat_revolution_has_no_drift() {
        let rev = Revolution::from_intervals(0, &vec![4000u32; 1600]).unwrap();
        let profile = compute_drift(&rev, 2000.0, 16);
        assert_eq!(profile.speed_factors.len(), 16);
        assert!(profile.max_deviation_pct < 1e-9);
        assert!((profile.start_rpm - profile.end_rpm).abs() < 1e-9);
    }

    #[test]
    fn test_slowing_drive_detected() {
        let rev = drifting_revolution(2000.0, 2060.0, 3200);
        let profile = compute_drift(&rev, 2000.0, 16);
        assert!(profile.end_rpm < profile.start_rpm);
        assert!(profile.drift_rate_rpm_per_s < 0.0);
        assert!(profile.max_deviation_pct > 1.0);
    }

    #[test]
    fn test_compensation_flags_copy_only() {
        let rev = drifting_revolution(2000.0, 2060.0, 3200);
        let profile = compute_drift(&rev, 2000.0, 16);
        let mut copy = rev.samples().to_vec();
        compensate_drift(&profile, &mut copy);

        assert!(copy.iter().all(|s| s.flags.contains(SampleFlags::COMPENSATED)));
        assert!(copy.iter().all(|s| !s.flags.contains(SampleFlags::ORIGINAL)));
        assert!(rev.samples().iter().all(|s| s.flags.contains(SampleFlags::ORIGINAL)));

        // Last segment intervals pulled back towards 4000 ns
        let last = copy[copy.len() - 1].timestamp_ns - copy[copy.len() - 2].timestamp_ns;
        assert!((last as f64 - 4000.0).abs() < 20.0, "last interval {}", last);
    }

    #[test]
    fn test_similarity() {
        let a = compute_drift(&drifting_revolution(2000.0, 2060.0, 3200), 2000.0, 16);
        let b = compute_drift(&drifting_revolution(2000.0, 2060.0, 3200), 2000.0, 16);
        let flat = compute_drift(&Revolution::from_intervals(1, &vec![4000u32; 3200]).unwrap(), 2000.0, 16);
        assert!((drift_similarity(&a, &b) - 1.0).abs() < 1e-9);
        assert!(drift_similarity(&a, &flat) < 1.0);
    }
}
