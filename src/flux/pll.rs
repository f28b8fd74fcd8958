//! Software clock recovery over flux intervals

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::bitstream::BitstreamRegion;
use crate::config::PllConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Unlocked,
    Locking,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PllState {
    pub cell_ns: f64,
    pub phase_offset_ns: f64,
    pub accumulated_error_ns: f64,
    pub lock: LockState,
    pub in_tolerance: u32,
}

impl PllState {
    fn seeded(cell_ns: f64, phase: f64) -> Self {
        Self {
            cell_ns,
            phase_offset_ns: phase * cell_ns,
            accumulated_error_ns: 0.0,
            lock: LockState::Unlocked,
            in_tolerance: 0,
        }
    }
}

/// Outcome of feeding one interval through the loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PllStep {
    pub cells: u32,
    pub phase_error_ns: f64,
    pub cell_ns: f64,
    pub state: LockState,
    pub out_of_range: bool,
}

impl PllStep {
    /// Timing confidence of the transition closing this interval
    pub fn confidence(&self) -> u8 {
        if self.out_of_range {
            return 0;
        }
        let relative = self.phase_error_ns.abs() / self.cell_ns;
        ((1.0 - 2.0 * relative).clamp(0.0, 1.0) * 100.0).round() as u8
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PllDecode {
    pub bits: Vec<u8>,
    /// Cell width in effect for every emitted bit
    pub cell_trace: Vec<f64>,
    /// Phase error per interval, in nanoseconds
    pub phase_errors: Vec<f64>,
    /// Bit index at which each interval's output starts
    pub interval_starts: Vec<usize>,
    /// Per-bit timing confidence
    pub confidences: Vec<u8>,
    pub out_of_range: usize,
    pub locked_fraction: f64,
}

impl PllDecode {
    fn with_capacity(intervals: usize) -> Self {
        Self {
            bits: Vec::with_capacity(intervals * 3),
            cell_trace: Vec::with_capacity(intervals * 3),
            phase_errors: Vec::with_capacity(intervals),
            interval_starts: Vec::with_capacity(intervals),
            confidences: Vec::with_capacity(intervals * 3),
            out_of_range: 0,
            locked_fraction: 0.0,
        }
    }

    fn push(&mut self, step: &PllStep) {
        self.interval_starts.push(self.bits.len());
        self.phase_errors.push(step.phase_error_ns);
        let confidence = step.confidence();
        for i in 0..step.cells {
            self.bits.push(u8::from(i + 1 == step.cells));
            self.cell_trace.push(step.cell_ns);
            self.confidences.push(confidence);
        }
        if step.out_of_range {
            self.out_of_range += 1;
        }
    }

    fn append(&mut self, other: PllDecode) {
        let base = self.bits.len();
        self.interval_starts
            .extend(other.interval_starts.iter().map(|start| start + base));
        self.bits.extend(other.bits);
        self.cell_trace.extend(other.cell_trace);
        self.phase_errors.extend(other.phase_errors);
        self.confidences.extend(other.confidences);
        self.out_of_range += other.out_of_range;
    }

    pub fn mean_confidence(&self) -> f64 {
        if self.confidences.is_empty() {
            return 0.0;
        }
        self.confidences.iter().map(|&c| c as f64).sum::<f64>() / self.confidences.len() as f64
    }
}

/// Interval indices whose output holds the last cell before each boundary
///
/// Boundaries are bit offsets into the decode the starts came from, such as
/// the ends of located sync marks. The result is ascending and deduplicated.
pub fn resync_intervals(
    interval_starts: &[usize],
    boundaries: impl IntoIterator<Item = usize>,
) -> Vec<usize> {
    let mut points: Vec<usize> = boundaries
        .into_iter()
        .filter(|&bit| bit > 0)
        .filter_map(|bit| {
            interval_starts
                .partition_point(|&start| start < bit)
                .checked_sub(1)
        })
        .filter(|&index| index + 1 < interval_starts.len())
        .collect();
    points.sort_unstable();
    points.dedup();
    points
}

/// Per-region decode with the loop state each region ended in
#[derive(Debug, Clone, Default)]
pub struct RegionalDecode {
    pub decode: PllDecode,
    pub states: Vec<PllState>,
}

/// Adaptive phase-locked loop seeded with a nominal cell width
#[derive(Debug, Clone)]
pub struct AdaptivePll {
    config: PllConfig,
    nominal_cell_ns: f64,
    initial_phase: f64,
    state: PllState,
}

impl AdaptivePll {
    pub fn new(nominal_cell_ns: f64, config: PllConfig) -> Self {
        Self::with_phase(nominal_cell_ns, 0.0, config)
    }

    /// Seed with a phase offset expressed as a fraction of the cell
    pub fn with_phase(nominal_cell_ns: f64, phase: f64, config: PllConfig) -> Self {
        Self {
            config,
            nominal_cell_ns,
            initial_phase: phase,
            state: PllState::seeded(nominal_cell_ns, phase),
        }
    }

    pub fn state(&self) -> &PllState {
        &self.state
    }

    pub fn nominal_cell_ns(&self) -> f64 {
        self.nominal_cell_ns
    }

    /// Back to the seeded nominal state
    pub fn reset(&mut self) {
        self.state = PllState::seeded(self.nominal_cell_ns, self.initial_phase);
    }

    /// Jump straight to a new cell width and drop lock
    pub fn force_resync(&mut self, cell_ns: f64) {
        let cell_ns = self.clamp_cell(cell_ns);
        self.state = PllState::seeded(cell_ns, 0.0);
    }

    fn clamp_cell(&self, cell_ns: f64) -> f64 {
        cell_ns.clamp(
            self.nominal_cell_ns * self.config.min_clock_ratio,
            self.nominal_cell_ns * self.config.max_clock_ratio,
        )
    }

    pub fn step(&mut self, interval_ns: u32) -> PllStep {
        let cell = self.state.cell_ns;
        let adjusted = interval_ns as f64 + self.state.phase_offset_ns;
        let cells = (adjusted / cell).round().max(1.0);
        let error = adjusted - cells * cell;

        if cells > self.config.max_cells as f64 {
            // Long gaps carry no usable phase information
            self.state.phase_offset_ns = 0.0;
            self.state.in_tolerance = 0;
            if self.state.lock == LockState::Locked {
                self.state.lock = LockState::Locking;
            }
            return PllStep {
                cells: cells.min(u32::MAX as f64) as u32,
                phase_error_ns: error,
                cell_ns: cell,
                state: self.state.lock,
                out_of_range: true,
            };
        }

        self.state.phase_offset_ns = error * (1.0 - self.config.phase_gain);
        self.state.accumulated_error_ns += error;
        let corrected = cell + self.config.frequency_gain * error / cells;
        self.state.cell_ns = self.clamp_cell(corrected);

        if error.abs() / cell < self.config.lock_tolerance {
            self.state.in_tolerance += 1;
            self.state.lock = if self.state.in_tolerance >= self.config.lock_threshold {
                LockState::Locked
            } else {
                LockState::Locking
            };
        } else {
            self.state.in_tolerance = 0;
            self.state.lock = match self.state.lock {
                LockState::Locked => LockState::Locking,
                _ => LockState::Unlocked,
            };
        }

        PllStep {
            cells: cells as u32,
            phase_error_ns: error,
            cell_ns: cell,
            state: self.state.lock,
            out_of_range: false,
        }
    }

    /// Decode intervals, continuing from the current loop state
    pub fn decode(&mut self, intervals: &[u32]) -> PllDecode {
        self.decode_with_resync(intervals, &[])
    }

    /// Decode intervals, reseeding the loop at the nominal cell with zero
    /// phase right after each interval index in `resync_after` (ascending)
    pub fn decode_with_resync(&mut self, intervals: &[u32], resync_after: &[usize]) -> PllDecode {
        let mut decode = PllDecode::with_capacity(intervals.len());
        let mut locked = 0usize;
        let mut pending = resync_after.iter().peekable();
        for (i, &interval) in intervals.iter().enumerate() {
            let step = self.step(interval);
            if step.state == LockState::Locked {
                locked += 1;
            }
            decode.push(&step);
            let mut resync = false;
            while let Some(&after) = pending.next_if(|&&after| after <= i) {
                resync |= after == i;
            }
            if resync {
                self.force_resync(self.nominal_cell_ns);
            }
        }
        if !intervals.is_empty() {
            decode.locked_fraction = locked as f64 / intervals.len() as f64;
        }
        decode
    }

    /// Re-decode each region with its own loop, seeded from the region's
    /// mean cell width in a previous whole-stream pass
    pub fn decode_regions(
        &self,
        intervals: &[u32],
        first_pass: &PllDecode,
        regions: &[BitstreamRegion],
    ) -> RegionalDecode {
        if regions.is_empty() || first_pass.interval_starts.len() != intervals.len() {
            let mut pll = self.clone();
            pll.reset();
            let decode = pll.decode(intervals);
            return RegionalDecode {
                decode,
                states: vec![*pll.state()],
            };
        }

        let spans: Vec<(usize, usize, f64)> = regions
            .iter()
            .enumerate()
            .map(|(i, region)| {
                let first = if i == 0 {
                    0
                } else {
                    first_pass
                        .interval_starts
                        .partition_point(|&start| start < region.start_bit)
                };
                let last = if i + 1 == regions.len() {
                    intervals.len()
                } else {
                    first_pass
                        .interval_starts
                        .partition_point(|&start| start < region.end_bit)
                };
                let trace = &first_pass.cell_trace
                    [region.start_bit.min(first_pass.cell_trace.len())
                        ..region.end_bit.min(first_pass.cell_trace.len())];
                let seed = if trace.is_empty() {
                    self.nominal_cell_ns
                } else {
                    trace.iter().sum::<f64>() / trace.len() as f64
                };
                (first, last.max(first), seed)
            })
            .collect();

        let parts: Vec<(PllDecode, PllState, usize)> = spans
            .par_iter()
            .map(|&(first, last, seed)| {
                let mut pll = AdaptivePll::new(self.nominal_cell_ns, self.config.clone());
                pll.force_resync(seed);
                let decode = pll.decode(&intervals[first..last]);
                (decode, *pll.state(), last - first)
            })
            .collect();

        let mut combined = PllDecode::with_capacity(intervals.len());
        let mut states = Vec::with_capacity(parts.len());
        let mut locked = 0.0;
        for (decode, state, count) in parts {
            locked += decode.locked_fraction * count as f64;
            combined.append(decode);
            states.push(state);
        }
        if !intervals.is_empty() {
            combined.locked_fraction = locked / intervals.len() as f64;
        }
        RegionalDecode {
            decode: combined,
            states,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_intervals(cells: &[u32], cell_ns: f64) -> Vec<u32> {
        cells.iter().map(|&c| (c as f64 * cell_ns) as u32).collect()
    }

    #[test]
    fn test_clean_decode() {
        let mut pll = AdaptivePll::new(2000.0, PllConfig::default());
        let decode = pll.decode(&clean_intervals(&[2, 3, 4, 2], 2000.0));
        assert_eq!(decode.bits, vec![0, 1, 0, 0, 1, 0, 0, 0, 1, 0, 1]);
        assert_eq!(decode.interval_starts, vec![0, 2, 5, 9]);
        assert_eq!(decode.cell_trace.len(), decode.bits.len());
    }

    #[test]
    fn test_tracks_slow_drive() {
        // Drive running 4% slow: every cell is 2080 ns
        let pattern: Vec<u32> = (0..2000).map(|i| 2 + (i % 3) as u32).collect();
        let mut pll = AdaptivePll::new(2000.0, PllConfig::default());
        let decode = pll.decode(&clean_intervals(&pattern, 2080.0));

        let expected: usize = pattern.iter().map(|&c| c as usize).sum();
        assert_eq!(decode.bits.len(), expected);
        assert!((pll.state().cell_ns - 2080.0).abs() < 10.0);
        assert_eq!(pll.state().lock, LockState::Locked);
        assert!(decode.locked_fraction > 0.9);
    }

    #[test]
    fn test_cell_bounded() {
        let mut pll = AdaptivePll::new(2000.0, PllConfig::default());
        let pattern = vec![2u32; 500];
        pll.decode(&clean_intervals(&pattern, 2600.0));
        assert!(pll.state().cell_ns <= 2200.0 + 1e-9);
    }

    #[test]
    fn test_out_of_range_does_not_train() {
        let mut pll = AdaptivePll::new(2000.0, PllConfig::default());
        let step = pll.step(100_000);
        assert!(step.out_of_range);
        assert_eq!(step.cells, 50);
        assert_eq!(step.confidence(), 0);
        assert!((pll.state().cell_ns - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_and_resync() {
        let mut pll = AdaptivePll::new(2000.0, PllConfig::default());
        pll.decode(&[4100, 6100, 8100]);
        pll.force_resync(2100.0);
        assert_eq!(pll.state().cell_ns, 2100.0);
        assert_eq!(pll.state().lock, LockState::Unlocked);
        pll.reset();
        assert_eq!(pll.state().cell_ns, 2000.0);
        assert_eq!(pll.state().accumulated_error_ns, 0.0);
    }

    #[test]
    fn test_resync_after_sync_restores_tail() {
        // Forty intervals at 2200 ns cells pull the loop to its upper bound
        let mut intervals = vec![4400u32; 40];
        intervals.extend(clean_intervals(&[8, 2, 3, 8], 2000.0));

        let drifted = AdaptivePll::new(2000.0, PllConfig::default()).decode(&intervals);
        let resynced = AdaptivePll::new(2000.0, PllConfig::default()).decode_with_resync(&intervals, &[39]);

        let tail = |decode: &PllDecode| decode.bits[decode.interval_starts[40]..].to_vec();
        let mut expected = Vec::new();
        for cells in [8, 2, 3, 8] {
            expected.extend(std::iter::repeat(0u8).take(cells - 1));
            expected.push(1);
        }
        assert_eq!(tail(&resynced), expected);
        assert_ne!(tail(&drifted), expected);
        assert_eq!(
            &resynced.bits[..resynced.interval_starts[40]],
            &drifted.bits[..drifted.interval_starts[40]]
        );
    }

    #[test]
    fn test_resync_intervals_maps_sync_ends() {
        let starts = vec![0, 2, 5, 9, 11];
        assert_eq!(resync_intervals(&starts, [5, 11, 10, 0]), vec![1, 3]);
        // A boundary after the last interval has nothing to reseed
        assert!(resync_intervals(&starts, [40]).is_empty());
    }

    #[test]
    fn test_region_decode_matches_clean_stream() {
        let pattern: Vec<u32> = (0..400).map(|i| 2 + (i % 3) as u32).collect();
        let intervals = clean_intervals(&pattern, 2000.0);
        let mut pll = AdaptivePll::new(2000.0, PllConfig::default());
        let first = pll.decode(&intervals);
        let half = first.bits.len() / 2;
        let regions = vec![
            BitstreamRegion::new(0, half, None),
            BitstreamRegion::new(half, first.bits.len(), None),
        ];

        let regional = pll.decode_regions(&intervals, &first, &regions);
        assert_eq!(regional.states.len(), 2);
        assert_eq!(regional.decode.bits, first.bits);
    }
}
