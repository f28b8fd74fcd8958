use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, Result};

/// Physical location of one captured track
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId {
    pub track: u16,
    pub head: u8,
}

impl TrackId {
    pub fn new(track: u16, head: u8) -> Self {
        Self { track, head }
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}.{}", self.track, self.head)
    }
}

bitflags! {
    /// Independent annotations on a flux sample
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SampleFlags: u8 {
        const DROPOUT      = 1 << 0;
        const WEAK         = 1 << 1;
        const NOISE        = 1 << 2;
        const INTERPOLATED = 1 << 3;
        const VOTED        = 1 << 4;
        const ORIGINAL     = 1 << 5;
        const COMPENSATED  = 1 << 6;
    }
}

bitflags! {
    /// Independent annotations on a decoded bit
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct BitFlags: u16 {
        const SLIP          = 1 << 0;
        const MISSING_CLOCK = 1 << 1;
        const INSERTED      = 1 << 2;
        const UNCERTAIN     = 1 << 3;
        const SYNC          = 1 << 4;
        const WEAK          = 1 << 5;
        const VOTED         = 1 << 6;
        const RECOVERED     = 1 << 7;
        const RECONSTRUCTED = 1 << 8;
        const CORRECTED     = 1 << 9;
    }
}

/// One flux transition, timestamped from the revolution's index reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FluxSample {
    pub timestamp_ns: u64,
    pub confidence: u8,
    pub revolution: u16,
    pub flags: SampleFlags,
}

impl FluxSample {
    pub fn original(timestamp_ns: u64, revolution: u16) -> Self {
        Self {
            timestamp_ns,
            confidence: 100,
            revolution,
            flags: SampleFlags::ORIGINAL,
        }
    }

    /// Annotated copy; the receiver is left untouched
    pub fn with_flags(&self, flags: SampleFlags) -> Self {
        Self {
            flags: self.flags | flags,
            ..*self
        }
    }
}

/// One physical rotation of one (track, head); read-only once built
#[derive(Debug, Clone)]
pub struct Revolution {
    index: u16,
    samples: Vec<FluxSample>,
    index_time_ns: u64,
    rpm: f64,
    quality: f32,
}

impl Revolution {
    /// Build a revolution from raw flux intervals in nanoseconds
    pub fn from_intervals(index: u16, intervals: &[u32]) -> Result<Self> {
        if intervals.is_empty() {
            return Err(RecoveryError::InvalidInput(format!(
                "revolution {} has no flux intervals",
                index
            )));
        }
        if let Some(pos) = intervals.iter().position(|&i| i == 0) {
            return Err(RecoveryError::InvalidInput(format!(
                "revolution {} has a zero-length interval at {}",
                index, pos
            )));
        }

        let mut timestamp = 0u64;
        let samples = intervals
            .iter()
            .map(|&interval| {
                timestamp += interval as u64;
                FluxSample::original(timestamp, index)
            })
            .collect();

        Self::from_samples(index, samples, timestamp)
    }

    /// Build a revolution from already timestamped samples
    pub fn from_samples(index: u16, samples: Vec<FluxSample>, index_time_ns: u64) -> Result<Self> {
        if samples.is_empty() {
            return Err(RecoveryError::InvalidInput(format!(
                "revolution {} has no samples",
                index
            )));
        }
        if samples.windows(2).any(|w| w[1].timestamp_ns <= w[0].timestamp_ns) {
            return Err(RecoveryError::InvalidInput(format!(
                "revolution {} timestamps are not strictly increasing",
                index
            )));
        }
        let last = samples[samples.len() - 1].timestamp_ns;
        let index_time_ns = index_time_ns.max(last);
        let rpm = 60e9 / index_time_ns as f64;

        Ok(Self {
            index,
            samples,
            index_time_ns,
            rpm,
            quality: 1.0,
        })
    }

    /// Copy with a capture-layer quality score in `[0, 1]`
    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = quality.clamp(0.0, 1.0);
        self
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn samples(&self) -> &[FluxSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn index_time_ns(&self) -> u64 {
        self.index_time_ns
    }

    pub fn rpm(&self) -> f64 {
        self.rpm
    }

    pub fn quality(&self) -> f32 {
        self.quality
    }

    /// Flux intervals reconstructed from the sample timestamps
    pub fn intervals(&self) -> Vec<u32> {
        let mut previous = 0u64;
        self.samples
            .iter()
            .map(|sample| {
                let interval = sample.timestamp_ns - previous;
                previous = sample.timestamp_ns;
                interval.min(u32::MAX as u64) as u32
            })
            .collect()
    }
}

/// Aggregate rotation speed statistics for a set of revolutions
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RpmStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

/// All captured revolutions of one (track, head)
#[derive(Debug, Clone)]
pub struct MultiRevolutionSet {
    track: TrackId,
    revolutions: Vec<Revolution>,
    rpm: RpmStats,
}

impl MultiRevolutionSet {
    pub fn new(track: TrackId, revolutions: Vec<Revolution>) -> Result<Self> {
        if revolutions.is_empty() {
            return Err(RecoveryError::InsufficientData {
                what: "revolution set",
                needed: 1,
                got: 0,
            });
        }

        let speeds: Vec<f64> = revolutions.iter().map(|r| r.rpm()).collect();
        let count = speeds.len() as f64;
        let mean = speeds.iter().sum::<f64>() / count;
        let variance = speeds.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / count;
        let rpm = RpmStats {
            mean,
            min: speeds.iter().copied().fold(f64::INFINITY, f64::min),
            max: speeds.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            std_dev: variance.sqrt(),
        };

        Ok(Self {
            track,
            revolutions,
            rpm,
        })
    }

    /// Build a set straight from per-revolution interval arrays
    pub fn from_intervals(track: TrackId, captures: &[Vec<u32>]) -> Result<Self> {
        let revolutions = captures
            .iter()
            .enumerate()
            .map(|(i, intervals)| Revolution::from_intervals(i as u16, intervals))
            .collect::<Result<Vec<_>>>()?;
        Self::new(track, revolutions)
    }

    pub fn track(&self) -> TrackId {
        self.track
    }

    pub fn revolutions(&self) -> &[Revolution] {
        &self.revolutions
    }

    pub fn len(&self) -> usize {
        self.revolutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revolutions.is_empty()
    }

    pub fn rpm_stats(&self) -> RpmStats {
        self.rpm
    }

    /// Index of the highest quality revolution (first one wins ties)
    pub fn best_revolution(&self) -> usize {
        self.revolutions
            .iter()
            .enumerate()
            .fold((0usize, f32::MIN), |(best, q), (i, rev)| {
                if rev.quality() > q {
                    (i, rev.quality())
                } else {
                    (best, q)
                }
            })
            .0
    }
}

/// Newtype for hypothesis identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HypothesisId(pub u32);

impl std::fmt::Display for HypothesisId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// A decoded bit with its confidence and provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitRecord {
    pub value: u8,
    pub confidence: u8,
    pub hypothesis: Option<HypothesisId>,
    pub flags: BitFlags,
}

impl BitRecord {
    pub fn new(value: u8, confidence: u8) -> Self {
        Self {
            value: value & 1,
            confidence: confidence.min(100),
            hypothesis: None,
            flags: BitFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: BitFlags) -> Self {
        self.flags |= flags;
        self
    }
}

/// Pack 0/1 bit values MSB first; a trailing partial byte is zero padded
pub fn pack_bits(bits: &[u8]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &bit)| acc | ((bit & 1) << (7 - i)))
        })
        .collect()
}

/// Unpack bytes into 0/1 bit values, MSB first
pub fn unpack_bits(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .flat_map(|&byte| (0..8).rev().map(move |shift| (byte >> shift) & 1))
        .collect()
}
