//! Flux-level recovery engine for vintage magnetic media
//!
//! Turns raw flux-transition captures (several revolutions of one track)
//! into scored bitstreams and sector data:
//! - Cell-width histogram, adaptive PLL clock recovery and drift compensation
//! - Dropout recovery from sibling revolutions
//! - Weighted multi-revolution voting with weak-zone classification
//! - Bit-slip, sync-mark and missing-clock reconstruction
//! - Region segmentation and mixed-encoding separation
//! - Parallel decode hypotheses with panic isolation, merged per field
//! - Immutable, checksummed preservation of the original flux

pub mod bitstream;
pub mod capture;
pub mod cli;
pub mod confidence;
pub mod config;
pub mod context;
pub mod error;
pub mod flux;
pub mod hypothesis;
pub mod report;
pub mod types;

// Re-export commonly used types
pub use bitstream::{Encoding, SectorId, TrackWriter};
pub use capture::CaptureFile;
pub use confidence::{Algorithm, ConfidenceBreakdown, ConfidenceLevel, SourceInfo, SourceStep};
pub use config::{LowConfidencePolicy, PllMode, RecoveryConfig};
pub use context::DecodeContext;
pub use error::{RecoveryError, Result};
pub use flux::{AdaptivePll, FluxPreservationStore, MultiRevolutionVoter, PreservationStoreBuilder};
pub use hypothesis::{DecodeHypothesis, DecodeHypothesisEngine, HypothesisSet, TrackDecode};
pub use types::{BitFlags, BitRecord, FluxSample, MultiRevolutionSet, Revolution, SampleFlags, TrackId};
