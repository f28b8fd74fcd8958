//! Flux-level analysis: timing, clock recovery, voting and preservation

pub mod drift;
pub mod dropout;
pub mod histogram;
pub mod pll;
pub mod preservation;
pub mod timing;
pub mod voter;

pub use drift::{compensate_drift, compute_drift, drift_similarity, DriftProfile};
pub use dropout::{
    apply_recovery, classify_weak_zones, detect_dropouts, detect_weak_zones, recover_dropouts,
    DropoutRegion, WeakZone, WeakZoneClass,
};
pub use histogram::{analyze_intervals, encoding_cell_width, CellEstimate, CellHistogram, HistogramPeak};
pub use pll::{resync_intervals, AdaptivePll, LockState, PllDecode, PllState, PllStep, RegionalDecode};
pub use preservation::{FluxPreservationStore, PreservationStoreBuilder, SnapshotKey};
pub use timing::{
    generate_timing_hypotheses, score_timing_hypotheses, TimingEvidence, TimingHypothesis,
};
pub use voter::{align_revolutions, Alignment, MultiRevolutionVoter, RevolutionBits, VoteResult, TIE_BREAK_VALUE};
