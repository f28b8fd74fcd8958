//! Bit-level structure: encodings, slips, syncs, clocks, regions and fields

pub mod clock;
pub mod crc;
pub mod encoding;
pub mod fields;
pub mod region;
pub mod repair;
pub mod slip;
pub mod sync;

pub use clock::{detect_missing_clocks, reconstruct_missing_clocks, MissingClock, MissingClockKind};
pub use encoding::{violation_count, violation_rate, Encoding};
pub use fields::{check_fields, FieldCheck, FieldKind, SectorId, TrackWriter};
pub use region::{segment, separate_mixed_encoding, BitstreamRegion, BoundaryKind, EncodingSegment};
pub use repair::{repair_field, CellChange, FieldRepair};
pub use slip::{correct_and_verify, correct_slips, detect_slips, BitSlip, SlipCorrection, StructuralScore};
pub use sync::{locate_syncs, reconstruct_syncs, SyncMark, SyncMatch, SyncOrigin, SyncReconstruction};
