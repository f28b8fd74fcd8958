use flux_recovery::bitstream::encoding::mfm_encode;
use flux_recovery::bitstream::{correct_and_verify, Encoding, SectorId, TrackWriter};
use flux_recovery::config::{
    DropoutConfig, HypothesisConfig, PllConfig, RecoveryConfig, SlipConfig, VotingConfig, WeakZoneConfig,
};
use flux_recovery::context::DecodeContext;
use flux_recovery::flux::{
    apply_recovery, detect_dropouts, generate_timing_hypotheses, recover_dropouts, AdaptivePll,
    MultiRevolutionVoter, PreservationStoreBuilder, RevolutionBits, TIE_BREAK_VALUE,
};
use flux_recovery::hypothesis::{CellSource, DecodeHypothesisEngine, Verdict, CELL_UNDETERMINED};
use flux_recovery::report::TrackSummary;
use flux_recovery::types::{BitFlags, MultiRevolutionSet, Revolution, SampleFlags, TrackId};

const CELL_NS: f64 = 2000.0;

fn lcg_bytes(count: usize, seed: u32) -> Vec<u8> {
    let mut state = seed;
    (0..count)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}

fn lcg_bits(count: usize, seed: u32) -> Vec<u8> {
    let mut state = seed;
    (0..count)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 31) as u8
        })
        .collect()
}

fn voter() -> MultiRevolutionVoter {
    MultiRevolutionVoter::new(VotingConfig::default(), WeakZoneConfig::default())
}

fn mfm_track(sectors: u8) -> Vec<u8> {
    let mut writer = TrackWriter::new(Encoding::Mfm);
    writer.gap(0x4E, 40);
    for sector in 1..=sectors {
        writer.sector(SectorId::new(2, 0, sector, 1), &lcg_bytes(256, sector as u32));
    }
    writer.gap(0x4E, 20);
    writer.into_bits()
}

fn flux_for(bits: &[u8], cell_ns: f64) -> Vec<u32> {
    let mut intervals = Vec::new();
    let mut last: isize = -1;
    for (i, &b) in bits.iter().enumerate() {
        if b == 1 {
            intervals.push(((i as isize - last) as f64 * cell_ns) as u32);
            last = i as isize;
        }
    }
    intervals
}

#[test]
fn preservation_restores_identical_samples() {
    let track = TrackId::new(5, 1);
    let revolution = Revolution::from_intervals(0, &flux_for(&mfm_track(1), CELL_NS)).unwrap();

    let mut builder = PreservationStoreBuilder::new();
    let key = builder.preserve(track, &revolution).unwrap();
    assert_eq!(builder.preserve(track, &revolution).unwrap(), key);
    let store = builder.seal();

    let first = store.restore(&key).unwrap();
    let second = store.restore(&key).unwrap();
    assert_eq!(first, revolution.samples());
    assert_eq!(first, second);
    assert_eq!(store.verify_all().unwrap(), 1);
}

#[test]
fn unanimous_revolutions_are_certain() {
    let bits = lcg_bits(512, 3);
    let revolutions: Vec<RevolutionBits> =
        (0..3).map(|r| RevolutionBits::new(r, bits.clone())).collect();
    let result = voter().vote(&revolutions).unwrap();

    assert_eq!(result.bits, bits);
    assert!(result.records.iter().all(|r| r.confidence == 100));
    assert!(result.weak_zones.is_empty());
    assert_eq!(result.unanimous, bits.len());
}

#[test]
fn ties_resolve_the_same_way_every_time() {
    let a = lcg_bits(64, 7);
    let mut b = a.clone();
    b[20] ^= 1;
    let revolutions = [RevolutionBits::new(0, a), RevolutionBits::new(1, b)];

    let first = voter().vote(&revolutions).unwrap();
    let second = voter().vote(&revolutions).unwrap();
    assert_eq!(first.bits[20], TIE_BREAK_VALUE);
    assert_eq!(first.records[20].confidence, 0);
    assert!(first.records[20].flags.contains(BitFlags::WEAK));
    assert_eq!(first.bits, second.bits);
    assert_eq!(first.weak_zones.len(), 1);
}

#[test]
fn rejection_never_removes_hypotheses() {
    let mut set = generate_timing_hypotheses(CELL_NS, &HypothesisConfig::default());
    let generated = set.len();
    let ids: Vec<_> = set.all().iter().map(|h| h.id()).take(3).collect();
    for id in &ids {
        set.reject(*id, "no sync marks").unwrap();
    }

    assert_eq!(set.len(), generated);
    assert_eq!(set.get_valid().len(), generated - ids.len());
    assert_eq!(set.rejected_count(), ids.len());
    assert!(set.undo());
    assert_eq!(set.get_valid().len(), generated - ids.len() + 1);
}

#[test]
fn inserted_cell_round_trips() {
    let original = mfm_encode(&lcg_bytes(256, 5), 0);
    let at = (2000..original.len()).find(|&i| original[i] == 1).unwrap();
    let mut slipped = original.clone();
    slipped.insert(at + 1, 1);

    let correction = correct_and_verify(&slipped, Encoding::Mfm, &SlipConfig::default()).unwrap();
    assert_eq!(correction.slip_corrections(), 1);
    assert_eq!(correction.bits, original);
}

#[test]
fn agreeing_revolutions_never_lower_confidence() {
    let a = lcg_bits(256, 21);
    let mut b = a.clone();
    b[100] ^= 1;

    let mut revolutions = vec![RevolutionBits::new(0, a.clone()), RevolutionBits::new(1, b)];
    let mut previous = voter().vote(&revolutions).unwrap().records[100].confidence;
    for r in 2..6 {
        revolutions.push(RevolutionBits::new(r, a.clone()));
        let confidence = voter().vote(&revolutions).unwrap().records[100].confidence;
        assert!(confidence >= previous, "{} < {} with {} revolutions", confidence, previous, r + 1);
        previous = confidence;
    }
    assert!(previous > 50);
}

#[test]
fn third_agreeing_revolution_keeps_every_bit_confidence() {
    let bits = lcg_bits(400, 77);
    let mut revolutions: Vec<RevolutionBits> =
        (0..2).map(|r| RevolutionBits::new(r, bits.clone())).collect();
    let before = voter().vote(&revolutions).unwrap();
    assert!(before.records.iter().all(|r| r.confidence == 100));

    revolutions.push(RevolutionBits::new(2, bits.clone()));
    let after = voter().vote(&revolutions).unwrap();
    assert_eq!(after.bits, bits);
    for (i, (old, new)) in before.records.iter().zip(&after.records).enumerate() {
        assert!(
            new.confidence >= old.confidence,
            "bit {} fell from {} to {}",
            i,
            old.confidence,
            new.confidence
        );
    }
    assert_eq!(after.unanimous, bits.len());
}

#[test]
fn single_weak_bit_across_three_revolutions() {
    let bits = lcg_bits(1000, 42);
    let mut odd = bits.clone();
    odd[500] ^= 1;
    let result = voter()
        .vote(&[
            RevolutionBits::new(0, bits.clone()),
            RevolutionBits::new(1, bits.clone()),
            RevolutionBits::new(2, odd),
        ])
        .unwrap();

    assert_eq!(result.bits, bits);
    assert_eq!(result.records[500].confidence, 33);
    assert_eq!(result.weak_zones.len(), 1);
    assert!(result.weak_zones[0].contains(500));
    assert_eq!(result.unanimous, 999);
}

#[test]
fn fifty_cell_dropout_recovered_from_sibling() {
    let clean_cells: Vec<u32> = [2u32, 3, 4, 3, 2, 4].repeat(8);
    let clean_intervals: Vec<u32> = clean_cells.iter().map(|&c| c * CELL_NS as u32).collect();
    // Intervals 6..23 add up to exactly 50 cells
    let lost: u32 = clean_cells[6..23].iter().sum();
    assert_eq!(lost, 50);
    let mut damaged_cells = clean_cells[..6].to_vec();
    damaged_cells.push(lost);
    damaged_cells.extend_from_slice(&clean_cells[23..]);
    let damaged_intervals: Vec<u32> = damaged_cells.iter().map(|&c| c * CELL_NS as u32).collect();

    let damaged = Revolution::from_intervals(0, &damaged_intervals).unwrap();
    let clean = Revolution::from_intervals(1, &clean_intervals).unwrap();
    let config = DropoutConfig::default();
    let mut regions = detect_dropouts(&damaged, CELL_NS, &config);
    assert_eq!(regions.len(), 1);
    assert!((regions[0].severity - 50.0).abs() < 1e-9);

    let recovered = recover_dropouts(&mut regions, &[&clean], CELL_NS, &PllConfig::default(), &config);
    assert_eq!(recovered, 1);
    assert_eq!(regions[0].recovered_from, Some(1));
    assert_eq!(regions[0].recovered_intervals, clean_intervals[6..23]);

    // The filled span decodes exactly as the sibling's own cells there
    let sibling = AdaptivePll::new(CELL_NS, PllConfig::default()).decode(&clean_intervals);
    let span = sibling.interval_starts[6]..sibling.interval_starts[23];
    assert_eq!(regions[0].recovered_bits, sibling.bits[span]);
    assert_eq!(regions[0].recovered_bits.len(), 50);

    let samples = apply_recovery(&damaged, &regions);
    assert_eq!(samples.len(), clean.len());
    assert_eq!(
        samples.iter().filter(|s| s.flags.contains(SampleFlags::INTERPOLATED)).count(),
        16
    );
    let timestamps: Vec<u64> = samples.iter().map(|s| s.timestamp_ns).collect();
    let expected: Vec<u64> = clean.samples().iter().map(|s| s.timestamp_ns).collect();
    assert_eq!(timestamps, expected);
}

#[test]
fn engine_recovers_track_with_dropout() {
    let flux = flux_for(&mfm_track(3), CELL_NS);
    let mut damaged = flux[..1000].to_vec();
    damaged.push(flux[1000..1010].iter().sum());
    damaged.extend_from_slice(&flux[1010..]);

    let set = MultiRevolutionSet::from_intervals(TrackId::new(2, 0), &[damaged, flux.clone(), flux]).unwrap();
    let engine = DecodeHypothesisEngine::new(RecoveryConfig::default());
    let mut ctx = DecodeContext::for_track(set.track(), true);
    let decode = engine.run(&set, &mut ctx).unwrap();

    assert_eq!(decode.analysis.dropouts.len(), 1);
    assert_eq!(decode.analysis.recovered_dropouts(), 1);
    let best = decode.best().unwrap();
    assert_eq!(best.assumption.encoding, Encoding::Mfm);
    assert_eq!(best.crc_passes(), 6);
    assert!(best.records.iter().any(|r| r.flags.contains(BitFlags::RECOVERED)));
    assert!(decode.verdict.is_confident());

    let expected: Vec<u8> = (1..=3u32).flat_map(|s| lcg_bytes(256, s)).collect();
    assert_eq!(decode.composite.bytes, expected);
}

#[test]
fn bitstream_input_skips_flux_stages() {
    let bits = mfm_track(2);
    let engine = DecodeHypothesisEngine::new(RecoveryConfig::default());
    let mut ctx = DecodeContext::new(false);
    let hypothesis = engine.decode_bitstream(&bits, Encoding::Mfm, &mut ctx).unwrap();

    assert_eq!(hypothesis.crc_passes(), 4);
    assert_eq!(hypothesis.revolutions_voted, 0);
    assert!(hypothesis.source.is_none());
}

#[test]
fn mixed_mfm_and_fm_sectors_both_pass() {
    let mut mfm = TrackWriter::new(Encoding::Mfm);
    mfm.gap(0x4E, 40);
    mfm.sector(SectorId::new(0, 0, 1, 0), &lcg_bytes(128, 11));
    mfm.gap(0x4E, 20);
    let mut fm = TrackWriter::new(Encoding::Fm);
    fm.gap(0xFF, 16);
    fm.sector(SectorId::new(0, 0, 2, 0), &lcg_bytes(128, 12));
    fm.gap(0xFF, 16);
    let mut bits = mfm.into_bits();
    bits.extend(fm.into_bits());

    let engine = DecodeHypothesisEngine::new(RecoveryConfig::default());
    let mut ctx = DecodeContext::new(true);
    let hypothesis = engine.decode_bitstream(&bits, Encoding::Mfm, &mut ctx).unwrap();

    assert_eq!(hypothesis.crc_passes(), 4);
    assert!(hypothesis
        .encoding_segments
        .iter()
        .any(|s| s.encoding == Some(Encoding::Fm)));
    let sectors: Vec<u8> = hypothesis
        .fields
        .iter()
        .filter(|f| f.crc_ok && f.bytes.len() == 128)
        .filter_map(|f| f.id.map(|id| id.sector))
        .collect();
    assert_eq!(sectors, vec![1, 2]);
    assert!(ctx.events().iter().any(|e| e.component == "mixed-encoding"));
}

#[test]
fn undetermined_cell_still_produces_a_result() {
    let captures = [vec![5_000u32; 4], vec![5_000u32; 4]];
    let set = MultiRevolutionSet::from_intervals(TrackId::new(9, 0), &captures).unwrap();
    let engine = DecodeHypothesisEngine::new(RecoveryConfig::default());
    let mut ctx = DecodeContext::for_track(set.track(), false);
    let decode = engine.run(&set, &mut ctx).unwrap();

    assert_eq!(decode.analysis.cell_source, CellSource::Undetermined);
    assert!(decode.hypotheses.is_empty());
    assert!(matches!(decode.verdict, Verdict::Inconclusive { best: None, .. }));
    assert_eq!(decode.degraded.as_deref(), Some(CELL_UNDETERMINED));

    let summary = TrackSummary::from_decode(&decode, Vec::new());
    assert_eq!(summary.nominal_cell_ns, None);
    assert_eq!(summary.degraded.as_deref(), Some(CELL_UNDETERMINED));
    assert!(!summary.confident);
}

#[test]
fn cell_hint_decodes_when_histogram_is_silent() {
    let flux = flux_for(&mfm_track(2), CELL_NS);
    let set = MultiRevolutionSet::from_intervals(TrackId::new(2, 0), &[flux.clone(), flux]).unwrap();
    let mut config = RecoveryConfig::default();
    config.histogram.min_peak_count = u32::MAX;
    config.nominal_cell_ns = Some(CELL_NS);
    let mut ctx = DecodeContext::new(false);
    let decode = DecodeHypothesisEngine::new(config).run(&set, &mut ctx).unwrap();

    assert_eq!(decode.analysis.cell_source, CellSource::Hint);
    assert_eq!(decode.best().unwrap().crc_passes(), 4);
}
