//! Track decoding: flux analysis once, then every decode assumption in
//! parallel, each carried through the full bit-level pipeline

use std::panic::{catch_unwind, AssertUnwindSafe};

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;

use crate::bitstream::{
    check_fields, correct_and_verify, detect_missing_clocks, locate_syncs,
    reconstruct_missing_clocks, reconstruct_syncs, repair_field, segment, separate_mixed_encoding,
    violation_rate, BitSlip, BitstreamRegion, Encoding, EncodingSegment, FieldCheck, FieldRepair,
    MissingClock, SyncMatch,
};
use crate::confidence::{track_step, Algorithm, ConfidenceBreakdown, SourceInfo, SourceStep};
use crate::config::{HypothesisConfig, PllMode, RecoveryConfig, RegionConfig};
use crate::context::DecodeContext;
use crate::error::{RecoveryError, Result};
use crate::flux::{
    align_revolutions, analyze_intervals, apply_recovery, classify_weak_zones, compensate_drift,
    compute_drift, detect_dropouts, encoding_cell_width, generate_timing_hypotheses,
    recover_dropouts, resync_intervals, score_timing_hypotheses, AdaptivePll, CellHistogram, DriftProfile, DropoutRegion,
    MultiRevolutionVoter, PllDecode, RevolutionBits, TimingEvidence, TimingHypothesis, WeakZone,
};
use crate::hypothesis::{merge_hypotheses, CompositeDecode, HypothesisSet, Verdict};
use crate::types::{
    BitFlags, BitRecord, FluxSample, HypothesisId, MultiRevolutionSet, Revolution, SampleFlags,
    TrackId,
};

/// Confidence given to cells inserted by slip correction
const INSERTED_CONFIDENCE: u8 = 50;
/// Ceiling for restored clock cells
const RESTORED_CLOCK_CONFIDENCE: u8 = 50;
/// Confidence given to cells changed by CRC-guided repair
const CORRECTED_CONFIDENCE: u8 = 75;
/// Windows a run of another encoding must span before it is decoded as such
const FOREIGN_SPAN_WINDOWS: usize = 2;
/// Degraded-result note for a track whose cell width could not be found
pub const CELL_UNDETERMINED: &str = "cell width undetermined";

/// The timing and encoding a hypothesis decodes under
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecodeAssumption {
    pub encoding: Encoding,
    pub cell_ns: f64,
    /// Initial phase as a fraction of the cell
    pub phase: f64,
    pub pll_mode: PllMode,
    /// Timing hypothesis this assumption was drawn from
    pub timing: Option<HypothesisId>,
}

impl DecodeAssumption {
    /// Assumption for a stream that arrives already clocked
    pub fn bitstream(encoding: Encoding) -> Self {
        Self {
            encoding,
            cell_ns: 0.0,
            phase: 0.0,
            pll_mode: PllMode::default(),
            timing: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeProgress {
    Started { index: usize, encoding: Encoding },
    Finished { index: usize, score: f64, confidence: u8 },
    Failed { index: usize, reason: String },
}

/// A revolution after dropout recovery and drift compensation
#[derive(Debug, Clone, Serialize)]
pub struct WorkingRevolution {
    pub revolution: u16,
    pub quality: f32,
    pub intervals: Vec<u32>,
    /// Sample flags, one per interval
    pub flags: Vec<SampleFlags>,
}

impl WorkingRevolution {
    fn from_samples(revolution: u16, quality: f32, samples: &[FluxSample]) -> Self {
        let mut previous = 0u64;
        let mut intervals = Vec::with_capacity(samples.len());
        let mut flags = Vec::with_capacity(samples.len());
        for sample in samples {
            let interval = sample.timestamp_ns.saturating_sub(previous);
            intervals.push(interval.min(u32::MAX as u64) as u32);
            flags.push(sample.flags);
            previous = sample.timestamp_ns;
        }
        Self {
            revolution,
            quality,
            intervals,
            flags,
        }
    }
}

/// Where the nominal cell width of a track came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CellSource {
    Histogram,
    /// Configured fallback after the histogram found no peaks
    Hint,
    Undetermined,
}

/// Everything learned from the flux before any bit is committed
#[derive(Debug, Clone, Serialize)]
pub struct FluxAnalysis {
    pub track: TrackId,
    pub histogram: CellHistogram,
    /// MFM-scale cell width; `None` when neither histogram nor hint gave one
    pub nominal_cell_ns: Option<f64>,
    pub cell_source: CellSource,
    pub drift: Vec<DriftProfile>,
    /// Drift similarity of each revolution to the best one
    pub drift_similarity: Vec<f64>,
    pub dropouts: Vec<DropoutRegion>,
    pub working: Vec<WorkingRevolution>,
    /// Ranked timing hypotheses per candidate encoding
    pub timing: Vec<(Encoding, HypothesisSet<TimingHypothesis>)>,
    pub source: Option<SourceInfo>,
}

impl FluxAnalysis {
    pub fn recovered_dropouts(&self) -> usize {
        self.dropouts.iter().filter(|d| d.recovered).count()
    }
}

/// One complete interpretation of a track
#[derive(Debug, Clone, Serialize)]
pub struct DecodeHypothesis {
    pub assumption: DecodeAssumption,
    pub bits: Vec<u8>,
    pub records: Vec<BitRecord>,
    pub syncs: Vec<SyncMatch>,
    pub slips: Vec<BitSlip>,
    /// Slip correction was attempted and refused for lowering the score
    pub slip_rejected: bool,
    pub missing_clocks: Vec<MissingClock>,
    pub restored_clocks: Vec<usize>,
    pub regions: Vec<BitstreamRegion>,
    pub encoding_segments: Vec<EncodingSegment>,
    pub fields: Vec<FieldCheck>,
    /// CRC-guided repairs applied to failing fields, revertible from `changes`
    pub repairs: Vec<FieldRepair>,
    pub weak_zones: Vec<WeakZone>,
    /// Revolutions that took part in the vote (0 when not voted)
    pub revolutions_voted: usize,
    pub breakdown: ConfidenceBreakdown,
    pub source: Option<SourceInfo>,
    pub failure: Option<String>,
}

impl DecodeHypothesis {
    fn failed(assumption: DecodeAssumption, reason: &str) -> Self {
        Self {
            assumption,
            bits: Vec::new(),
            records: Vec::new(),
            syncs: Vec::new(),
            slips: Vec::new(),
            slip_rejected: false,
            missing_clocks: Vec::new(),
            restored_clocks: Vec::new(),
            regions: Vec::new(),
            encoding_segments: Vec::new(),
            fields: Vec::new(),
            repairs: Vec::new(),
            weak_zones: Vec::new(),
            revolutions_voted: 0,
            breakdown: ConfidenceBreakdown::default(),
            source: None,
            failure: Some(reason.to_string()),
        }
    }

    pub fn crc_passes(&self) -> usize {
        self.fields.iter().filter(|f| f.crc_ok).count()
    }

    pub fn reconstructed_syncs(&self) -> usize {
        self.syncs.iter().filter(|s| s.is_reconstructed()).count()
    }

    /// Structural score used to rank hypotheses
    pub fn score(&self, config: &HypothesisConfig) -> f64 {
        config.sync_weight * self.syncs.len() as f64 + config.crc_weight * self.crc_passes() as f64
            - config.slip_weight * self.slips.len() as f64
    }

    fn reasons(&self) -> Vec<String> {
        let mut reasons = vec![
            format!("{} sync marks ({} reconstructed)", self.syncs.len(), self.reconstructed_syncs()),
            format!("{}/{} fields pass CRC", self.crc_passes(), self.fields.len()),
        ];
        if !self.slips.is_empty() {
            reasons.push(format!("{} bit slips corrected", self.slips.len()));
        }
        if !self.restored_clocks.is_empty() {
            reasons.push(format!("{} clocks restored", self.restored_clocks.len()));
        }
        if !self.repairs.is_empty() {
            reasons.push(format!("{} fields repaired by CRC", self.repairs.len()));
        }
        if !self.weak_zones.is_empty() {
            reasons.push(format!("{} weak zones", self.weak_zones.len()));
        }
        reasons
    }
}

/// Result of running the engine on one track
#[derive(Debug, Clone, Serialize)]
pub struct TrackDecode {
    pub track: TrackId,
    pub analysis: FluxAnalysis,
    pub hypotheses: HypothesisSet<DecodeHypothesis>,
    pub composite: CompositeDecode,
    pub verdict: Verdict,
    pub failed: usize,
    /// Why the track could not be decoded at all, when it could not
    pub degraded: Option<String>,
}

impl TrackDecode {
    pub fn best(&self) -> Option<&DecodeHypothesis> {
        self.hypotheses.best().map(|h| &h.value)
    }
}

/// Clock-recovered, voted stream handed to the structural stages
struct VotedStream {
    bits: Vec<u8>,
    records: Vec<BitRecord>,
    weak_zones: Vec<WeakZone>,
    revolutions_voted: usize,
    unanimous: usize,
    cell_trace: Vec<f64>,
}

pub struct DecodeHypothesisEngine {
    config: RecoveryConfig,
    progress: Option<Sender<DecodeProgress>>,
}

impl DecodeHypothesisEngine {
    pub fn new(config: RecoveryConfig) -> Self {
        if config.num_threads > 0 {
            // Fails harmlessly when the global pool already exists
            let _ = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_threads)
                .build_global();
        }
        Self {
            config,
            progress: None,
        }
    }

    pub fn with_progress(mut self, sender: Sender<DecodeProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    fn report(&self, event: DecodeProgress) {
        if let Some(ref sender) = self.progress {
            if !sender.is_closed() {
                let _ = sender.blocking_send(event);
            }
        }
    }

    /// Histogram, dropout recovery, drift compensation and timing hypotheses
    pub fn analyze_track(&self, set: &MultiRevolutionSet, ctx: &mut DecodeContext) -> Result<FluxAnalysis> {
        let track = set.track();
        let revolutions = set.revolutions();
        let all: Vec<u32> = revolutions.iter().flat_map(|r| r.intervals()).collect();

        let histogram = analyze_intervals(&all, &self.config.histogram);
        let (nominal, cell_source) = match (histogram.estimate.nominal(), self.config.nominal_cell_ns) {
            (Some(nominal), _) => {
                ctx.info(
                    "histogram",
                    format!("nominal cell {:.1} ns from {} peaks", nominal, histogram.peaks.len()),
                );
                (nominal, CellSource::Histogram)
            }
            (None, Some(hint)) => {
                ctx.warn(
                    "histogram",
                    format!(
                        "no cell width found in {} intervals, using configured {:.1} ns",
                        all.len(),
                        hint
                    ),
                );
                (hint, CellSource::Hint)
            }
            (None, None) => {
                ctx.warn(
                    "histogram",
                    format!("no cell width found in {} intervals and no hint configured", all.len()),
                );
                return Ok(Self::undetermined_analysis(set, histogram, ctx));
            }
        };

        let mut dropouts: Vec<Vec<DropoutRegion>> = revolutions
            .iter()
            .map(|r| detect_dropouts(r, nominal, &self.config.dropout))
            .collect();
        for (i, regions) in dropouts.iter_mut().enumerate() {
            if regions.is_empty() {
                continue;
            }
            let others: Vec<&Revolution> = revolutions
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, r)| r)
                .collect();
            let recovered = recover_dropouts(
                regions,
                &others,
                nominal,
                &self.config.pll,
                &self.config.dropout,
            );
            let message = format!(
                "revolution {}: {} dropouts, {} recovered",
                revolutions[i].index(),
                regions.len(),
                recovered
            );
            if recovered < regions.len() {
                ctx.warn("dropout", message);
            } else {
                ctx.info("dropout", message);
            }
        }

        let mut working = Vec::with_capacity(revolutions.len());
        let mut drift = Vec::with_capacity(revolutions.len());
        for (revolution, regions) in revolutions.iter().zip(&dropouts) {
            let mut samples = apply_recovery(revolution, regions);
            let recovered = Revolution::from_samples(
                revolution.index(),
                samples.clone(),
                revolution.index_time_ns(),
            )?;
            let profile = compute_drift(&recovered, nominal, self.config.drift.segments);
            compensate_drift(&profile, &mut samples);
            working.push(WorkingRevolution::from_samples(
                revolution.index(),
                revolution.quality(),
                &samples,
            ));
            drift.push(profile);
        }

        let best = set.best_revolution();
        let drift_similarity: Vec<f64> = drift
            .iter()
            .map(|p| p.similarity(&drift[best], self.config.drift.similarity_tolerance))
            .collect();

        let reference = &working[best].intervals;
        let pll_config = &self.config.pll;
        let timing: Vec<(Encoding, HypothesisSet<TimingHypothesis>)> = Encoding::PREFERENCE
            .into_iter()
            .map(|encoding| {
                let cell = encoding_cell_width(nominal, encoding);
                let mut hypotheses = generate_timing_hypotheses(cell, &self.config.hypotheses);
                score_timing_hypotheses(&mut hypotheses, &self.config.hypotheses, |h| {
                    let mut pll = AdaptivePll::with_phase(h.cell_ns, h.phase, pll_config.clone());
                    let bits = pll.decode(reference).bits;
                    let syncs = locate_syncs(&bits, encoding);
                    let crc_passes = check_fields(&bits, encoding, &syncs)
                        .iter()
                        .filter(|f| f.crc_ok)
                        .count();
                    TimingEvidence {
                        sync_hits: syncs.len(),
                        crc_passes,
                    }
                });
                (encoding, hypotheses)
            })
            .collect();

        let max_deviation = drift
            .iter()
            .map(|p| p.max_deviation_pct)
            .fold(0.0f64, f64::max);
        let recovered_count = dropouts.iter().flatten().filter(|d| d.recovered).count();
        let mut source = ctx.tracks_sources().then(|| {
            SourceInfo::root(
                SourceStep::new(Algorithm::Capture)
                    .on_track(track)
                    .param("revolutions", revolutions.len() as f64),
            )
        });
        source = track_step(
            source.as_ref(),
            SourceStep::new(Algorithm::Histogram)
                .on_track(track)
                .param("nominal_ns", nominal)
                .param("from_hint", if cell_source == CellSource::Hint { 1.0 } else { 0.0 }),
        );
        source = track_step(
            source.as_ref(),
            SourceStep::new(Algorithm::DropoutRecovery)
                .on_track(track)
                .param("recovered", recovered_count as f64),
        );
        source = track_step(
            source.as_ref(),
            SourceStep::new(Algorithm::DriftCompensation)
                .on_track(track)
                .param("max_deviation_pct", max_deviation),
        );

        Ok(FluxAnalysis {
            track,
            histogram,
            nominal_cell_ns: Some(nominal),
            cell_source,
            drift,
            drift_similarity,
            dropouts: dropouts.into_iter().flatten().collect(),
            working,
            timing,
            source,
        })
    }

    /// Analysis of a track with no usable cell width: raw intervals only,
    /// nothing to build decode assumptions from
    fn undetermined_analysis(
        set: &MultiRevolutionSet,
        histogram: CellHistogram,
        ctx: &DecodeContext,
    ) -> FluxAnalysis {
        let track = set.track();
        let working = set
            .revolutions()
            .iter()
            .map(|r| WorkingRevolution::from_samples(r.index(), r.quality(), r.samples()))
            .collect();
        let mut source = ctx.tracks_sources().then(|| {
            SourceInfo::root(
                SourceStep::new(Algorithm::Capture)
                    .on_track(track)
                    .param("revolutions", set.len() as f64),
            )
        });
        source = track_step(
            source.as_ref(),
            SourceStep::new(Algorithm::Histogram)
                .on_track(track)
                .param("peaks", histogram.peaks.len() as f64),
        );
        FluxAnalysis {
            track,
            histogram,
            nominal_cell_ns: None,
            cell_source: CellSource::Undetermined,
            drift: Vec::new(),
            drift_similarity: Vec::new(),
            dropouts: Vec::new(),
            working,
            timing: Vec::new(),
            source,
        }
    }

    /// Top timing hypotheses of every encoding, capped at the hypothesis limit
    pub fn assumptions(&self, analysis: &FluxAnalysis) -> Vec<DecodeAssumption> {
        let mut assumptions = Vec::new();
        for (encoding, hypotheses) in &analysis.timing {
            for h in hypotheses
                .all()
                .iter()
                .filter(|h| h.is_valid())
                .take(self.config.hypotheses.timing_candidates.max(1))
            {
                assumptions.push(DecodeAssumption {
                    encoding: *encoding,
                    cell_ns: h.value.cell_ns,
                    phase: h.value.phase,
                    pll_mode: self.config.pll.mode,
                    timing: Some(h.id()),
                });
            }
        }
        assumptions.truncate(self.config.hypotheses.max_hypotheses);
        assumptions
    }

    /// Decode one track under every assumption and merge the results
    pub fn run(&self, set: &MultiRevolutionSet, ctx: &mut DecodeContext) -> Result<TrackDecode> {
        let analysis = self.analyze_track(set, ctx)?;
        let assumptions = self.assumptions(&analysis);
        info!(
            "Track {}: decoding {} hypotheses over {} revolutions",
            analysis.track,
            assumptions.len(),
            analysis.working.len()
        );

        let parent = ctx.child();
        let outcomes: Vec<(DecodeAssumption, std::result::Result<DecodeHypothesis, String>, DecodeContext)> =
            assumptions
                .par_iter()
                .enumerate()
                .map(|(index, assumption)| {
                    self.report(DecodeProgress::Started {
                        index,
                        encoding: assumption.encoding,
                    });
                    let mut worker = parent.child();
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        self.decode_assumption(&analysis, assumption, &mut worker)
                    }));
                    let outcome = match outcome {
                        Ok(Ok(hypothesis)) => {
                            self.report(DecodeProgress::Finished {
                                index,
                                score: hypothesis.score(&self.config.hypotheses),
                                confidence: hypothesis.breakdown.combined,
                            });
                            Ok(hypothesis)
                        }
                        Ok(Err(err)) => {
                            let reason = err.to_string();
                            worker.warn("engine", format!("hypothesis {} failed: {}", index, reason));
                            self.report(DecodeProgress::Failed {
                                index,
                                reason: reason.clone(),
                            });
                            Err(reason)
                        }
                        Err(_) => {
                            let reason = format!("hypothesis {} panicked during decode", index);
                            warn!("{}", reason);
                            worker.warn("engine", reason.clone());
                            self.report(DecodeProgress::Failed {
                                index,
                                reason: reason.clone(),
                            });
                            Err(reason)
                        }
                    };
                    (*assumption, outcome, worker)
                })
                .collect();

        let mut hypotheses = HypothesisSet::new();
        let mut failed = 0usize;
        for (assumption, outcome, worker) in outcomes {
            ctx.merge(worker);
            match outcome {
                Ok(hypothesis) => {
                    let score = hypothesis.score(&self.config.hypotheses);
                    let confidence = hypothesis.breakdown.combined;
                    hypotheses.push(hypothesis, score, confidence);
                }
                Err(reason) => {
                    failed += 1;
                    let id = hypotheses.push(DecodeHypothesis::failed(assumption, &reason), 0.0, 0);
                    hypotheses.reject(id, reason)?;
                }
            }
        }
        for h in hypotheses.iter_mut() {
            let id = h.id();
            for record in &mut h.value.records {
                record.hypothesis = Some(id);
            }
            if h.is_valid() {
                h.reasons = h.value.reasons();
            }
        }
        hypotheses.rank();

        let composite = merge_hypotheses(
            &hypotheses,
            self.config.low_confidence_policy,
            self.config.low_confidence_floor,
        );
        let verdict = hypotheses.verdict(self.config.hypotheses.min_confidence);
        let degraded = (analysis.cell_source == CellSource::Undetermined)
            .then(|| CELL_UNDETERMINED.to_string());
        if let Some(ref note) = degraded {
            warn!("Track {}: {}, no hypotheses decoded", analysis.track, note);
        }
        match verdict {
            Verdict::Confident { best, confidence } => ctx.info(
                "engine",
                format!("{} selected with confidence {}", best, confidence),
            ),
            Verdict::Inconclusive { best, confidence, required } => ctx.warn(
                "engine",
                format!(
                    "inconclusive: best {:?} reached {}, {} required",
                    best, confidence, required
                ),
            ),
        }

        Ok(TrackDecode {
            track: analysis.track,
            analysis,
            hypotheses,
            composite,
            verdict,
            failed,
            degraded,
        })
    }

    /// Structural stages on a stream that is already bits
    pub fn decode_bitstream(
        &self,
        bits: &[u8],
        encoding: Encoding,
        ctx: &mut DecodeContext,
    ) -> Result<DecodeHypothesis> {
        if bits.is_empty() {
            return Err(RecoveryError::InvalidInput("empty bitstream".to_string()));
        }
        if let Some(pos) = bits.iter().position(|&b| b > 1) {
            return Err(RecoveryError::InvalidInput(format!(
                "bit {} has value {}, expected 0 or 1",
                pos, bits[pos]
            )));
        }
        let stream = VotedStream {
            bits: bits.to_vec(),
            records: bits.iter().map(|&b| BitRecord::new(b, 100)).collect(),
            weak_zones: Vec::new(),
            revolutions_voted: 0,
            unanimous: 0,
            cell_trace: Vec::new(),
        };
        let source = ctx.tracks_sources().then(|| {
            SourceInfo::root(SourceStep::new(Algorithm::Capture).param("bits", bits.len() as f64))
        });
        self.structural_pass(DecodeAssumption::bitstream(encoding), stream, source, ctx)
    }

    fn clock_recovery(&self, analysis: &FluxAnalysis, assumption: &DecodeAssumption) -> Vec<PllDecode> {
        let mut pll = AdaptivePll::with_phase(assumption.cell_ns, assumption.phase, self.config.pll.clone());
        let encoding = assumption.encoding;
        match assumption.pll_mode {
            PllMode::Global => analysis
                .working
                .iter()
                .map(|w| decode_resynced(&mut pll, &w.intervals, encoding))
                .collect(),
            PllMode::PerTrack => analysis
                .working
                .iter()
                .map(|w| {
                    pll.reset();
                    decode_resynced(&mut pll, &w.intervals, encoding)
                })
                .collect(),
            PllMode::PerRegion => analysis
                .working
                .iter()
                .map(|w| {
                    pll.reset();
                    let first_pass = decode_resynced(&mut pll, &w.intervals, encoding);
                    let regions = segment(&first_pass.bits, &first_pass.cell_trace, &self.config.regions);
                    if regions.iter().any(|r| r.needs_redecode) {
                        pll.decode_regions(&w.intervals, &first_pass, &regions).decode
                    } else {
                        first_pass
                    }
                })
                .collect(),
        }
    }

    fn decode_assumption(
        &self,
        analysis: &FluxAnalysis,
        assumption: &DecodeAssumption,
        ctx: &mut DecodeContext,
    ) -> Result<DecodeHypothesis> {
        let track = analysis.track;
        let decodes = self.clock_recovery(analysis, assumption);
        let bit_flags: Vec<Vec<BitFlags>> = decodes
            .iter()
            .zip(&analysis.working)
            .map(|(decode, working)| interval_bit_flags(decode, &working.flags))
            .collect();

        let mut source = track_step(
            analysis.source.as_ref(),
            SourceStep::new(Algorithm::TimingHypothesis)
                .on_track(track)
                .param("cell_ns", assumption.cell_ns)
                .param("phase", assumption.phase),
        );
        source = track_step(
            source.as_ref(),
            SourceStep::new(Algorithm::Pll).on_track(track).param(
                "locked_fraction",
                decodes.iter().map(|d| d.locked_fraction).sum::<f64>() / decodes.len().max(1) as f64,
            ),
        );

        let stream = if decodes.len() >= self.config.voting.min_revolutions {
            let raw: Vec<Vec<u8>> = decodes.iter().map(|d| d.bits.clone()).collect();
            let alignment = align_revolutions(&raw, self.config.voting.alignment_search);
            let inputs: Vec<RevolutionBits> = alignment
                .bits
                .iter()
                .enumerate()
                .map(|(i, bits)| {
                    RevolutionBits::new(analysis.working[i].revolution, bits.clone()).with_weight(
                        analysis.working[i].quality,
                        alignment.scores[i] * analysis.drift_similarity[i],
                    )
                })
                .collect();
            let voter = MultiRevolutionVoter::new(self.config.voting.clone(), self.config.weak_zones.clone());
            let mut vote = voter.vote(&inputs)?;
            classify_weak_zones(&mut vote.weak_zones, vote.bits.len(), &self.config.weak_zones);

            let start = alignment.offsets.iter().map(|&o| (-o).max(0)).max().unwrap_or(0);
            for (r, flags) in bit_flags.iter().enumerate() {
                let base = (start + alignment.offsets[r]) as usize;
                for (record, extra) in vote.records.iter_mut().zip(flags.iter().skip(base)) {
                    record.flags |= *extra;
                }
            }
            let base = (start + alignment.offsets[0]) as usize;
            let cell_trace = decodes[0]
                .cell_trace
                .iter()
                .skip(base)
                .take(vote.bits.len())
                .copied()
                .collect();

            source = track_step(
                source.as_ref(),
                SourceStep::new(Algorithm::Alignment)
                    .on_track(track)
                    .param("min_score", alignment.scores.iter().copied().fold(1.0, f64::min)),
            );
            source = track_step(
                source.as_ref(),
                SourceStep::new(Algorithm::Voting)
                    .on_track(track)
                    .param("revolutions", vote.revolutions as f64)
                    .param("weak_zones", vote.weak_zones.len() as f64),
            );
            VotedStream {
                bits: vote.bits,
                records: vote.records,
                weak_zones: vote.weak_zones,
                revolutions_voted: vote.revolutions,
                unanimous: vote.unanimous,
                cell_trace,
            }
        } else {
            ctx.warn(
                "voter",
                format!(
                    "{} revolution(s), voting needs {}; keeping clock-recovery confidence",
                    decodes.len(),
                    self.config.voting.min_revolutions
                ),
            );
            let best = analysis
                .working
                .iter()
                .enumerate()
                .fold(0usize, |best, (i, w)| {
                    if w.quality > analysis.working[best].quality {
                        i
                    } else {
                        best
                    }
                });
            let decode = &decodes[best];
            let records = decode
                .bits
                .iter()
                .zip(&decode.confidences)
                .zip(&bit_flags[best])
                .map(|((&b, &c), &flags)| BitRecord::new(b, c).with_flags(flags))
                .collect();
            VotedStream {
                bits: decode.bits.clone(),
                records,
                weak_zones: Vec::new(),
                revolutions_voted: 0,
                unanimous: 0,
                cell_trace: decode.cell_trace.clone(),
            }
        };

        self.structural_pass(*assumption, stream, source, ctx)
    }

    /// Slip correction, sync and clock reconstruction, fields and repair for
    /// one run of a single encoding, in the run's own bit coordinates
    fn decode_span(
        &self,
        encoding: Encoding,
        mut bits: Vec<u8>,
        mut records: Vec<BitRecord>,
        ctx: &mut DecodeContext,
    ) -> Result<SpanDecode> {
        let mut slips = Vec::new();
        let mut slip_rejected = false;
        match correct_and_verify(&bits, encoding, &self.config.slip) {
            Ok(correction) => {
                if !correction.slips.is_empty() {
                    ctx.info(
                        "bit-slip",
                        format!(
                            "{} slips corrected, structure {} -> {}",
                            correction.slips.len(),
                            correction.before.value(),
                            correction.after.value()
                        ),
                    );
                    records = apply_slips_to_records(&records, &correction.slips);
                    bits = correction.bits;
                }
                slips = correction.slips;
            }
            Err(err @ RecoveryError::StructuralViolation { .. }) => {
                slip_rejected = true;
                ctx.warn("bit-slip", err.to_string());
            }
            Err(err) => return Err(err),
        }

        let found = locate_syncs(&bits, encoding);
        let reconstruction = reconstruct_syncs(&bits, encoding, &found, &self.config.sync);
        for sync in &reconstruction.matches {
            for i in sync.offset..sync.end().min(records.len()) {
                let record = &mut records[i];
                record.flags |= BitFlags::SYNC;
                if sync.is_reconstructed() {
                    record.flags |= BitFlags::RECONSTRUCTED;
                    if record.value != reconstruction.repaired_bits[i] {
                        record.value = reconstruction.repaired_bits[i];
                        record.confidence = sync.confidence;
                    }
                }
            }
        }
        bits = reconstruction.repaired_bits;
        if reconstruction.reconstructed > 0 {
            ctx.info(
                "sync",
                format!(
                    "{} of {} {} marks reconstructed",
                    reconstruction.reconstructed,
                    reconstruction.matches.len(),
                    encoding.as_str()
                ),
            );
        }
        let syncs = reconstruction.matches;

        let missing_clocks = detect_missing_clocks(&bits, encoding, &syncs);
        let (repaired, restored_clocks) = reconstruct_missing_clocks(&bits, encoding, &missing_clocks);
        for clock in &missing_clocks {
            records[clock.offset].flags |= BitFlags::MISSING_CLOCK;
        }
        for &offset in &restored_clocks {
            let record = &mut records[offset];
            record.value = repaired[offset];
            record.confidence = record.confidence.min(RESTORED_CLOCK_CONFIDENCE);
            record.flags |= BitFlags::RECONSTRUCTED;
        }
        bits = repaired;

        let mut fields = check_fields(&bits, encoding, &syncs);
        let mut repairs: Vec<FieldRepair> = Vec::new();
        if self.config.repair.enabled && fields.iter().any(|f| !f.crc_ok) {
            let confidences: Vec<u8> = records.iter().map(|r| r.confidence).collect();
            for field in fields.iter().filter(|f| !f.crc_ok) {
                let repair = repair_field(&bits, encoding, field, &confidences, &self.config.repair);
                let Some(repair) = repair else {
                    continue;
                };
                repair.apply(&mut bits);
                for change in &repair.changes {
                    if let Some(record) = records.get_mut(change.offset) {
                        record.value = change.after;
                        record.confidence = CORRECTED_CONFIDENCE;
                        record.flags |= BitFlags::CORRECTED;
                    }
                }
                repairs.push(repair);
            }
            if !repairs.is_empty() {
                ctx.info(
                    "crc-repair",
                    format!(
                        "{} {} fields repaired, {} cells flipped",
                        repairs.len(),
                        encoding.as_str(),
                        repairs.iter().map(|r| r.flipped.len()).sum::<usize>()
                    ),
                );
                fields = check_fields(&bits, encoding, &syncs);
            }
        }

        Ok(SpanDecode {
            bits,
            records,
            slips,
            slip_rejected,
            reconstructed: reconstruction.reconstructed,
            syncs,
            missing_clocks,
            restored_clocks,
            fields,
            repairs,
        })
    }

    /// Per-encoding span decoding, then regions, scoring and provenance over
    /// the whole stream
    fn structural_pass(
        &self,
        assumption: DecodeAssumption,
        stream: VotedStream,
        mut source: Option<SourceInfo>,
        ctx: &mut DecodeContext,
    ) -> Result<DecodeHypothesis> {
        let encoding = assumption.encoding;
        let VotedStream {
            bits: voted,
            records: voted_records,
            weak_zones,
            revolutions_voted,
            unanimous,
            cell_trace,
        } = stream;
        let voted_len = voted.len();

        let spans = encoding_spans(&voted, encoding, &self.config.regions);
        if spans.len() > 1 {
            let layout: Vec<String> = spans
                .iter()
                .map(|s| format!("{} {}..{}", s.encoding.as_str(), s.start, s.end))
                .collect();
            ctx.info("mixed-encoding", format!("decoding spans {}", layout.join(", ")));
        }

        let mut bits = Vec::with_capacity(voted_len);
        let mut records = Vec::with_capacity(voted_len);
        let mut slips = Vec::new();
        let mut slip_rejected = false;
        let mut syncs = Vec::new();
        let mut reconstructed = 0usize;
        let mut missing_clocks = Vec::new();
        let mut restored_clocks = Vec::new();
        let mut fields = Vec::new();
        let mut repairs = Vec::new();
        let mut violations = 0.0f64;
        for span in &spans {
            let part = self.decode_span(
                span.encoding,
                voted[span.start..span.end].to_vec(),
                voted_records[span.start..span.end].to_vec(),
                ctx,
            )?;
            let base = bits.len();
            violations += violation_rate(&part.bits, span.encoding) * part.bits.len() as f64;
            slips.extend(part.slips.into_iter().map(|mut slip| {
                slip.offset += span.start;
                slip
            }));
            slip_rejected |= part.slip_rejected;
            syncs.extend(part.syncs.into_iter().map(|mut sync| {
                sync.offset += base;
                sync
            }));
            reconstructed += part.reconstructed;
            missing_clocks.extend(part.missing_clocks.into_iter().map(|mut clock| {
                clock.offset += base;
                clock
            }));
            restored_clocks.extend(part.restored_clocks.into_iter().map(|offset| offset + base));
            fields.extend(part.fields.into_iter().map(|field| field.shifted(base)));
            repairs.extend(part.repairs.into_iter().map(|repair| repair.shifted(base)));
            bits.extend(part.bits);
            records.extend(part.records);
        }

        source = track_step(
            source.as_ref(),
            SourceStep::new(Algorithm::BitSlipCorrection).param("slips", slips.len() as f64),
        );
        source = track_step(
            source.as_ref(),
            SourceStep::new(Algorithm::SyncReconstruction).param("reconstructed", reconstructed as f64),
        );
        source = track_step(
            source.as_ref(),
            SourceStep::new(Algorithm::MissingClockReconstruction)
                .param("restored", restored_clocks.len() as f64),
        );

        let trace: &[f64] = if slips.is_empty() && cell_trace.len() == bits.len() {
            &cell_trace
        } else {
            &[]
        };
        let regions = segment(&bits, trace, &self.config.regions);
        let encoding_segments = separate_mixed_encoding(&bits, &self.config.regions);
        source = track_step(
            source.as_ref(),
            SourceStep::new(Algorithm::RegionSegmentation).param("regions", regions.len() as f64),
        );
        source = track_step(
            source.as_ref(),
            SourceStep::new(Algorithm::MixedEncodingSeparation)
                .param("segments", encoding_segments.len() as f64)
                .param("spans", spans.len() as f64),
        );

        let passes = fields.iter().filter(|f| f.crc_ok).count();
        source = track_step(
            source.as_ref(),
            SourceStep::new(Algorithm::FieldCheck)
                .param("fields", fields.len() as f64)
                .param("crc_passes", passes as f64),
        );
        if !repairs.is_empty() {
            source = track_step(
                source.as_ref(),
                SourceStep::new(Algorithm::CrcRepair)
                    .param("fields", repairs.len() as f64)
                    .param(
                        "flipped",
                        repairs.iter().map(|r| r.flipped.len()).sum::<usize>() as f64,
                    ),
            );
        }

        let raw = if records.is_empty() {
            0.0
        } else {
            records.iter().map(|r| r.confidence as f64).sum::<f64>() / records.len() as f64
        };
        let crc = if fields.is_empty() {
            0.0
        } else {
            100.0 * passes as f64 / fields.len() as f64
        };
        let rate = if bits.is_empty() { 1.0 } else { violations / bits.len() as f64 };
        let pattern = (100.0 * (1.0 - rate * 10.0)).clamp(0.0, 100.0);
        let cross = if revolutions_voted > 0 && voted_len > 0 {
            100.0 * unanimous as f64 / voted_len as f64
        } else {
            0.0
        };
        let breakdown = ConfidenceBreakdown::new(raw, crc, pattern, cross, &self.config.confidence);
        debug!(
            "{:?} @ {:.1} ns: {} syncs, {}/{} CRC, {} repaired, confidence {}",
            encoding,
            assumption.cell_ns,
            syncs.len(),
            passes,
            fields.len(),
            repairs.len(),
            breakdown.combined
        );

        Ok(DecodeHypothesis {
            assumption,
            bits,
            records,
            syncs,
            slips,
            slip_rejected,
            missing_clocks,
            restored_clocks,
            regions,
            encoding_segments,
            fields,
            repairs,
            weak_zones,
            revolutions_voted,
            breakdown,
            source,
            failure: None,
        })
    }
}

/// Structural result for one single-encoding span
struct SpanDecode {
    bits: Vec<u8>,
    records: Vec<BitRecord>,
    slips: Vec<BitSlip>,
    slip_rejected: bool,
    reconstructed: usize,
    syncs: Vec<SyncMatch>,
    missing_clocks: Vec<MissingClock>,
    restored_clocks: Vec<usize>,
    fields: Vec<FieldCheck>,
    repairs: Vec<FieldRepair>,
}

/// A run of the stream decoded under one encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EncodingSpan {
    start: usize,
    end: usize,
    encoding: Encoding,
}

/// Split the stream into spans of one encoding each
///
/// The assumed encoding covers everything unless the stream also carries
/// it; then runs of another encoding at least `FOREIGN_SPAN_WINDOWS` windows
/// long are decoded under their own encoding.
fn encoding_spans(bits: &[u8], primary: Encoding, config: &RegionConfig) -> Vec<EncodingSpan> {
    let whole = vec![EncodingSpan {
        start: 0,
        end: bits.len(),
        encoding: primary,
    }];
    let segments = separate_mixed_encoding(bits, config);
    if !segments.iter().any(|s| s.encoding == Some(primary)) {
        return whole;
    }

    let min_len = config.window_bits.max(1) * FOREIGN_SPAN_WINDOWS;
    let mut spans: Vec<EncodingSpan> = Vec::new();
    for segment in segments {
        let encoding = match segment.encoding {
            Some(found) if found != primary && segment.end_bit - segment.start_bit >= min_len => found,
            _ => primary,
        };
        match spans.last_mut() {
            Some(last) if last.encoding == encoding => last.end = segment.end_bit,
            _ => spans.push(EncodingSpan {
                start: segment.start_bit,
                end: segment.end_bit,
                encoding,
            }),
        }
    }
    let contiguous = spans.first().is_some_and(|s| s.start == 0)
        && spans.last().is_some_and(|s| s.end == bits.len())
        && spans.windows(2).all(|w| w[0].end == w[1].start);
    if contiguous {
        spans
    } else {
        whole
    }
}

/// Decode once to place the sync marks, then again from the same starting
/// state with the loop reseeded after each mark
fn decode_resynced(pll: &mut AdaptivePll, intervals: &[u32], encoding: Encoding) -> PllDecode {
    let start = pll.clone();
    let first = pll.decode(intervals);
    let syncs = locate_syncs(&first.bits, encoding);
    if syncs.is_empty() {
        return first;
    }
    let points = resync_intervals(&first.interval_starts, syncs.iter().map(SyncMatch::end));
    *pll = start;
    pll.decode_with_resync(intervals, &points)
}

/// Per-bit flags carried over from the flux samples that produced each bit
fn interval_bit_flags(decode: &PllDecode, sample_flags: &[SampleFlags]) -> Vec<BitFlags> {
    let mut flags = vec![BitFlags::empty(); decode.bits.len()];
    for (k, &start) in decode.interval_starts.iter().enumerate() {
        let end = decode
            .interval_starts
            .get(k + 1)
            .copied()
            .unwrap_or(decode.bits.len());
        let Some(sample) = sample_flags.get(k) else {
            break;
        };
        let mut mapped = BitFlags::empty();
        if sample.contains(SampleFlags::INTERPOLATED) {
            mapped |= BitFlags::RECOVERED;
        }
        if sample.contains(SampleFlags::DROPOUT) {
            mapped |= BitFlags::UNCERTAIN;
        }
        if !mapped.is_empty() {
            for f in &mut flags[start..end] {
                *f |= mapped;
            }
        }
    }
    flags
}

/// Mirror slip edits onto the per-bit records
fn apply_slips_to_records(records: &[BitRecord], slips: &[BitSlip]) -> Vec<BitRecord> {
    let mut out = records.to_vec();
    let mut ordered: Vec<&BitSlip> = slips.iter().collect();
    ordered.sort_by(|a, b| b.offset.cmp(&a.offset));
    for slip in ordered {
        if slip.amount > 0 {
            if slip.offset < out.len() {
                out.remove(slip.offset);
            }
            if let Some(next) = out.get_mut(slip.offset) {
                next.flags |= BitFlags::SLIP;
            }
        } else {
            let at = slip.offset.min(out.len());
            out.insert(
                at,
                BitRecord::new(slip.fill_value, INSERTED_CONFIDENCE)
                    .with_flags(BitFlags::SLIP | BitFlags::INSERTED),
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::{FieldKind, SectorId, TrackWriter};

    const CELL_NS: f64 = 2000.0;

    fn mfm_track(sectors: u8) -> Vec<u8> {
        let mut writer = TrackWriter::new(Encoding::Mfm);
        writer.gap(0x4E, 40);
        for r in 1..=sectors {
            let data: Vec<u8> = (0..128u32).map(|i| (i * 7 + r as u32 * 13) as u8).collect();
            writer.sector(SectorId::new(0, 0, r, 0), &data);
        }
        writer.gap(0x4E, 20);
        writer.into_bits()
    }

    /// Flux intervals whose clean decode reproduces `bits` up to the last one
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

    fn set_from(captures: &[Vec<u32>]) -> MultiRevolutionSet {
        MultiRevolutionSet::from_intervals(TrackId::new(0, 0), captures).unwrap()
    }

    fn engine() -> DecodeHypothesisEngine {
        DecodeHypothesisEngine::new(RecoveryConfig::default())
    }

    #[test]
    fn test_analysis_finds_nominal_cell() {
        let flux = flux_for(&mfm_track(3), CELL_NS);
        let set = set_from(&[flux.clone(), flux]);
        let mut ctx = DecodeContext::for_track(set.track(), true);
        let analysis = engine().analyze_track(&set, &mut ctx).unwrap();

        assert!((analysis.nominal_cell_ns.unwrap() - CELL_NS).abs() < 100.0);
        assert_eq!(analysis.cell_source, CellSource::Histogram);
        assert_eq!(analysis.working.len(), 2);
        assert!(analysis.dropouts.is_empty());
        assert!(analysis.timing.iter().any(|(e, _)| *e == Encoding::Mfm));
        let source = analysis.source.unwrap();
        assert_eq!(source.last_algorithm(), Some(Algorithm::DriftCompensation));
    }

    #[test]
    fn test_noise_degrades_without_cell() {
        let set = set_from(&[vec![5_000u32; 4], vec![5_000u32; 4]]);
        let mut ctx = DecodeContext::new(false);
        let analysis = engine().analyze_track(&set, &mut ctx).unwrap();
        assert_eq!(analysis.cell_source, CellSource::Undetermined);
        assert_eq!(analysis.nominal_cell_ns, None);
        assert!(analysis.timing.is_empty());
        assert_eq!(analysis.working.len(), 2);
        assert!(engine().assumptions(&analysis).is_empty());
        assert!(ctx.warnings().any(|e| e.component == "histogram"));
    }

    #[test]
    fn test_undetermined_run_is_inconclusive() {
        let set = set_from(&[vec![5_000u32; 4], vec![5_000u32; 4]]);
        let mut ctx = DecodeContext::new(false);
        let decode = engine().run(&set, &mut ctx).unwrap();

        assert!(decode.hypotheses.is_empty());
        assert!(decode.best().is_none());
        assert!(matches!(decode.verdict, Verdict::Inconclusive { best: None, .. }));
        assert_eq!(decode.degraded.as_deref(), Some(CELL_UNDETERMINED));
        assert!(decode.composite.bytes.is_empty());
    }

    #[test]
    fn test_cell_hint_stands_in_for_histogram() {
        let flux = flux_for(&mfm_track(3), CELL_NS);
        let set = set_from(&[flux.clone(), flux]);
        let mut config = RecoveryConfig::default();
        config.histogram.min_peak_count = u32::MAX;
        config.nominal_cell_ns = Some(CELL_NS);
        let mut ctx = DecodeContext::new(false);
        let decode = DecodeHypothesisEngine::new(config).run(&set, &mut ctx).unwrap();

        assert_eq!(decode.analysis.cell_source, CellSource::Hint);
        assert_eq!(decode.degraded, None);
        let best = decode.best().unwrap();
        assert_eq!(best.assumption.encoding, Encoding::Mfm);
        assert_eq!(best.crc_passes(), 6);
        assert!(ctx.warnings().any(|e| e.component == "histogram"));
    }

    #[test]
    fn test_run_recovers_clean_mfm_track() {
        let flux = flux_for(&mfm_track(3), CELL_NS);
        let set = set_from(&[flux.clone(), flux.clone(), flux]);
        let mut ctx = DecodeContext::for_track(set.track(), true);
        let decode = engine().run(&set, &mut ctx).unwrap();

        let best = decode.best().unwrap();
        assert_eq!(best.assumption.encoding, Encoding::Mfm);
        assert_eq!(best.crc_passes(), 6);
        assert_eq!(best.revolutions_voted, 3);
        assert!(best.weak_zones.is_empty());
        assert!(decode.verdict.is_confident());
        assert_eq!(decode.composite.bytes.len(), 3 * 128);

        let id = decode.hypotheses.best().unwrap().id();
        assert!(best.records.iter().all(|r| r.hypothesis == Some(id)));
        let source = best.source.as_ref().unwrap();
        assert!(source.contains(Algorithm::Voting));
        assert_eq!(source.last_algorithm(), Some(Algorithm::FieldCheck));
    }

    #[test]
    fn test_single_revolution_degrades() {
        let flux = flux_for(&mfm_track(2), CELL_NS);
        let set = set_from(&[flux]);
        let mut ctx = DecodeContext::for_track(set.track(), false);
        let decode = engine().run(&set, &mut ctx).unwrap();

        let best = decode.best().unwrap();
        assert_eq!(best.revolutions_voted, 0);
        assert_eq!(best.breakdown.cross_validation, 0.0);
        assert!(best.records.iter().all(|r| !r.flags.contains(BitFlags::VOTED)));
        assert!(ctx.warnings().any(|e| e.component == "voter"));
        assert!(best.source.is_none());
    }

    #[test]
    fn test_decode_bitstream_checks_fields() {
        let bits = mfm_track(2);
        let mut ctx = DecodeContext::new(true);
        let hypothesis = engine().decode_bitstream(&bits, Encoding::Mfm, &mut ctx).unwrap();

        assert_eq!(hypothesis.syncs.len(), 12);
        assert_eq!(hypothesis.crc_passes(), 4);
        assert!(hypothesis.slips.is_empty());
        assert!(hypothesis
            .fields
            .iter()
            .any(|f| f.kind == FieldKind::Data && f.crc_ok));
        assert_eq!(hypothesis.records.len(), hypothesis.bits.len());
        assert!(hypothesis.breakdown.combined >= 75);
    }

    #[test]
    fn test_doubtful_cell_repaired_by_crc() {
        let original = mfm_track(2);
        let syncs = locate_syncs(&original, Encoding::Mfm);
        let data_start = check_fields(&original, Encoding::Mfm, &syncs)
            .iter()
            .find(|f| f.kind == FieldKind::Data)
            .unwrap()
            .start_bit;
        // Byte 10 of sector 1 is 0x53; its third data cell sits between two ones
        let at = data_start + 16 * 11 + 5;
        assert_eq!(original[at], 0);
        let mut bits = original.clone();
        bits[at] = 1;

        let mut records: Vec<BitRecord> = bits.iter().map(|&b| BitRecord::new(b, 100)).collect();
        records[at].confidence = 40;
        let stream = VotedStream {
            bits,
            records,
            weak_zones: Vec::new(),
            revolutions_voted: 0,
            unanimous: 0,
            cell_trace: Vec::new(),
        };
        let source = Some(SourceInfo::root(SourceStep::new(Algorithm::Capture)));
        let mut ctx = DecodeContext::new(true);
        let hypothesis = engine()
            .structural_pass(DecodeAssumption::bitstream(Encoding::Mfm), stream, source, &mut ctx)
            .unwrap();

        assert_eq!(hypothesis.repairs.len(), 1);
        assert_eq!(hypothesis.repairs[0].flipped, vec![at]);
        assert_eq!(hypothesis.crc_passes(), 4);
        assert_eq!(hypothesis.bits, original);
        assert!(hypothesis.records[at].flags.contains(BitFlags::CORRECTED));
        assert_eq!(hypothesis.records[at].value, 0);
        assert_eq!(hypothesis.records[at].confidence, CORRECTED_CONFIDENCE);
        let source = hypothesis.source.unwrap();
        assert_eq!(source.last_algorithm(), Some(Algorithm::CrcRepair));

        let mut reverted = hypothesis.bits.clone();
        hypothesis.repairs[0].revert(&mut reverted);
        assert_eq!(reverted[at], 1);
    }

    #[test]
    fn test_repair_disabled_keeps_failure() {
        let original = mfm_track(2);
        let syncs = locate_syncs(&original, Encoding::Mfm);
        let data_start = check_fields(&original, Encoding::Mfm, &syncs)
            .iter()
            .find(|f| f.kind == FieldKind::Data)
            .unwrap()
            .start_bit;
        let at = data_start + 16 * 11 + 5;
        let mut bits = original;
        bits[at] = 1;
        let mut records: Vec<BitRecord> = bits.iter().map(|&b| BitRecord::new(b, 100)).collect();
        records[at].confidence = 40;
        let stream = VotedStream {
            bits,
            records,
            weak_zones: Vec::new(),
            revolutions_voted: 0,
            unanimous: 0,
            cell_trace: Vec::new(),
        };
        let mut config = RecoveryConfig::default();
        config.repair.enabled = false;
        let mut ctx = DecodeContext::new(false);
        let hypothesis = DecodeHypothesisEngine::new(config)
            .structural_pass(DecodeAssumption::bitstream(Encoding::Mfm), stream, None, &mut ctx)
            .unwrap();
        assert!(hypothesis.repairs.is_empty());
        assert_eq!(hypothesis.crc_passes(), 3);
    }

    #[test]
    fn test_mixed_stream_decodes_each_span() {
        let mut bits = mfm_track(1);
        let mut fm = TrackWriter::new(Encoding::Fm);
        fm.gap(0xFF, 16);
        fm.sector(SectorId::new(0, 0, 2, 0), &[0xE5; 128]);
        fm.gap(0xFF, 16);
        bits.extend(fm.into_bits());

        let mut ctx = DecodeContext::new(false);
        let hypothesis = engine().decode_bitstream(&bits, Encoding::Mfm, &mut ctx).unwrap();
        assert_eq!(hypothesis.crc_passes(), 4);
        assert!(hypothesis.syncs.iter().any(|s| s.encoding == Encoding::Fm));
        assert!(hypothesis.syncs.iter().any(|s| s.encoding == Encoding::Mfm));
        let fm_data = hypothesis
            .fields
            .iter()
            .find(|f| f.kind == FieldKind::Data && f.id.map(|id| id.sector) == Some(2))
            .unwrap();
        assert!(fm_data.crc_ok);
        assert_eq!(fm_data.bytes, vec![0xE5; 128]);
        assert!(fm_data.start_bit > hypothesis.fields[0].end_bit);
    }

    #[test]
    fn test_uniform_stream_is_one_span() {
        let bits = mfm_track(2);
        let spans = encoding_spans(&bits, Encoding::Mfm, &RecoveryConfig::default().regions);
        assert_eq!(
            spans,
            vec![EncodingSpan {
                start: 0,
                end: bits.len(),
                encoding: Encoding::Mfm
            }]
        );
        // An FM reading of an MFM track keeps its assumption
        let spans = encoding_spans(&bits, Encoding::Fm, &RecoveryConfig::default().regions);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].encoding, Encoding::Fm);
    }

    #[test]
    fn test_decode_bitstream_rejects_non_binary() {
        let mut ctx = DecodeContext::new(false);
        let err = engine()
            .decode_bitstream(&[0, 1, 2], Encoding::Mfm, &mut ctx)
            .unwrap_err();
        assert!(matches!(err, RecoveryError::InvalidInput(_)));
    }

    #[test]
    fn test_slip_records_follow_bits() {
        let records: Vec<BitRecord> = [1u8, 0, 1, 1, 0].iter().map(|&b| BitRecord::new(b, 90)).collect();
        let slips = [
            BitSlip { offset: 1, amount: 1, fill_value: 0, confidence: 80 },
            BitSlip { offset: 4, amount: -1, fill_value: 1, confidence: 80 },
        ];
        let out = apply_slips_to_records(&records, &slips);
        let values: Vec<u8> = out.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1, 1, 1, 1, 0]);
        assert!(out[3].flags.contains(BitFlags::INSERTED));
        assert!(out[1].flags.contains(BitFlags::SLIP));
    }
}
