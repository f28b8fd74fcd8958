use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use flux_recovery::capture::CaptureFile;
use flux_recovery::cli::Args;
use flux_recovery::config::RecoveryConfig;
use flux_recovery::context::DecodeContext;
use flux_recovery::flux::PreservationStoreBuilder;
use flux_recovery::hypothesis::{DecodeHypothesisEngine, DecodeProgress};
use flux_recovery::report::{RecoveryReport, ReportGenerator, ReportMetadata, TrackSummary};
use flux_recovery::types::TrackId;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    if let Err(e) = args.validate() {
        eprintln!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let mut config = match &args.config {
        Some(path) => RecoveryConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => RecoveryConfig::default(),
    };
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    println!("Flux Recovery v{}", env!("CARGO_PKG_VERSION"));
    println!("{}", "=".repeat(60));
    println!();
    println!("Configuration:");
    println!("  Track / head:       {} / {}", args.track, args.head);
    println!("  Captures:           {}", args.captures.len());
    println!("  PLL mode:           {:?}", config.pll.mode);
    println!("  Min revolutions:    {}", config.voting.min_revolutions);
    println!("  Max hypotheses:     {}", config.hypotheses.max_hypotheses);
    println!("  Low confidence:     {:?}", config.low_confidence_policy);
    println!();

    let track = TrackId::new(args.track, args.head);
    let set = CaptureFile::load_all(&args.captures, track).context("reading captures")?;
    let rpm = set.rpm_stats();
    println!(
        "Loaded {} revolutions, {:.1} rpm (min {:.1}, max {:.1})",
        set.len(),
        rpm.mean,
        rpm.min,
        rpm.max
    );

    if let Some(path) = &args.preserve {
        let mut builder = PreservationStoreBuilder::new();
        for revolution in set.revolutions() {
            builder.preserve(track, revolution)?;
        }
        let store = builder.seal();
        store
            .save_atomic(path, true)
            .await
            .with_context(|| format!("writing preservation store {}", path.display()))?;
        println!("Preserved {} revolutions to {}", store.len(), path.display());
    }
    println!();

    let (tx, mut rx) = mpsc::channel::<DecodeProgress>(64);
    let engine = DecodeHypothesisEngine::new(config.clone()).with_progress(tx);
    let track_sources = config.track_sources;
    let worker = tokio::task::spawn_blocking(move || {
        let mut ctx = DecodeContext::for_track(track, track_sources);
        let result = engine.run(&set, &mut ctx);
        (result, ctx)
    });

    while let Some(event) = rx.recv().await {
        match event {
            DecodeProgress::Started { index, encoding } => {
                debug!("Hypothesis {} started ({:?})", index, encoding)
            }
            DecodeProgress::Finished {
                index,
                score,
                confidence,
            } => info!(
                "Hypothesis {} finished: score {:.1}, confidence {}",
                index, score, confidence
            ),
            DecodeProgress::Failed { index, reason } => warn!("Hypothesis {} failed: {}", index, reason),
        }
    }

    let (result, ctx) = worker.await.context("decode worker panicked")?;
    let decode = result.context("track decode failed")?;

    println!("Results:");
    match decode.best() {
        Some(best) => {
            println!("  Encoding:           {:?}", best.assumption.encoding);
            println!("  Cell width:         {:.1} ns", best.assumption.cell_ns);
            println!("  Fields (CRC ok):    {} ({})", best.fields.len(), best.crc_passes());
            println!("  Sync marks:         {}", best.syncs.len());
            println!("  Slip corrections:   {}", best.slips.len());
            println!("  CRC repairs:        {}", best.repairs.len());
            println!("  Weak zones:         {}", best.weak_zones.len());
            println!(
                "  Confidence:         {} ({})",
                best.breakdown.combined,
                best.breakdown.level()
            );
        }
        None => match decode.degraded {
            Some(ref note) => println!("  No valid hypothesis ({})", note),
            None => println!("  No valid hypothesis"),
        },
    }
    println!(
        "  Composite:          {} regions, {} bytes, {} low confidence",
        decode.composite.regions.len(),
        decode.composite.bytes.len(),
        decode.composite.low_confidence_regions()
    );
    println!("  Verdict:            {:?}", decode.verdict);
    println!();

    let warnings: Vec<String> = ctx
        .warnings()
        .map(|e| format!("{}: {}", e.component, e.message))
        .collect();
    let metadata = ReportMetadata::new(
        args.captures
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
    );
    let report = RecoveryReport::new(metadata, vec![TrackSummary::from_decode(&decode, warnings)])?;
    let generator = ReportGenerator::new(&args.report_dir)?;
    let path = generator.write_json(&report)?;
    println!("Report written to {}", path.display());

    Ok(())
}
