use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use slotfill_contracts::models::MatchOrigin;
use slotfill_contracts::variations::VariationTemplate;
use slotfill_engine::matching::{SlotOutcome, SlotStatus};
use slotfill_engine::registry::{ImageRegistry, RegistryUpdate};
use slotfill_engine::stock::AttemptStatus;
use slotfill_engine::{BatchAnalysis, CancelToken, ImagePipeline};

#[derive(Debug, Parser)]
#[command(name = "slotfill", version, about = "Match photos to content image slots")]
struct Cli {
    /// Project directory holding content and `business-images/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Content directory, relative to the root unless absolute.
    #[arg(long, global = true)]
    content: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover slots and images and update the manifest.
    Scan,
    /// Analyze registered images that have no analysis yet.
    Analyze(AnalyzeArgs),
    /// Assign images to unmatched slots.
    Match(MatchArgs),
    /// Download the best stock photo for a query, optionally assigning it.
    FetchStock(FetchStockArgs),
    /// Scan, analyze, match with stock escalation, and report.
    Process,
    /// Write and print the manifest report.
    Report,
    /// Force an image onto a slot.
    Assign(AssignArgs),
    /// Remove matches.
    Clear(ClearArgs),
    /// Copy matched images to their public paths.
    Publish(PublishArgs),
    /// Show configured vision and stock providers.
    Providers,
    /// Count combinations of a `{a|b}` variation template.
    Variations(VariationsArgs),
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Debug, Parser)]
struct MatchArgs {
    /// Skip stock escalation for slots left unmatched.
    #[arg(long)]
    no_stock: bool,
}

#[derive(Debug, Parser)]
struct FetchStockArgs {
    #[arg(long)]
    query: Option<String>,
    /// Slot to assign the downloaded photo to; its context becomes the query
    /// when `--query` is absent.
    #[arg(long)]
    slot: Option<String>,
}

#[derive(Debug, Parser)]
struct AssignArgs {
    slot: String,
    image: PathBuf,
    #[arg(long)]
    score: Option<u32>,
}

#[derive(Debug, Parser)]
struct ClearArgs {
    slot: Option<String>,
    #[arg(long)]
    all: bool,
}

#[derive(Debug, Parser)]
struct PublishArgs {
    #[arg(long)]
    public_dir: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct VariationsArgs {
    template: String,
    /// Also print the first N rendered variations.
    #[arg(long, default_value_t = 0)]
    show: u64,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("slotfill error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    if let Command::Variations(args) = &cli.command {
        return run_variations(args);
    }
    let pipeline = build_pipeline(&cli.root, cli.content.as_deref())?;
    match cli.command {
        Command::Scan => run_scan(&pipeline),
        Command::Analyze(args) => run_analyze(&pipeline, args),
        Command::Match(args) => run_match(&pipeline, args),
        Command::FetchStock(args) => run_fetch_stock(&pipeline, args),
        Command::Process => run_process(&pipeline),
        Command::Report => run_report(&pipeline),
        Command::Assign(args) => run_assign(&pipeline, args),
        Command::Clear(args) => run_clear(&pipeline, args),
        Command::Publish(args) => run_publish(&pipeline, args),
        Command::Providers => run_providers(&pipeline),
        Command::Variations(_) => Ok(0),
    }
}

fn build_pipeline(root: &Path, content: Option<&Path>) -> Result<ImagePipeline> {
    if !root.is_dir() {
        bail!("project root {} is not a directory", root.display());
    }
    let pipeline = ImagePipeline::load(root)?;
    Ok(match content {
        Some(dir) => pipeline.with_content_dir(dir),
        None => pipeline,
    })
}

fn open_updated(pipeline: &ImagePipeline) -> Result<(ImageRegistry, RegistryUpdate)> {
    let mut registry = pipeline.open_registry()?;
    for warning in registry.load_warnings() {
        eprintln!("warning: {warning}");
    }
    let update = registry.update_registry()?;
    Ok((registry, update))
}

fn run_scan(pipeline: &ImagePipeline) -> Result<i32> {
    let (_, update) = open_updated(pipeline)?;
    print_update(&update);
    println!("Manifest: {}", pipeline.layout().manifest.display());
    Ok(0)
}

fn run_analyze(pipeline: &ImagePipeline, args: AnalyzeArgs) -> Result<i32> {
    let (mut registry, _) = open_updated(pipeline)?;
    let service = pipeline.analysis_service();
    let batch = pipeline.analyze_pending(&service, &mut registry, args.workers, &CancelToken::new())?;
    print_analysis(&batch);
    Ok(0)
}

fn run_match(pipeline: &ImagePipeline, args: MatchArgs) -> Result<i32> {
    let (mut registry, _) = open_updated(pipeline)?;
    let stock = (!args.no_stock).then(|| pipeline.stock_service());
    let run = pipeline
        .matching_engine()
        .match_slots(&mut registry, stock.as_ref(), &CancelToken::new())?;
    for outcome in &run.outcomes {
        print_outcome(outcome);
    }
    println!(
        "Matched {} slot(s); {} required slot(s) unmatched",
        run.assignments.len(),
        run.unmatched_required().len()
    );
    Ok(0)
}

fn run_fetch_stock(pipeline: &ImagePipeline, args: FetchStockArgs) -> Result<i32> {
    let (mut registry, _) = open_updated(pipeline)?;
    if let Some(id) = args.slot.as_deref() {
        if !registry.manifest().slots.contains_key(id) {
            bail!("unknown slot {id}");
        }
    }

    let service = pipeline.stock_service();
    if !service.is_available() {
        println!("No stock provider is configured; set UNSPLASH_ACCESS_KEY, PEXELS_API_KEY or PIXABAY_API_KEY.");
        return Ok(0);
    }
    if let Some(id) = args.slot.as_deref() {
        let outcome = pipeline
            .matching_engine()
            .assign_stock(&mut registry, &service, id, args.query.as_deref())?;
        print_outcome(&outcome);
        return Ok(0);
    }

    let Some(query) = args.query else {
        bail!("fetch-stock needs --query or --slot");
    };
    let dest = registry.layout().stock.clone();
    let fetch = service.fetch_best_match_excluding(&query, &dest, &registry.stock_photos_in_use())?;
    for attempt in &fetch.attempts {
        let status = match &attempt.status {
            AttemptStatus::Found => "found".to_string(),
            AttemptStatus::Empty => "no results".to_string(),
            AttemptStatus::Skipped => "not configured".to_string(),
            AttemptStatus::Failed { kind, message } => format!("{kind}: {message}"),
        };
        println!("  {:<10} {status}", attempt.provider);
    }
    let Some(record) = fetch.image else {
        println!("No stock photo found for \"{}\"", fetch.query);
        return Ok(0);
    };
    let key = registry.register_stock(record);
    println!("Downloaded {key}");
    registry.save_manifest()?;
    Ok(0)
}

fn run_process(pipeline: &ImagePipeline) -> Result<i32> {
    let report = pipeline.run(&CancelToken::new())?;
    print_update(&report.update);
    print_analysis(&report.analysis);
    for outcome in &report.matching.outcomes {
        print_outcome(outcome);
    }
    println!(
        "Slots: {} total, {} matched, {} required unmatched",
        report.report.total_slots,
        report.report.matched_slots,
        report.report.unmatched_slots.len()
    );
    println!("Report: {}", report.report_path.display());
    println!("Run: {}", report.run_id);
    Ok(0)
}

fn run_report(pipeline: &ImagePipeline) -> Result<i32> {
    let registry = pipeline.open_registry()?;
    let scan = registry.scan_for_image_slots()?;
    let discovered: BTreeSet<String> = scan.slots.iter().map(|definition| definition.slot_id()).collect();
    let stale: Vec<String> = registry
        .manifest()
        .slots
        .keys()
        .filter(|id| !discovered.contains(*id))
        .cloned()
        .collect();
    for error in &scan.errors {
        eprintln!("warning: skipped {}: {}", error.document, error.error);
    }
    let path = registry.write_report(&stale, &scan.errors, None)?;
    let report = registry.generate_report();
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("Report: {}", path.display());
    Ok(0)
}

fn run_assign(pipeline: &ImagePipeline, args: AssignArgs) -> Result<i32> {
    let (mut registry, _) = open_updated(pipeline)?;
    let image = args.image.to_string_lossy().to_string();
    let accepted = registry.assign_manual(&args.slot, &image, args.score)?;
    registry.save_manifest()?;
    if let Some(warning) = &accepted.warning {
        eprintln!("warning: {warning}");
    }
    println!("Assigned {} -> {}", accepted.slot_id, accepted.image);
    Ok(0)
}

fn run_clear(pipeline: &ImagePipeline, args: ClearArgs) -> Result<i32> {
    let mut registry = pipeline.open_registry()?;
    match (args.slot.as_deref(), args.all) {
        (None, true) => {
            let cleared = registry.clear_all();
            registry.save_manifest()?;
            println!("Cleared {cleared} match(es)");
        }
        (Some(slot), false) => {
            let was_matched = registry.clear_match(slot)?;
            registry.save_manifest()?;
            if was_matched {
                println!("Cleared {slot}");
            } else {
                println!("{slot} had no match");
            }
        }
        _ => bail!("pass either a slot id or --all"),
    }
    Ok(0)
}

fn run_publish(pipeline: &ImagePipeline, args: PublishArgs) -> Result<i32> {
    let registry = pipeline.open_registry()?;
    let public_dir = args
        .public_dir
        .unwrap_or_else(|| pipeline.layout().public_dir.clone());
    let summary = registry.publish_matches(&public_dir)?;
    for (slot, path) in &summary.published {
        println!("  {slot} -> {}", path.display());
    }
    for (slot, reason) in &summary.skipped {
        println!("  {slot} skipped: {reason}");
    }
    println!("Published {} image(s) to {}", summary.published.len(), public_dir.display());
    Ok(0)
}

fn run_providers(pipeline: &ImagePipeline) -> Result<i32> {
    let status = pipeline.provider_status();
    println!("Vision:");
    for (name, configured) in &status.vision {
        println!("  {name:<10} {}", availability(*configured));
    }
    println!("Stock:");
    for (name, configured) in &status.stock {
        println!("  {name:<10} {}", availability(*configured));
    }
    for name in &status.unknown {
        println!("Unknown provider in chain: {name}");
    }
    Ok(0)
}

fn run_variations(args: &VariationsArgs) -> Result<i32> {
    let template = VariationTemplate::parse(&args.template)?;
    println!("{}", template.count());
    for index in 0..args.show.min(template.count()) {
        println!("  {}", template.render(index));
    }
    Ok(0)
}

fn availability(configured: bool) -> &'static str {
    if configured {
        "configured"
    } else {
        "missing credentials"
    }
}

fn print_update(update: &RegistryUpdate) {
    println!(
        "Slots: {} discovered, {} new, {} updated",
        update.slots_discovered, update.slots_added, update.slots_updated
    );
    println!("Images: {} discovered, {} new", update.images_discovered, update.images_added);
    for slot in &update.stale_slots {
        println!("  stale slot kept: {slot}");
    }
    for image in &update.missing_images {
        println!("  missing image: {image}");
    }
    for error in &update.content_errors {
        println!("  skipped content {}: {}", error.document, error.error);
    }
}

fn print_analysis(batch: &BatchAnalysis) {
    let cached = batch.analyzed.iter().filter(|item| item.cached).count();
    println!(
        "Analyzed {} image(s) ({cached} from cache), {} failed",
        batch.analyzed.len(),
        batch.failed.len()
    );
    for failure in &batch.failed {
        println!("  {}: {}", failure.path.display(), failure.error);
    }
}

fn print_outcome(outcome: &SlotOutcome) {
    let detail = match &outcome.status {
        SlotStatus::Matched(assignment) => format!(
            "{} (score {}, {})",
            assignment.image,
            assignment.score,
            origin_label(assignment.origin)
        ),
        SlotStatus::NoCandidates => "no candidate images".to_string(),
        SlotStatus::BelowThreshold { best_image, best_score } => {
            format!("best {best_image} scored {best_score}, below threshold")
        }
        SlotStatus::StockMiss => "no stock photo found".to_string(),
        SlotStatus::StockFailed(err) => format!("stock fetch failed: {err}"),
    };
    let marker = if outcome.is_matched() {
        "ok"
    } else if outcome.required {
        "MISSING"
    } else {
        "skip"
    };
    println!("  [{marker}] {}: {detail}", outcome.slot_id);
    if let Some(warning) = &outcome.warning {
        println!("         warning: {warning}");
    }
}

fn origin_label(origin: MatchOrigin) -> &'static str {
    match origin {
        MatchOrigin::Engine => "engine",
        MatchOrigin::Stock => "stock",
        MatchOrigin::Manual => "manual",
    }
}
