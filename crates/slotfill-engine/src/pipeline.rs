use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use slotfill_contracts::config::{Credentials, ImageConfig, StorageLayout};
use slotfill_contracts::events::{payload, EventWriter};
use slotfill_contracts::runs::cache::CacheStore;
use slotfill_contracts::runs::report::RegistryReport;
use uuid::Uuid;

use crate::analysis::{BatchAnalysis, ImageAnalysisService};
use crate::cancel::CancelToken;
use crate::matching::{MatchRun, MatchingEngine};
use crate::registry::{ImageRegistry, RegistryUpdate};
use crate::scan::{JsonContentScanner, SlotSource};
use crate::stock::StockPhotoService;
use crate::vision::VisionChain;

/// Provider availability as configured for this run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderStatus {
    pub vision: Vec<(String, bool)>,
    pub stock: Vec<(String, bool)>,
    /// Chain entries naming no known provider; they are ignored.
    pub unknown: Vec<String>,
}

#[derive(Debug)]
pub struct PipelineReport {
    pub run_id: String,
    pub update: RegistryUpdate,
    pub analysis: BatchAnalysis,
    pub matching: MatchRun,
    pub report: RegistryReport,
    pub report_path: PathBuf,
    pub cancelled: bool,
}

/// Wires configuration, credentials and storage into the services and runs
/// them in order: registry refresh, analysis of new images, matching (with
/// stock escalation), report. Every stage persists as it goes, so an
/// interrupted run keeps its progress.
pub struct ImagePipeline {
    config: ImageConfig,
    credentials: Credentials,
    layout: StorageLayout,
    run_id: String,
    events: EventWriter,
}

impl ImagePipeline {
    pub fn new(config: ImageConfig, credentials: Credentials, project_dir: &Path) -> Self {
        let layout = config.layout(project_dir);
        let run_id = format!("run-{}", Uuid::new_v4());
        let events = EventWriter::new(layout.events.clone(), run_id.clone());
        Self {
            config,
            credentials,
            layout,
            run_id,
            events,
        }
    }

    /// Loads `image-config.json` overrides and credentials from the
    /// environment.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config = ImageConfig::load(project_dir)
            .with_context(|| format!("failed loading image config for {}", project_dir.display()))?;
        Ok(Self::new(config, Credentials::from_env(), project_dir))
    }

    pub fn with_content_dir(mut self, content_dir: impl Into<PathBuf>) -> Self {
        let content_dir = content_dir.into();
        self.layout.content_dir = if content_dir.is_absolute() {
            content_dir
        } else {
            self.layout.project_dir.join(content_dir)
        };
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.run_id = events.run_id().to_string();
        self.events = events;
        self
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn slot_source(&self) -> Box<dyn SlotSource> {
        Box::new(JsonContentScanner::new(
            self.layout.project_dir.clone(),
            self.layout.content_dir.clone(),
        ))
    }

    pub fn open_registry(&self) -> Result<ImageRegistry> {
        self.open_registry_with(self.slot_source())
    }

    pub fn open_registry_with(&self, source: Box<dyn SlotSource>) -> Result<ImageRegistry> {
        let registry = ImageRegistry::open(&self.config, self.layout.clone(), source)?.with_events(self.events.clone());
        for warning in registry.load_warnings() {
            self.events.record("manifest_warning", payload(json!({ "warning": warning })));
        }
        Ok(registry)
    }

    pub fn vision_chain(&self) -> VisionChain {
        VisionChain::from_config(&self.config.providers.vision, &self.credentials).with_events(self.events.clone())
    }

    pub fn analysis_service(&self) -> ImageAnalysisService {
        ImageAnalysisService::new(self.vision_chain(), CacheStore::new(self.layout.cache.clone()))
            .with_max_file_size(self.config.processing.max_file_size)
            .with_events(self.events.clone())
    }

    pub fn stock_service(&self) -> StockPhotoService {
        StockPhotoService::from_config(&self.config.providers.stock, &self.credentials).with_events(self.events.clone())
    }

    pub fn matching_engine(&self) -> MatchingEngine {
        MatchingEngine::from_config(&self.config).with_events(self.events.clone())
    }

    pub fn provider_status(&self) -> ProviderStatus {
        let vision = self.vision_chain();
        let stock = self.stock_service();
        let mut unknown = vision.unknown_providers().to_vec();
        unknown.extend(stock.chain().unknown_providers().iter().cloned());
        ProviderStatus {
            vision: vision.status(),
            stock: stock.chain().status(),
            unknown,
        }
    }

    /// Analyzes every registered image without an analysis, recording each
    /// result and saving the manifest as it lands. `workers` overrides
    /// `concurrency.analysisWorkers`.
    pub fn analyze_pending(
        &self,
        service: &ImageAnalysisService,
        registry: &mut ImageRegistry,
        workers: Option<usize>,
        cancel: &CancelToken,
    ) -> Result<BatchAnalysis> {
        let keys = registry.unanalyzed_images();
        let by_path: BTreeMap<PathBuf, String> = keys
            .iter()
            .map(|key| (registry.absolute(key), key.clone()))
            .collect();
        let paths: Vec<PathBuf> = by_path.keys().cloned().collect();
        let workers = workers.unwrap_or(self.config.concurrency.analysis_workers).max(1);

        let mut save_error = None;
        let batch = service.analyze_all_with(&paths, workers, cancel, |path, result| {
            let (Ok(analyzed), Some(key)) = (result, by_path.get(path)) else {
                return;
            };
            registry.record_analysis(key, analyzed.analysis.clone(), analyzed.content_hash.clone());
            if save_error.is_none() {
                if let Err(err) = registry.save_manifest() {
                    save_error = Some(err);
                }
            }
        });
        if let Some(err) = save_error {
            return Err(err.context("failed saving manifest during analysis"));
        }
        Ok(batch)
    }

    /// Full pass. Returns after the report is written, also when cancelled.
    pub fn run(&self, cancel: &CancelToken) -> Result<PipelineReport> {
        self.run_with(self.open_registry()?, cancel)
    }

    pub fn run_with(&self, mut registry: ImageRegistry, cancel: &CancelToken) -> Result<PipelineReport> {
        self.events.emit(
            "run_started",
            payload(json!({
                "project_dir": self.layout.project_dir.to_string_lossy(),
                "content_dir": self.layout.content_dir.to_string_lossy(),
            })),
        )?;

        let update = registry.update_registry()?;

        let service = self.analysis_service();
        let analysis = if cancel.is_cancelled() {
            BatchAnalysis {
                cancelled: true,
                ..BatchAnalysis::default()
            }
        } else {
            self.analyze_pending(&service, &mut registry, None, cancel)?
        };

        let stock = self.stock_service();
        let matching = if cancel.is_cancelled() {
            MatchRun {
                cancelled: true,
                ..MatchRun::default()
            }
        } else {
            self.matching_engine().match_slots(&mut registry, Some(&stock), cancel)?
        };

        let cancelled = cancel.is_cancelled() || analysis.cancelled || matching.cancelled;
        registry.save_manifest()?;
        let extra = run_extra(&self.run_id, &analysis, &matching, cancelled);
        let report_path = registry.write_report(&update.stale_slots, &update.content_errors, Some(&extra))?;
        let report = registry.generate_report();

        self.events.emit(
            if cancelled { "run_cancelled" } else { "run_finished" },
            payload(json!({
                "report_path": report_path.to_string_lossy(),
                "matched_slots": report.matched_slots,
                "unmatched_required": report.unmatched_slots,
                "analyzed": analysis.analyzed.len(),
                "analysis_failures": analysis.failed.len(),
                "stock_cooldowns": stock.cooldowns_applied(),
            })),
        )?;

        Ok(PipelineReport {
            run_id: self.run_id.clone(),
            update,
            analysis,
            matching,
            report,
            report_path,
            cancelled,
        })
    }
}

fn run_extra(run_id: &str, analysis: &BatchAnalysis, matching: &MatchRun, cancelled: bool) -> Map<String, Value> {
    let failures: Vec<Value> = analysis
        .failed
        .iter()
        .map(|failure| json!({ "image": failure.path.to_string_lossy(), "error": failure.error }))
        .collect();
    let warnings: Vec<Value> = matching
        .outcomes
        .iter()
        .filter_map(|outcome| {
            outcome
                .warning
                .as_ref()
                .map(|warning| json!({ "slot": outcome.slot_id, "warning": warning }))
        })
        .collect();
    let mut extra = Map::new();
    extra.insert("runId".to_string(), json!(run_id));
    extra.insert("cancelled".to_string(), json!(cancelled));
    extra.insert(
        "analysis".to_string(),
        json!({
            "analyzed": analysis.analyzed.len(),
            "fromCache": analysis.analyzed.iter().filter(|item| item.cached).count(),
            "failed": failures,
            "skipped": analysis.skipped.len(),
        }),
    );
    extra.insert(
        "matching".to_string(),
        json!({
            "assigned": matching.assignments.len(),
            "placeholders": matching.outcomes.iter().filter(|outcome| outcome.placeholder).count(),
            "warnings": warnings,
        }),
    );
    extra
}
