use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;
use sha2::{Digest, Sha256};
use slotfill_contracts::events::{payload, EventWriter};
use slotfill_contracts::models::AnalysisResult;
use slotfill_contracts::runs::cache::CacheStore;

use crate::cancel::CancelToken;
use crate::vision::{payload_filename, ImagePayload, ProviderFailure, VisionChain};

/// Analysis of one image, plus where it came from.
#[derive(Debug, Clone)]
pub struct AnalyzedImage {
    pub path: PathBuf,
    pub analysis: AnalysisResult,
    pub content_hash: String,
    pub cached: bool,
    pub failures: Vec<ProviderFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Per-item results of a batch, in input order.
#[derive(Debug, Default)]
pub struct BatchAnalysis {
    pub analyzed: Vec<AnalyzedImage>,
    pub failed: Vec<AnalysisFailure>,
    pub skipped: Vec<PathBuf>,
    pub cancelled: bool,
}

/// Vision chain behind a content-addressed cache: an unchanged image is sent
/// to providers at most once, across calls and across runs.
pub struct ImageAnalysisService {
    chain: VisionChain,
    cache: Mutex<CacheStore>,
    max_file_size: Option<u64>,
    events: EventWriter,
}

impl ImageAnalysisService {
    pub fn new(chain: VisionChain, cache: CacheStore) -> Self {
        Self {
            chain,
            cache: Mutex::new(cache),
            max_file_size: None,
            events: EventWriter::disabled(),
        }
    }

    pub fn with_max_file_size(mut self, max_bytes: u64) -> Self {
        self.max_file_size = (max_bytes > 0).then_some(max_bytes);
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    pub fn chain(&self) -> &VisionChain {
        &self.chain
    }

    pub fn analyze_image(&self, path: &Path) -> Result<AnalyzedImage> {
        let size = fs::metadata(path)
            .with_context(|| format!("failed reading {}", path.display()))?
            .len();
        if let Some(limit) = self.max_file_size {
            if size > limit {
                bail!("{} is {size} bytes, above the {limit} byte limit", path.display());
            }
        }

        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let content_hash = content_hash(&bytes);

        if let Some(analysis) = self.lock_cache()?.get_analysis(&content_hash) {
            return Ok(AnalyzedImage {
                path: path.to_path_buf(),
                analysis,
                content_hash,
                cached: true,
                failures: Vec::new(),
            });
        }

        // Provider calls run without the cache lock held.
        let image = ImagePayload::from_bytes(payload_filename(path), bytes);
        let outcome = self.chain.analyze(&image);
        self.lock_cache()?
            .put_analysis(&content_hash, &path.to_string_lossy(), &outcome.analysis)
            .context("failed writing analysis cache")?;

        Ok(AnalyzedImage {
            path: path.to_path_buf(),
            analysis: outcome.analysis,
            content_hash,
            cached: false,
            failures: outcome.failures,
        })
    }

    pub fn analyze_all(&self, paths: &[PathBuf], workers: usize, cancel: &CancelToken) -> BatchAnalysis {
        self.analyze_all_with(paths, workers, cancel, |_, _| {})
    }

    /// Analyzes `paths` on up to `workers` threads. `on_item` runs on the
    /// calling thread as each image finishes, so callers can persist progress
    /// without sharing their state with the workers.
    pub fn analyze_all_with<F>(
        &self,
        paths: &[PathBuf],
        workers: usize,
        cancel: &CancelToken,
        mut on_item: F,
    ) -> BatchAnalysis
    where
        F: FnMut(&Path, &Result<AnalyzedImage>),
    {
        let workers = workers.clamp(1, paths.len().max(1));
        let next = AtomicUsize::new(0);
        let mut results: Vec<Option<Result<AnalyzedImage>>> = paths.iter().map(|_| None).collect();

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<(usize, Result<AnalyzedImage>)>();
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(path) = paths.get(index) else {
                        break;
                    };
                    let result = self.analyze_image(path);
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            for (index, result) in rx {
                let path = &paths[index];
                self.log_result(path, &result);
                on_item(path, &result);
                results[index] = Some(result);
            }
        });

        let mut batch = BatchAnalysis {
            cancelled: cancel.is_cancelled(),
            ..BatchAnalysis::default()
        };
        for (path, result) in paths.iter().zip(results) {
            match result {
                Some(Ok(analyzed)) => batch.analyzed.push(analyzed),
                Some(Err(err)) => batch.failed.push(AnalysisFailure {
                    path: path.clone(),
                    error: format!("{err:#}"),
                }),
                None => batch.skipped.push(path.clone()),
            }
        }
        batch
    }

    fn log_result(&self, path: &Path, result: &Result<AnalyzedImage>) {
        match result {
            Ok(analyzed) => self.events.record(
                "image_analyzed",
                payload(json!({
                    "image": path.to_string_lossy(),
                    "provider": analyzed.analysis.provider,
                    "confidence": analyzed.analysis.confidence,
                    "quality": analyzed.analysis.quality,
                    "cached": analyzed.cached,
                    "content_hash": analyzed.content_hash,
                })),
            ),
            Err(err) => self.events.record(
                "analysis_failed",
                payload(json!({
                    "image": path.to_string_lossy(),
                    "error": format!("{err:#}"),
                })),
            ),
        }
    }

    fn lock_cache(&self) -> Result<std::sync::MutexGuard<'_, CacheStore>> {
        self.cache
            .lock()
            .map_err(|_| anyhow!("analysis cache lock poisoned"))
    }
}

/// SHA-256 of the file bytes, hex encoded. Used as the image identity.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn file_content_hash(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(content_hash(&bytes))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    use slotfill_contracts::runs::cache::CacheStore;

    use super::{content_hash, ImageAnalysisService};
    use crate::cancel::CancelToken;
    use crate::http::ProviderError;
    use crate::vision::tests::{sample_analysis, ScriptedVision};
    use crate::vision::{VisionChain, OFFLINE_CONFIDENCE};

    #[test]
    fn second_analysis_of_same_image_is_served_from_cache() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = temp.path().join("roof.jpg");
        fs::write(&image, b"roof bytes")?;
        let cache_path = temp.path().join("analysis-cache.json");

        let provider = ScriptedVision::new("openai", 0.95, vec![Ok(sample_analysis(&["roof"]))]);
        let calls = provider.calls.clone();
        let service = ImageAnalysisService::new(
            VisionChain::new(vec![Box::new(provider)]),
            CacheStore::new(&cache_path),
        );

        let first = service.analyze_image(&image)?;
        let second = service.analyze_image(&image)?;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.analysis, first.analysis);
        assert_eq!(first.content_hash, content_hash(b"roof bytes"));
        assert_eq!(first.analysis.confidence, 0.95);
        Ok(())
    }

    #[test]
    fn cache_survives_a_new_service_and_keys_by_content() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let original = temp.path().join("a.jpg");
        let renamed = temp.path().join("b.jpg");
        fs::write(&original, b"same bytes")?;
        fs::write(&renamed, b"same bytes")?;
        let cache_path = temp.path().join("analysis-cache.json");

        let first = ScriptedVision::new("openai", 0.95, Vec::new());
        ImageAnalysisService::new(VisionChain::new(vec![Box::new(first)]), CacheStore::new(&cache_path))
            .analyze_image(&original)?;

        let second = ScriptedVision::new("openai", 0.95, Vec::new());
        let calls = second.calls.clone();
        let service =
            ImageAnalysisService::new(VisionChain::new(vec![Box::new(second)]), CacheStore::new(&cache_path));
        let analyzed = service.analyze_image(&renamed)?;
        assert!(analyzed.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn offline_fallback_answers_when_every_provider_fails() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = temp.path().join("team.jpg");
        fs::write(&image, b"team")?;
        let provider = ScriptedVision::new(
            "openai",
            0.95,
            vec![Err(ProviderError::malformed("openai", "garbage"))],
        );
        let service = ImageAnalysisService::new(
            VisionChain::new(vec![Box::new(provider)]),
            CacheStore::new(temp.path().join("cache.json")),
        );
        let analyzed = service.analyze_image(&image)?;
        assert_eq!(analyzed.analysis.confidence, OFFLINE_CONFIDENCE);
        assert_eq!(analyzed.failures.len(), 1);
        Ok(())
    }

    #[test]
    fn oversized_files_are_rejected_before_any_provider_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = temp.path().join("huge.jpg");
        fs::write(&image, vec![0_u8; 64])?;
        let provider = ScriptedVision::new("openai", 0.95, Vec::new());
        let calls = provider.calls.clone();
        let service = ImageAnalysisService::new(
            VisionChain::new(vec![Box::new(provider)]),
            CacheStore::new(temp.path().join("cache.json")),
        )
        .with_max_file_size(32);

        let err = service.analyze_image(&image).unwrap_err();
        assert!(format!("{err:#}").contains("byte limit"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn batch_collects_failures_per_image_in_input_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut paths: Vec<PathBuf> = Vec::new();
        for name in ["one.jpg", "missing.jpg", "three.jpg", "four.jpg"] {
            let path = temp.path().join(name);
            if name != "missing.jpg" {
                fs::write(&path, name.as_bytes())?;
            }
            paths.push(path);
        }
        let service = ImageAnalysisService::new(
            VisionChain::new(Vec::new()),
            CacheStore::new(temp.path().join("cache.json")),
        );

        let mut seen = 0;
        let batch = service.analyze_all_with(&paths, 3, &CancelToken::new(), |_, _| seen += 1);
        assert_eq!(seen, 4);
        assert_eq!(batch.analyzed.len(), 3);
        assert_eq!(batch.failed.len(), 1);
        assert_eq!(batch.failed[0].path, paths[1]);
        let order: Vec<&PathBuf> = batch.analyzed.iter().map(|item| &item.path).collect();
        assert_eq!(order, vec![&paths[0], &paths[2], &paths[3]]);
        assert!(!batch.cancelled);
        Ok(())
    }

    #[test]
    fn cancelled_batch_skips_remaining_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("one.jpg");
        fs::write(&path, b"x")?;
        let service = ImageAnalysisService::new(
            VisionChain::new(Vec::new()),
            CacheStore::new(temp.path().join("cache.json")),
        );
        let cancel = CancelToken::new();
        cancel.cancel();
        let batch = service.analyze_all(&[path.clone()], 2, &cancel);
        assert!(batch.cancelled);
        assert_eq!(batch.skipped, vec![path]);
        assert!(batch.analyzed.is_empty());
        Ok(())
    }
}
