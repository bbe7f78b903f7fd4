use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_IMAGE_CONFIG_JSON: &str = include_str!("../resources/default_image_config.json");
const OVERRIDE_FILE_NAME: &str = "image-config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    pub providers: ProvidersConfig,
    pub fallback: FallbackConfig,
    pub processing: ProcessingConfig,
    pub quality_presets: IndexMap<String, QualityPreset>,
    pub matching: MatchingConfig,
    pub storage: StorageConfig,
    pub concurrency: ConcurrencyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    pub vision: VisionConfig,
    pub stock: StockConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionConfig {
    pub chain: Vec<String>,
    #[serde(default)]
    pub models: VisionModels,
    pub timeout_secs: u64,
    pub rate_limit_retries: u32,
    pub rate_limit_backoff_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionModels {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockConfig {
    pub chain: Vec<String>,
    pub default_query: String,
    pub per_page: u32,
    pub timeout_secs: u64,
    pub rate_limit_cooldown_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStep {
    User,
    Stock,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackConfig {
    pub chain: Vec<FallbackStep>,
    pub min_relevance_score: u32,
    pub placeholder_style: String,
    pub placeholder_colors: PlaceholderColors,
}

impl FallbackConfig {
    pub fn allows(&self, step: FallbackStep) -> bool {
        self.chain.contains(&step)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderColors {
    pub primary: String,
    pub secondary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingConfig {
    pub formats: Vec<String>,
    pub max_file_size: u64,
}

impl ProcessingConfig {
    pub fn is_supported(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|value| value.to_str()) else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.formats.iter().any(|format| format.eq_ignore_ascii_case(&ext))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityPreset {
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchWeights {
    pub subject_match: f64,
    pub tag_match: f64,
    pub description_match: f64,
    pub business_relevance: f64,
    pub quality: f64,
}

impl MatchWeights {
    pub fn total(&self) -> f64 {
        self.subject_match
            + self.tag_match
            + self.description_match
            + self.business_relevance
            + self.quality
    }
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            subject_match: 20.0,
            tag_match: 15.0,
            description_match: 10.0,
            business_relevance: 30.0,
            quality: 25.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchBoosts {
    pub exact_filename_match: f64,
    pub component_name_match: f64,
}

impl Default for MatchBoosts {
    fn default() -> Self {
        Self {
            exact_filename_match: 50.0,
            component_name_match: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingConfig {
    pub weights: MatchWeights,
    #[serde(default)]
    pub boosts: MatchBoosts,
    pub stock_relevance_score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    pub root: String,
    pub pending: String,
    pub approved: String,
    pub stock: String,
    pub manifest: String,
    pub cache: String,
    pub events: String,
    pub report: String,
    pub content_dir: String,
    pub public_dir: String,
}

/// Storage locations resolved against a project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub project_dir: PathBuf,
    pub root: PathBuf,
    pub pending: PathBuf,
    pub approved: PathBuf,
    pub stock: PathBuf,
    pub manifest: PathBuf,
    pub cache: PathBuf,
    pub events: PathBuf,
    pub report: PathBuf,
    pub content_dir: PathBuf,
    pub public_dir: PathBuf,
}

impl StorageConfig {
    pub fn layout(&self, project_dir: &Path) -> StorageLayout {
        let root = project_dir.join(&self.root);
        StorageLayout {
            project_dir: project_dir.to_path_buf(),
            pending: root.join(&self.pending),
            approved: root.join(&self.approved),
            stock: root.join(&self.stock),
            manifest: root.join(&self.manifest),
            cache: root.join(&self.cache),
            events: root.join(&self.events),
            report: root.join(&self.report),
            content_dir: project_dir.join(&self.content_dir),
            public_dir: project_dir.join(&self.public_dir),
            root,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    pub analysis_workers: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        serde_json::from_str(DEFAULT_IMAGE_CONFIG_JSON).expect("embedded image config is valid")
    }
}

impl ImageConfig {
    /// Embedded defaults, deep-merged with `<root>/image-config.json` (or the
    /// file named by `SLOTFILL_CONFIG`), then model overrides from the
    /// environment.
    pub fn load(project_dir: &Path) -> anyhow::Result<Self> {
        let mut merged: Value = serde_json::from_str(DEFAULT_IMAGE_CONFIG_JSON)
            .context("embedded image config is invalid JSON")?;
        let override_path = override_config_path(project_dir, &merged);
        if override_path.exists() {
            let raw = std::fs::read_to_string(&override_path)
                .with_context(|| format!("failed reading {}", override_path.display()))?;
            let overlay: Value = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", override_path.display()))?;
            merge_json(&mut merged, &overlay);
        }
        let mut config: ImageConfig = serde_json::from_value(merged)
            .with_context(|| format!("invalid image config in {}", override_path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn layout(&self, project_dir: &Path) -> StorageLayout {
        self.storage.layout(project_dir)
    }

    /// Preset for a component; unknown components use `content`.
    pub fn quality_preset(&self, component: &str) -> Option<&QualityPreset> {
        self.quality_presets
            .get(&component.to_ascii_lowercase())
            .or_else(|| self.quality_presets.get("content"))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(model) = non_empty_env("VISION_MODEL_OPENAI") {
            self.providers.vision.models.openai = Some(model);
        }
        if let Some(model) = non_empty_env("VISION_MODEL_ANTHROPIC") {
            self.providers.vision.models.anthropic = Some(model);
        }
    }
}

/// Provider credentials. A missing key disables that provider only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
    pub unsplash: Option<String>,
    pub pexels: Option<String>,
    pub pixabay: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            openai: non_empty_env("OPENAI_API_KEY"),
            anthropic: non_empty_env("ANTHROPIC_API_KEY"),
            unsplash: non_empty_env("UNSPLASH_ACCESS_KEY"),
            pexels: non_empty_env("PEXELS_API_KEY"),
            pixabay: non_empty_env("PIXABAY_API_KEY"),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn has_stock(&self) -> bool {
        self.unsplash.is_some() || self.pexels.is_some() || self.pixabay.is_some()
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn override_config_path(project_dir: &Path, defaults: &Value) -> PathBuf {
    if let Some(explicit) = non_empty_env("SLOTFILL_CONFIG") {
        return PathBuf::from(explicit);
    }
    let root = defaults
        .pointer("/storage/root")
        .and_then(Value::as_str)
        .unwrap_or("business-images");
    project_dir.join(root).join(OVERRIDE_FILE_NAME)
}

/// Objects merge key by key; every other value in `overlay` replaces `base`.
pub fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
