use std::collections::BTreeSet;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{ImageConfig, MatchBoosts, MatchWeights};
use crate::models::{ImageRecord, Slot, SlotDefinition};

pub const MANIFEST_SCHEMA_VERSION: u64 = 1;

/// Matching policy persisted alongside the data it was applied to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestConfig {
    pub min_relevance_score: u32,
    #[serde(default)]
    pub vision_chain: Vec<String>,
    #[serde(default)]
    pub stock_chain: Vec<String>,
    #[serde(default)]
    pub weights: MatchWeights,
    #[serde(default)]
    pub boosts: MatchBoosts,
    #[serde(default = "default_stock_relevance_score")]
    pub stock_relevance_score: u32,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self::from(&ImageConfig::default())
    }
}

impl From<&ImageConfig> for ManifestConfig {
    fn from(config: &ImageConfig) -> Self {
        Self {
            min_relevance_score: config.fallback.min_relevance_score,
            vision_chain: config.providers.vision.chain.clone(),
            stock_chain: config.providers.stock.chain.clone(),
            weights: config.matching.weights,
            boosts: config.matching.boosts,
            stock_relevance_score: config.matching.stock_relevance_score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Updated,
    Unchanged,
}

/// The persisted aggregate: slots, images and their matches.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub path: PathBuf,
    pub schema_version: u64,
    pub updated_at: Option<String>,
    pub slots: IndexMap<String, Slot>,
    pub images: IndexMap<String, ImageRecord>,
    pub config: ManifestConfig,
    pub load_warnings: Vec<String>,
}

impl Manifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: MANIFEST_SCHEMA_VERSION,
            updated_at: None,
            slots: IndexMap::new(),
            images: IndexMap::new(),
            config: ManifestConfig::default(),
            load_warnings: Vec::new(),
        }
    }

    /// Loads the manifest at `path`.
    ///
    /// An absent file yields an empty manifest. A file that is not a JSON
    /// object is copied aside to `<name>.corrupt` and also yields an empty
    /// manifest. Individual entries that fail to parse are skipped with a
    /// warning. Only I/O failures other than "not found" are errors.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut manifest = Self::new(path.clone());
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(manifest),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", path.display()))
            }
        };

        let parsed = serde_json::from_str::<Value>(&raw).ok();
        let Some(obj) = parsed.as_ref().and_then(Value::as_object) else {
            let backup = corrupt_backup_path(&path);
            std::fs::copy(&path, &backup)
                .with_context(|| format!("failed backing up {}", path.display()))?;
            manifest.load_warnings.push(format!(
                "manifest was unreadable; started empty (backup at {})",
                backup.display()
            ));
            return Ok(manifest);
        };

        manifest.schema_version = obj
            .get("schemaVersion")
            .and_then(Value::as_u64)
            .unwrap_or(manifest.schema_version);
        manifest.updated_at = obj
            .get("updatedAt")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(config) = obj.get("config") {
            match serde_json::from_value::<ManifestConfig>(config.clone()) {
                Ok(parsed) => manifest.config = parsed,
                Err(err) => manifest
                    .load_warnings
                    .push(format!("ignored invalid manifest config: {err}")),
            }
        }

        if let Some(slots) = obj.get("slots").and_then(Value::as_object) {
            for (key, item) in slots {
                match serde_json::from_value::<Slot>(with_default_key(item, "id", key)) {
                    Ok(mut slot) => {
                        slot.normalize();
                        manifest.slots.insert(slot.id.clone(), slot);
                    }
                    Err(err) => manifest
                        .load_warnings
                        .push(format!("skipped slot '{key}': {err}")),
                }
            }
        }
        if let Some(images) = obj.get("images").and_then(Value::as_object) {
            for (key, item) in images {
                match serde_json::from_value::<ImageRecord>(with_default_key(item, "path", key)) {
                    Ok(mut image) => {
                        image.normalize();
                        manifest.images.insert(image.path.clone(), image);
                    }
                    Err(err) => manifest
                        .load_warnings
                        .push(format!("skipped image '{key}': {err}")),
                }
            }
        }
        Ok(manifest)
    }

    /// Writes through a temp file in the same directory and renames it into
    /// place, so readers never observe a partial document.
    pub fn save(&mut self) -> anyhow::Result<()> {
        self.updated_at = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        let body = serde_json::to_string_pretty(&self.to_value()?)?;
        let parent = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
        let mut staged = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("failed staging manifest in {}", parent.display()))?;
        staged.write_all(body.as_bytes())?;
        staged.as_file().sync_all()?;
        staged
            .persist(&self.path)
            .with_context(|| format!("failed writing {}", self.path.display()))?;
        Ok(())
    }

    pub fn to_value(&self) -> anyhow::Result<Value> {
        let mut payload = Map::new();
        payload.insert(
            "schemaVersion".to_string(),
            Value::Number(self.schema_version.into()),
        );
        payload.insert(
            "updatedAt".to_string(),
            self.updated_at
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        payload.insert("config".to_string(), serde_json::to_value(&self.config)?);
        payload.insert("slots".to_string(), serde_json::to_value(&self.slots)?);
        payload.insert("images".to_string(), serde_json::to_value(&self.images)?);
        Ok(Value::Object(payload))
    }

    /// Inserts a newly discovered slot or refreshes its description. Match
    /// data is never touched here.
    pub fn upsert_slot(&mut self, definition: &SlotDefinition) -> Upsert {
        let id = definition.slot_id();
        match self.slots.get_mut(&id) {
            Some(existing) => {
                if existing.apply_definition(definition) {
                    Upsert::Updated
                } else {
                    Upsert::Unchanged
                }
            }
            None => {
                self.slots.insert(id, Slot::from_definition(definition));
                Upsert::Added
            }
        }
    }

    /// Inserts an image unless one with the same path is already known, in
    /// which case its analysis and provenance are kept.
    pub fn upsert_image(&mut self, record: ImageRecord) -> Upsert {
        if self.images.contains_key(&record.path) {
            return Upsert::Unchanged;
        }
        self.images.insert(record.path.clone(), record);
        Upsert::Added
    }

    /// Content identities of every image currently referenced by a slot,
    /// including the originals behind approved copies.
    pub fn consumed_identities(&self) -> BTreeSet<String> {
        let mut consumed = BTreeSet::new();
        for slot in self.slots.values() {
            let Some(path) = slot.matched_image.as_deref() else {
                continue;
            };
            match self.images.get(path) {
                Some(image) => {
                    consumed.insert(image.identity());
                    if let Some(origin) = image.derived_from.as_deref() {
                        if let Some(original) = self.images.get(origin) {
                            consumed.insert(original.identity());
                        }
                    }
                }
                None => {
                    consumed.insert(format!("path:{path}"));
                }
            }
        }
        consumed
    }

    /// Image paths selected by no slot. Originals whose approved copy is in
    /// use count as used.
    pub fn unused_images(&self) -> Vec<String> {
        let consumed = self.consumed_identities();
        self.images
            .values()
            .filter(|image| !consumed.contains(&image.identity()))
            .map(|image| image.path.clone())
            .collect()
    }
}

fn with_default_key(item: &Value, field: &str, key: &str) -> Value {
    let mut item = item.clone();
    if let Some(obj) = item.as_object_mut() {
        obj.entry(field.to_string())
            .or_insert_with(|| Value::String(key.to_string()));
    }
    item
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("manifest.json");
    path.with_file_name(format!("{name}.corrupt"))
}

fn default_stock_relevance_score() -> u32 {
    75
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use crate::models::{
        AnalysisResult, BusinessRelevance, ImageRecord, ImageSource, MatchOrigin, SlotDefinition,
    };

    use super::{Manifest, Upsert};

    fn definition(field: &str, required: bool) -> SlotDefinition {
        SlotDefinition {
            document: "src/content/services/gutter.json".to_string(),
            field_path: field.to_string(),
            component: "service".to_string(),
            context: "gutter cleaning".to_string(),
            required,
            current_path: "/images/services/gutter.jpg".to_string(),
        }
    }

    fn analysis() -> AnalysisResult {
        AnalysisResult {
            subjects: vec!["gutter".to_string()],
            scene: "exterior".to_string(),
            description: String::new(),
            quality: 77,
            confidence: 0.95,
            tags: Vec::new(),
            business_relevance: BusinessRelevance::default(),
            provider: None,
        }
    }

    #[test]
    fn absent_manifest_loads_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let manifest = Manifest::load(temp.path().join("manifest.json"))?;
        assert!(manifest.slots.is_empty());
        assert!(manifest.images.is_empty());
        assert_eq!(manifest.config.min_relevance_score, 70);
        Ok(())
    }

    #[test]
    fn corrupt_manifest_loads_empty_and_keeps_backup() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("manifest.json");
        std::fs::write(&path, "{ not json")?;
        let manifest = Manifest::load(&path)?;
        assert!(manifest.slots.is_empty());
        assert_eq!(manifest.load_warnings.len(), 1);
        assert!(temp.path().join("manifest.json.corrupt").exists());
        Ok(())
    }

    #[test]
    fn save_and_load_roundtrip_preserves_order_and_matches() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("manifest.json");
        let mut manifest = Manifest::new(&path);
        manifest.upsert_slot(&definition("image", true));
        manifest.upsert_slot(&definition("gallery[0]", false));
        let mut image = ImageRecord::new("pending/gutter.jpg", ImageSource::User);
        image.mark_analyzed(analysis(), Some("hash-g".to_string()));
        manifest.upsert_image(image);
        if let Some(slot) = manifest.slots.get_mut("src/content/services/gutter.json:image") {
            slot.assign("pending/gutter.jpg", 81, MatchOrigin::Engine);
        }
        manifest.save()?;

        let loaded = Manifest::load(&path)?;
        assert_eq!(
            loaded.slots.keys().cloned().collect::<Vec<String>>(),
            vec![
                "src/content/services/gutter.json:image",
                "src/content/services/gutter.json:gallery[0]"
            ]
        );
        let slot = &loaded.slots["src/content/services/gutter.json:image"];
        assert_eq!(slot.relevance_score, Some(81));
        assert_eq!(slot.matched_by, Some(MatchOrigin::Engine));
        assert!(loaded.images["pending/gutter.jpg"].analyzed);
        assert!(loaded.updated_at.is_some());

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(
            raw["slots"]["src/content/services/gutter.json:image"]["matchedImage"],
            json!("pending/gutter.jpg")
        );
        assert_eq!(raw["config"]["minRelevanceScore"], json!(70));
        Ok(())
    }

    #[test]
    fn load_skips_bad_entries_and_restores_invariants() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("manifest.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "slots": {
                    "doc:a": {"component": "hero", "matchedImage": "", "relevanceScore": 50},
                    "doc:b": "not a slot"
                },
                "images": {
                    "pending/x.jpg": {"filename": "x.jpg", "source": "user", "analyzed": true}
                }
            }))?,
        )?;
        let manifest = Manifest::load(&path)?;
        assert_eq!(manifest.slots.len(), 1);
        assert_eq!(manifest.slots["doc:a"].id, "doc:a");
        assert!(!manifest.slots["doc:a"].is_matched());
        assert_eq!(manifest.slots["doc:a"].relevance_score, None);
        assert!(!manifest.images["pending/x.jpg"].analyzed);
        assert_eq!(manifest.load_warnings.len(), 1);
        Ok(())
    }

    #[test]
    fn upserts_are_idempotent() {
        let mut manifest = Manifest::new("manifest.json");
        assert_eq!(manifest.upsert_slot(&definition("image", true)), Upsert::Added);
        assert_eq!(manifest.upsert_slot(&definition("image", true)), Upsert::Unchanged);
        assert_eq!(manifest.upsert_slot(&definition("image", false)), Upsert::Updated);
        assert_eq!(manifest.slots.len(), 1);

        let image = ImageRecord::new("pending/a.jpg", ImageSource::User);
        assert_eq!(manifest.upsert_image(image.clone()), Upsert::Added);
        assert_eq!(manifest.upsert_image(image), Upsert::Unchanged);
        assert_eq!(manifest.images.len(), 1);
    }

    #[test]
    fn approved_copy_consumes_its_original() {
        let mut manifest = Manifest::new("manifest.json");
        manifest.upsert_slot(&definition("image", true));
        let mut original = ImageRecord::new("pending/a.jpg", ImageSource::User);
        original.mark_analyzed(analysis(), Some("hash-a".to_string()));
        let mut copy = original.clone();
        copy.path = "approved/a.jpg".to_string();
        copy.derived_from = Some("pending/a.jpg".to_string());
        manifest.upsert_image(original);
        manifest.upsert_image(copy);
        manifest.upsert_image(ImageRecord::new("pending/b.jpg", ImageSource::User));
        if let Some(slot) = manifest.slots.get_mut("src/content/services/gutter.json:image") {
            slot.assign("approved/a.jpg", 90, MatchOrigin::Engine);
        }
        assert!(manifest.consumed_identities().contains("hash-a"));
        assert_eq!(manifest.unused_images(), vec!["pending/b.jpg"]);
    }
}
