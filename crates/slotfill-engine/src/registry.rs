use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use slotfill_contracts::config::{FallbackConfig, FallbackStep, ImageConfig, ProcessingConfig, StorageLayout};
use slotfill_contracts::events::{payload, EventWriter};
use slotfill_contracts::models::{
    AnalysisResult, ImageRecord, ImageSource, MatchOrigin, SlotDefinition, StockAttribution,
};
use slotfill_contracts::runs::manifest::{Manifest, ManifestConfig, Upsert};
use slotfill_contracts::runs::report::{write_detailed_report, RegistryReport};

use crate::analysis::file_content_hash;
use crate::scan::{relative_path, scan_storage, ContentError, SlotScan, SlotSource};
use crate::stock::photo_key;

/// Score recorded for operator-forced matches when none is given.
pub const MANUAL_MATCH_SCORE: u32 = 85;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryUpdate {
    pub slots_discovered: usize,
    pub slots_added: usize,
    pub slots_updated: usize,
    pub images_discovered: usize,
    pub images_added: usize,
    /// Slots in the manifest that the content scan no longer produces.
    /// They are kept, matches included.
    pub stale_slots: Vec<String>,
    /// Registered images whose file is gone.
    pub missing_images: Vec<String>,
    /// Content documents skipped because they could not be parsed.
    pub content_errors: Vec<ContentError>,
}

/// Result of pointing a slot at an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedMatch {
    pub slot_id: String,
    pub image: String,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub published: Vec<(String, PathBuf)>,
    pub skipped: Vec<(String, String)>,
}

/// System of record for slots, images and matches. Owns the manifest; other
/// components read it through [`ImageRegistry::manifest`] and change it only
/// through the methods here.
pub struct ImageRegistry {
    layout: StorageLayout,
    processing: ProcessingConfig,
    fallback: FallbackConfig,
    manifest: Manifest,
    source: Box<dyn SlotSource>,
    events: EventWriter,
}

impl ImageRegistry {
    pub fn open(config: &ImageConfig, layout: StorageLayout, source: Box<dyn SlotSource>) -> Result<Self> {
        let mut manifest = Manifest::load(&layout.manifest)?;
        manifest.config = ManifestConfig::from(config);
        Ok(Self {
            layout,
            processing: config.processing.clone(),
            fallback: config.fallback.clone(),
            manifest,
            source,
            events: EventWriter::disabled(),
        })
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn load_warnings(&self) -> &[String] {
        &self.manifest.load_warnings
    }

    /// Re-reads the persisted manifest, dropping unsaved changes.
    pub fn load_manifest(&mut self) -> Result<&Manifest> {
        let config = self.manifest.config.clone();
        self.manifest = Manifest::load(&self.layout.manifest)?;
        self.manifest.config = config;
        Ok(&self.manifest)
    }

    pub fn save_manifest(&mut self) -> Result<()> {
        self.manifest.save()?;
        self.events.record(
            "manifest_saved",
            payload(json!({
                "path": self.manifest.path.to_string_lossy(),
                "slots": self.manifest.slots.len(),
                "images": self.manifest.images.len(),
            })),
        );
        Ok(())
    }

    /// Content slots, first definition wins per slot id.
    pub fn scan_for_image_slots(&self) -> Result<SlotScan> {
        let mut scan = self.source.scan_slots()?;
        let mut seen = BTreeSet::new();
        scan.slots.retain(|definition| seen.insert(definition.slot_id()));
        Ok(scan)
    }

    /// Image files in storage as unanalyzed records keyed by project-relative
    /// path. Stock files pick up their attribution sidecar when present.
    pub fn scan_available_images(&self) -> Result<Vec<ImageRecord>> {
        let mut records = Vec::new();
        for found in scan_storage(&self.layout, &self.processing)? {
            let mut record = ImageRecord::new(self.key_for(&found.path), found.area.source());
            if record.source == ImageSource::Stock {
                record.attribution = read_attribution(&found.path);
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Rescans content and storage and upserts both into the manifest, then
    /// saves. Existing matches and analyses are never discarded.
    pub fn update_registry(&mut self) -> Result<RegistryUpdate> {
        let SlotScan {
            slots: definitions,
            errors: content_errors,
        } = self.scan_for_image_slots()?;
        let images = self.scan_available_images()?;
        let mut update = RegistryUpdate {
            slots_discovered: definitions.len(),
            images_discovered: images.len(),
            content_errors,
            ..RegistryUpdate::default()
        };

        let discovered: BTreeSet<String> = definitions.iter().map(SlotDefinition::slot_id).collect();
        for definition in &definitions {
            match self.manifest.upsert_slot(definition) {
                Upsert::Added => update.slots_added += 1,
                Upsert::Updated => update.slots_updated += 1,
                Upsert::Unchanged => {}
            }
        }
        for record in images {
            if self.manifest.upsert_image(record) == Upsert::Added {
                update.images_added += 1;
            }
        }
        update.stale_slots = self
            .manifest
            .slots
            .keys()
            .filter(|id| !discovered.contains(*id))
            .cloned()
            .collect();
        update.missing_images = self
            .manifest
            .images
            .keys()
            .filter(|key| !self.absolute(key).exists())
            .cloned()
            .collect();

        self.save_manifest()?;
        self.events.record(
            "registry_updated",
            payload(json!({
                "slots_discovered": update.slots_discovered,
                "slots_added": update.slots_added,
                "slots_updated": update.slots_updated,
                "images_discovered": update.images_discovered,
                "images_added": update.images_added,
                "stale_slots": update.stale_slots,
                "missing_images": update.missing_images,
                "content_errors": content_error_rows(&update.content_errors),
            })),
        );
        Ok(update)
    }

    /// Provider photo keys (`provider:id`) of stock images currently matched
    /// to a slot. Stock searches skip these.
    pub fn stock_photos_in_use(&self) -> BTreeSet<String> {
        let matched: BTreeSet<&str> = self
            .manifest
            .slots
            .values()
            .filter_map(|slot| slot.matched_image.as_deref())
            .collect();
        self.manifest
            .images
            .values()
            .filter(|image| matched.contains(image.path.as_str()))
            .filter_map(|image| image.attribution.as_ref())
            .map(|attribution| photo_key(&attribution.provider, &attribution.photo_id))
            .collect()
    }

    /// Registered images that still need analysis and exist on disk.
    pub fn unanalyzed_images(&self) -> Vec<String> {
        self.manifest
            .images
            .values()
            .filter(|image| !image.analyzed)
            .filter(|image| self.absolute(&image.path).exists())
            .map(|image| image.path.clone())
            .collect()
    }

    pub fn record_analysis(&mut self, image_key: &str, analysis: AnalysisResult, content_hash: String) -> bool {
        match self.manifest.images.get_mut(image_key) {
            Some(image) => {
                image.mark_analyzed(analysis, Some(content_hash));
                true
            }
            None => false,
        }
    }

    /// Adds a freshly downloaded stock photo and returns its manifest key.
    pub fn register_stock(&mut self, mut record: ImageRecord) -> String {
        let key = self.key_for(Path::new(&record.path));
        record.path = key.clone();
        record.source = ImageSource::Stock;
        if let Some(existing) = self.manifest.images.get_mut(&key) {
            if existing.attribution.is_none() {
                existing.attribution = record.attribution;
            }
            if existing.content_hash.is_none() {
                existing.content_hash = record.content_hash;
            }
        } else {
            self.manifest.images.insert(key.clone(), record);
        }
        key
    }

    /// Points `slot_id` at `image_key`, first copying the image into the
    /// approved area. A failed copy leaves the slot on the original file and
    /// reports a warning instead of failing.
    pub fn accept_match(
        &mut self,
        slot_id: &str,
        image_key: &str,
        score: u32,
        origin: MatchOrigin,
    ) -> Result<AcceptedMatch> {
        if !self.manifest.slots.contains_key(slot_id) {
            bail!("unknown slot {slot_id}");
        }
        if !self.manifest.images.contains_key(image_key) {
            bail!("unknown image {image_key}");
        }
        let (image, warning) = match self.approve_image(image_key) {
            Ok(approved) => (approved, None),
            Err(err) => (
                image_key.to_string(),
                Some(format!("approval copy failed for {image_key}: {err:#}")),
            ),
        };
        if let Some(slot) = self.manifest.slots.get_mut(slot_id) {
            slot.assign(&image, score, origin);
        }
        Ok(AcceptedMatch {
            slot_id: slot_id.to_string(),
            image,
            warning,
        })
    }

    /// Operator override: assigns regardless of threshold. The image may be
    /// any supported file under the project; it is registered if new.
    pub fn assign_manual(&mut self, slot_id: &str, image_path: &str, score: Option<u32>) -> Result<AcceptedMatch> {
        if !self.manifest.slots.contains_key(slot_id) {
            bail!("unknown slot {slot_id}");
        }
        let key = self.key_for(Path::new(image_path));
        if !self.manifest.images.contains_key(&key) {
            let absolute = self.absolute(&key);
            if !absolute.is_file() {
                bail!("image not found: {}", absolute.display());
            }
            if !self.processing.is_supported(&absolute) {
                bail!("unsupported image format: {}", absolute.display());
            }
            let mut record = ImageRecord::new(key.clone(), ImageSource::User);
            record.content_hash = file_content_hash(&absolute).ok();
            self.manifest.images.insert(key.clone(), record);
        }
        self.accept_match(slot_id, &key, score.unwrap_or(MANUAL_MATCH_SCORE), MatchOrigin::Manual)
    }

    pub fn clear_match(&mut self, slot_id: &str) -> Result<bool> {
        let Some(slot) = self.manifest.slots.get_mut(slot_id) else {
            bail!("unknown slot {slot_id}");
        };
        let was_matched = slot.is_matched();
        slot.clear_match();
        Ok(was_matched)
    }

    pub fn clear_all(&mut self) -> usize {
        let mut cleared = 0;
        for slot in self.manifest.slots.values_mut() {
            if slot.is_matched() {
                cleared += 1;
            }
            slot.clear_match();
        }
        cleared
    }

    /// Copies every matched image to `public_dir/<currentPath>`.
    pub fn publish_matches(&self, public_dir: &Path) -> Result<PublishSummary> {
        let mut summary = PublishSummary::default();
        for slot in self.manifest.slots.values() {
            let Some(image) = slot.matched_image.as_deref().filter(|_| slot.is_matched()) else {
                continue;
            };
            let target = slot.current_path.trim();
            if target.is_empty() || target.contains("://") {
                summary
                    .skipped
                    .push((slot.id.clone(), "no local currentPath".to_string()));
                continue;
            }
            let relative = Path::new(target.trim_start_matches('/'));
            if relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_)))
            {
                summary
                    .skipped
                    .push((slot.id.clone(), format!("unsafe currentPath {target}")));
                continue;
            }
            let source = self.absolute(image);
            if !source.is_file() {
                summary
                    .skipped
                    .push((slot.id.clone(), format!("missing file {image}")));
                continue;
            }
            let destination = public_dir.join(relative);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).with_context(|| format!("failed creating {}", parent.display()))?;
            }
            fs::copy(&source, &destination)
                .with_context(|| format!("failed copying {} to {}", source.display(), destination.display()))?;
            summary.published.push((slot.id.clone(), destination));
        }
        Ok(summary)
    }

    pub fn generate_report(&self) -> RegistryReport {
        RegistryReport::from_manifest(&self.manifest, |path| self.absolute(path).exists())
    }

    /// Writes the detailed report: stale slots, skipped content documents,
    /// the placeholder listing and any caller extras.
    pub fn write_report(
        &self,
        stale_slots: &[String],
        content_errors: &[ContentError],
        extra: Option<&Map<String, Value>>,
    ) -> Result<PathBuf> {
        let report = self.generate_report();
        let mut fields = extra.cloned().unwrap_or_default();
        fields.insert("staleSlots".to_string(), json!(stale_slots));
        fields.insert("contentErrors".to_string(), content_error_rows(content_errors));
        fields.insert("placeholders".to_string(), Value::Array(self.placeholder_rows()));
        write_detailed_report(&self.layout.report, &self.manifest, &report, Some(&fields))?;
        Ok(self.layout.report.clone())
    }

    /// Unmatched slots the site should render as placeholders. Empty when the
    /// fallback chain has no placeholder step.
    fn placeholder_rows(&self) -> Vec<Value> {
        if !self.fallback.allows(FallbackStep::Placeholder) {
            return Vec::new();
        }
        self.manifest
            .slots
            .values()
            .filter(|slot| !slot.is_matched())
            .map(|slot| {
                json!({
                    "slotId": slot.id,
                    "component": slot.component,
                    "currentPath": slot.current_path,
                    "style": self.fallback.placeholder_style,
                    "colors": self.fallback.placeholder_colors,
                })
            })
            .collect()
    }

    pub fn absolute(&self, key: &str) -> PathBuf {
        let path = Path::new(key);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.layout.project_dir.join(path)
        }
    }

    fn key_for(&self, path: &Path) -> String {
        if path.is_absolute() {
            relative_path(&self.layout.project_dir, path)
        } else {
            relative_path(Path::new(""), path)
        }
    }

    /// Copies an image into the approved area and registers the copy as
    /// derived from it. Images already in the approved area are used as is.
    fn approve_image(&mut self, image_key: &str) -> Result<String> {
        let source = self.absolute(image_key);
        if source.starts_with(&self.layout.approved) {
            return Ok(image_key.to_string());
        }
        let Some(original) = self.manifest.images.get(image_key).cloned() else {
            bail!("unknown image {image_key}");
        };
        if let Some(existing) = self
            .manifest
            .images
            .values()
            .find(|image| image.derived_from.as_deref() == Some(image_key))
        {
            if self.absolute(&existing.path).is_file() {
                return Ok(existing.path.clone());
            }
        }

        fs::create_dir_all(&self.layout.approved)
            .with_context(|| format!("failed creating {}", self.layout.approved.display()))?;
        let mut destination = self.layout.approved.join(&original.filename);
        if destination.exists() {
            let stem = Path::new(&original.filename)
                .file_stem()
                .and_then(|value| value.to_str())
                .unwrap_or("image");
            let ext = Path::new(&original.filename)
                .extension()
                .and_then(|value| value.to_str())
                .unwrap_or("jpg");
            let hash = match original.content_hash.clone() {
                Some(hash) => hash,
                None => file_content_hash(&source)?,
            };
            let short: String = hash.chars().take(8).collect();
            destination = self.layout.approved.join(format!("{stem}-{short}.{ext}"));
        }
        fs::copy(&source, &destination)
            .with_context(|| format!("failed copying {} to {}", source.display(), destination.display()))?;

        let copy_key = self.key_for(&destination);
        let mut copy = original.clone();
        copy.path = copy_key.clone();
        copy.filename = destination
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or(&original.filename)
            .to_string();
        copy.derived_from = Some(image_key.to_string());
        self.manifest.images.insert(copy_key.clone(), copy);
        Ok(copy_key)
    }
}

fn content_error_rows(errors: &[ContentError]) -> Value {
    Value::Array(
        errors
            .iter()
            .map(|error| json!({"document": error.document, "error": error.error}))
            .collect(),
    )
}

fn read_attribution(image_path: &Path) -> Option<StockAttribution> {
    let name = image_path.file_name()?.to_str()?;
    let sidecar = image_path.with_file_name(format!("{name}.json"));
    let raw = fs::read_to_string(sidecar).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;
    use std::path::Path;

    use slotfill_contracts::config::{FallbackStep, ImageConfig};
    use slotfill_contracts::models::{ImageSource, MatchOrigin, SlotDefinition};

    use super::{ImageRegistry, MANUAL_MATCH_SCORE};
    use crate::scan::{ContentError, JsonContentScanner, StaticSlots};
    use crate::vision::tests::sample_analysis;

    pub(crate) fn definition(field: &str, component: &str, context: &str, required: bool) -> SlotDefinition {
        SlotDefinition {
            document: "src/content/homepage.json".to_string(),
            field_path: field.to_string(),
            component: component.to_string(),
            context: context.to_string(),
            required,
            current_path: format!("/images/{field}.jpg"),
        }
    }

    pub(crate) fn open(root: &Path, slots: Vec<SlotDefinition>) -> anyhow::Result<ImageRegistry> {
        let config = ImageConfig::default();
        ImageRegistry::open(&config, config.layout(root), Box::new(StaticSlots(slots)))
    }

    pub(crate) fn write_pending(root: &Path, name: &str, bytes: &[u8]) -> anyhow::Result<String> {
        let dir = root.join("business-images/pending");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(name), bytes)?;
        Ok(format!("business-images/pending/{name}"))
    }

    #[test]
    fn absent_manifest_opens_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry = open(temp.path(), Vec::new())?;
        assert!(registry.manifest().slots.is_empty());
        assert!(registry.manifest().images.is_empty());
        assert!(registry.load_warnings().is_empty());
        Ok(())
    }

    #[test]
    fn rescans_are_idempotent_and_keep_matches() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = write_pending(temp.path(), "roof.jpg", b"roof")?;
        let slots = vec![
            definition("hero", "hero", "wide exterior photo", true),
            definition("card", "card", "roof", false),
        ];
        let mut registry = open(temp.path(), slots.clone())?;

        let first = registry.update_registry()?;
        assert_eq!(first.slots_added, 2);
        assert_eq!(first.images_added, 1);
        registry.accept_match("src/content/homepage.json:hero", &image, 88, MatchOrigin::Engine)?;
        registry.save_manifest()?;

        let mut reopened = open(temp.path(), slots)?;
        let second = reopened.update_registry()?;
        assert_eq!(second.slots_added, 0);
        assert_eq!(second.slots_updated, 0);
        assert_eq!(second.images_added, 0);
        let ids: Vec<&String> = reopened.manifest().slots.keys().collect();
        assert_eq!(ids, vec!["src/content/homepage.json:hero", "src/content/homepage.json:card"]);
        let hero = &reopened.manifest().slots["src/content/homepage.json:hero"];
        assert_eq!(hero.relevance_score, Some(88));
        assert_eq!(hero.matched_image.as_deref(), Some("business-images/approved/roof.jpg"));
        Ok(())
    }

    #[test]
    fn vanished_slots_are_reported_stale_not_dropped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut registry = open(temp.path(), vec![definition("hero", "hero", "x", true)])?;
        registry.update_registry()?;

        let mut rescanned = open(temp.path(), Vec::new())?;
        let update = rescanned.update_registry()?;
        assert_eq!(update.stale_slots, vec!["src/content/homepage.json:hero"]);
        assert_eq!(rescanned.manifest().slots.len(), 1);
        Ok(())
    }

    #[test]
    fn accepted_match_copies_into_approved_and_shares_identity() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = write_pending(temp.path(), "team.jpg", b"team")?;
        let mut registry = open(temp.path(), vec![definition("team", "team", "our crew", false)])?;
        registry.update_registry()?;
        registry.record_analysis(&image, sample_analysis(&["team"]), "hash-team".to_string());

        let accepted = registry.accept_match("src/content/homepage.json:team", &image, 91, MatchOrigin::Engine)?;
        assert_eq!(accepted.image, "business-images/approved/team.jpg");
        assert!(accepted.warning.is_none());
        assert!(temp.path().join("business-images/pending/team.jpg").exists());
        assert!(temp.path().join("business-images/approved/team.jpg").exists());

        let copy = &registry.manifest().images["business-images/approved/team.jpg"];
        assert_eq!(copy.derived_from.as_deref(), Some(image.as_str()));
        assert_eq!(copy.identity(), "hash-team");
        assert!(copy.analyzed);
        assert!(registry.generate_report().unused_images.is_empty());
        Ok(())
    }

    #[test]
    fn failed_approval_copy_keeps_original_with_warning() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = write_pending(temp.path(), "van.jpg", b"van")?;
        fs::write(temp.path().join("business-images/approved"), b"not a directory")?;
        let mut registry = open(temp.path(), vec![definition("card", "card", "van", false)])?;
        registry.update_registry()?;

        let accepted = registry.accept_match("src/content/homepage.json:card", &image, 75, MatchOrigin::Engine)?;
        assert_eq!(accepted.image, image);
        assert!(accepted.warning.is_some());
        assert!(registry.manifest().slots["src/content/homepage.json:card"].is_matched());
        Ok(())
    }

    #[test]
    fn manual_assignment_registers_file_and_records_provenance() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::create_dir_all(temp.path().join("photos"))?;
        fs::write(temp.path().join("photos/owner.png"), b"owner")?;
        let mut registry = open(temp.path(), vec![definition("about", "about", "owner portrait", true)])?;
        registry.update_registry()?;

        assert!(registry.assign_manual("missing:slot", "photos/owner.png", None).is_err());
        assert!(registry
            .assign_manual("src/content/homepage.json:about", "photos/nope.png", None)
            .is_err());

        let accepted = registry.assign_manual("src/content/homepage.json:about", "photos/owner.png", None)?;
        let slot = &registry.manifest().slots["src/content/homepage.json:about"];
        assert_eq!(slot.matched_by, Some(MatchOrigin::Manual));
        assert_eq!(slot.relevance_score, Some(MANUAL_MATCH_SCORE));
        assert_eq!(accepted.image, "business-images/approved/owner.png");
        assert_eq!(registry.manifest().images["photos/owner.png"].source, ImageSource::User);
        Ok(())
    }

    #[test]
    fn clearing_is_explicit() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = write_pending(temp.path(), "a.jpg", b"a")?;
        let mut registry = open(
            temp.path(),
            vec![definition("hero", "hero", "x", true), definition("card", "card", "y", false)],
        )?;
        registry.update_registry()?;
        registry.accept_match("src/content/homepage.json:hero", &image, 80, MatchOrigin::Engine)?;

        assert!(registry.clear_match("src/content/homepage.json:hero")?);
        assert!(!registry.clear_match("src/content/homepage.json:card")?);
        assert!(registry.clear_match("nope").is_err());
        registry.accept_match("src/content/homepage.json:card", &image, 80, MatchOrigin::Engine)?;
        assert_eq!(registry.clear_all(), 1);
        assert!(registry.manifest().slots.values().all(|slot| !slot.is_matched()));
        Ok(())
    }

    #[test]
    fn publish_copies_matches_to_current_paths() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = write_pending(temp.path(), "hero.jpg", b"hero")?;
        let mut unsafe_slot = definition("card", "card", "y", false);
        unsafe_slot.current_path = "../escape.jpg".to_string();
        let mut registry = open(temp.path(), vec![definition("hero", "hero", "x", true), unsafe_slot])?;
        registry.update_registry()?;
        registry.accept_match("src/content/homepage.json:hero", &image, 90, MatchOrigin::Engine)?;
        registry.accept_match("src/content/homepage.json:card", &image, 90, MatchOrigin::Manual)?;

        let public = temp.path().join("public");
        let summary = registry.publish_matches(&public)?;
        assert_eq!(summary.published.len(), 1);
        assert_eq!(fs::read(public.join("images/hero.jpg"))?, b"hero");
        assert_eq!(summary.skipped[0].0, "src/content/homepage.json:card");
        Ok(())
    }

    #[test]
    fn report_lists_unmatched_required_and_writes_details() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut registry = open(
            temp.path(),
            vec![definition("hero", "hero", "x", true), definition("card", "card", "y", false)],
        )?;
        registry.update_registry()?;
        let report = registry.generate_report();
        assert_eq!(report.unmatched_slots, vec!["src/content/homepage.json:hero"]);

        let image = write_pending(temp.path(), "card.jpg", b"card")?;
        registry.update_registry()?;
        registry.accept_match("src/content/homepage.json:card", &image, 80, MatchOrigin::Engine)?;

        let skipped = vec![ContentError {
            document: "src/content/broken.json".to_string(),
            error: "invalid JSON".to_string(),
        }];
        let path = registry.write_report(&["old:slot".to_string()], &skipped, None)?;
        let written: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
        assert_eq!(written["staleSlots"][0], "old:slot");
        assert_eq!(written["summary"]["requiredSlots"], 1);
        assert_eq!(written["contentErrors"][0]["document"], "src/content/broken.json");

        let placeholders = written["placeholders"].as_array().cloned().unwrap_or_default();
        assert_eq!(placeholders.len(), 1);
        assert_eq!(placeholders[0]["slotId"], "src/content/homepage.json:hero");
        assert_eq!(placeholders[0]["component"], "hero");
        assert_eq!(placeholders[0]["currentPath"], "/images/hero.jpg");
        assert_eq!(placeholders[0]["style"], "gradient");
        assert_eq!(placeholders[0]["colors"]["primary"], "#4f46e5");
        Ok(())
    }

    #[test]
    fn placeholder_listing_follows_fallback_chain() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut config = ImageConfig::default();
        config.fallback.chain = vec![FallbackStep::User, FallbackStep::Stock];
        let mut registry = ImageRegistry::open(
            &config,
            config.layout(temp.path()),
            Box::new(StaticSlots(vec![definition("hero", "hero", "x", true)])),
        )?;
        registry.update_registry()?;
        let path = registry.write_report(&[], &[], None)?;
        let written: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
        assert_eq!(written["placeholders"], serde_json::json!([]));
        Ok(())
    }

    #[test]
    fn malformed_content_document_does_not_abort_update() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let content = temp.path().join("src/content");
        fs::create_dir_all(&content)?;
        fs::write(
            content.join("a-good.json"),
            r#"{"hero": {"component": "hero", "title": "Roof repair", "backgroundImage": "/images/hero.jpg"}}"#,
        )?;
        fs::write(content.join("b-bad.json"), "{ not json")?;
        let config = ImageConfig::default();
        let mut registry = ImageRegistry::open(
            &config,
            config.layout(temp.path()),
            Box::new(JsonContentScanner::new(temp.path(), &content)),
        )?;

        let update = registry.update_registry()?;
        assert_eq!(update.slots_added, 1);
        assert!(registry
            .manifest()
            .slots
            .contains_key("src/content/a-good.json:hero.backgroundImage"));
        assert_eq!(update.content_errors.len(), 1);
        assert_eq!(update.content_errors[0].document, "src/content/b-bad.json");
        assert!(update.content_errors[0].error.contains("invalid JSON"));
        Ok(())
    }

    #[test]
    fn stock_registration_relativizes_and_keeps_attribution() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut registry = open(temp.path(), Vec::new())?;
        let absolute = temp.path().join("business-images/stock/pexels-1.jpg");
        let mut record = slotfill_contracts::models::ImageRecord::new(
            absolute.to_string_lossy().to_string(),
            ImageSource::Stock,
        );
        record.content_hash = Some("h".to_string());
        let key = registry.register_stock(record);
        assert_eq!(key, "business-images/stock/pexels-1.jpg");
        assert_eq!(registry.manifest().images[&key].source, ImageSource::Stock);
        Ok(())
    }
}
