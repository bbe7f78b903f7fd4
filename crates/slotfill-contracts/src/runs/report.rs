use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::manifest::Manifest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotScore {
    pub slot_id: String,
    pub component: String,
    pub image: String,
    pub score: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityDistribution {
    pub excellent: u64,
    pub good: u64,
    pub fair: u64,
}

/// Diagnostics derived from a manifest. `unmatched_slots` lists required
/// slots only; optional gaps are not failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryReport {
    pub total_slots: u64,
    pub required_slots: u64,
    pub matched_slots: u64,
    pub unmatched_slots: Vec<String>,
    pub available_images: u64,
    pub unused_images: Vec<String>,
    pub slot_scores: Vec<SlotScore>,
    pub missing_files: Vec<String>,
    pub quality: QualityDistribution,
}

impl RegistryReport {
    /// `exists` decides whether a matched path is present on disk; it is a
    /// parameter so reports can be built against any storage root.
    pub fn from_manifest(manifest: &Manifest, exists: impl Fn(&str) -> bool) -> Self {
        let mut report = Self {
            total_slots: manifest.slots.len() as u64,
            required_slots: 0,
            matched_slots: 0,
            unmatched_slots: Vec::new(),
            available_images: manifest.images.len() as u64,
            unused_images: manifest.unused_images(),
            slot_scores: Vec::new(),
            missing_files: Vec::new(),
            quality: QualityDistribution::default(),
        };
        for slot in manifest.slots.values() {
            if slot.required {
                report.required_slots += 1;
            }
            let Some(image) = slot.matched_image.as_deref().filter(|_| slot.is_matched()) else {
                if slot.required {
                    report.unmatched_slots.push(slot.id.clone());
                }
                continue;
            };
            report.matched_slots += 1;
            if !exists(image) {
                report.missing_files.push(slot.id.clone());
            }
            match slot.relevance_score {
                Some(score) if score >= 90 => report.quality.excellent += 1,
                Some(score) if score >= 80 => report.quality.good += 1,
                Some(_) => report.quality.fair += 1,
                None => {}
            }
            report.slot_scores.push(SlotScore {
                slot_id: slot.id.clone(),
                component: slot.component.clone(),
                image: image.to_string(),
                score: slot.relevance_score,
            });
        }
        report
    }

    pub fn unmatched_count(&self) -> u64 {
        self.unmatched_slots.len() as u64
    }
}

/// Writes `manifest-report.json`: the summary plus per-slot listings.
pub fn write_detailed_report(
    path: &Path,
    manifest: &Manifest,
    report: &RegistryReport,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let slot_rows = |required: bool| -> Vec<Value> {
        manifest
            .slots
            .values()
            .filter(|slot| slot.required == required)
            .map(|slot| {
                json!({
                    "id": slot.id,
                    "component": slot.component,
                    "context": slot.context,
                    "currentPath": slot.current_path,
                    "matched": slot.is_matched(),
                    "matchedImage": slot.matched_image,
                    "relevanceScore": slot.relevance_score,
                })
            })
            .collect()
    };
    let images = manifest
        .images
        .values()
        .map(|image| {
            json!({
                "path": image.path,
                "filename": image.filename,
                "source": image.source,
                "analyzed": image.analyzed,
            })
        })
        .collect::<Vec<Value>>();

    let mut payload = Map::new();
    payload.insert(
        "generated".to_string(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    payload.insert("summary".to_string(), serde_json::to_value(report)?);
    payload.insert("requiredSlots".to_string(), Value::Array(slot_rows(true)));
    payload.insert("optionalSlots".to_string(), Value::Array(slot_rows(false)));
    payload.insert("availableImages".to_string(), Value::Array(images));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}
