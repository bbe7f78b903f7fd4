use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use slotfill_contracts::config::{ProcessingConfig, StorageLayout};
use slotfill_contracts::models::{ImageSource, SlotDefinition};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "avif"];
const CONTEXT_KEYS: &[&str] = &["alt", "title", "heading", "caption", "description", "name", "subtitle"];
const KNOWN_COMPONENTS: &[&str] = &[
    "hero",
    "team",
    "gallery",
    "service",
    "card",
    "testimonial",
    "about",
    "feature",
    "cta",
];

/// A content document that could not be read or parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentError {
    pub document: String,
    pub error: String,
}

/// Slots found by one scan, plus the documents that were skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotScan {
    pub slots: Vec<SlotDefinition>,
    pub errors: Vec<ContentError>,
}

/// Produces slot definitions from wherever generated content lives.
///
/// A broken document is reported in [`SlotScan::errors`] and does not stop
/// the scan; `Err` is reserved for the content tree itself being unreadable.
pub trait SlotSource {
    fn scan_slots(&self) -> Result<SlotScan>;
}

/// Finds image references in JSON content documents.
///
/// A string is a slot when its key looks like an image field (`image`,
/// `backgroundImage`, `photo`, `avatar`, ...) or its value ends in an image
/// extension. Component comes from the nearest enclosing `component`/`type`
/// string, context from sibling `alt`/`title`/`heading`/... fields.
#[derive(Debug, Clone)]
pub struct JsonContentScanner {
    project_dir: PathBuf,
    content_dir: PathBuf,
}

impl JsonContentScanner {
    pub fn new(project_dir: impl Into<PathBuf>, content_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            content_dir: content_dir.into(),
        }
    }

    pub fn scan_document(&self, path: &Path) -> Result<Vec<SlotDefinition>> {
        let raw = fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
        let value: Value =
            serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))?;
        let document = relative_path(&self.project_dir, path);
        let mut slots = Vec::new();
        let mut walk = SlotWalk {
            document: &document,
            slots: &mut slots,
            scopes: Vec::new(),
        };
        walk.visit(&value, "", None);
        Ok(slots)
    }
}

impl SlotSource for JsonContentScanner {
    fn scan_slots(&self) -> Result<SlotScan> {
        if !self.content_dir.exists() {
            return Ok(SlotScan::default());
        }
        let mut files = Vec::new();
        collect_files(&self.content_dir, &mut files)?;
        let mut scan = SlotScan::default();
        for file in files {
            if extension_of(&file).as_deref() != Some("json") {
                continue;
            }
            match self.scan_document(&file) {
                Ok(slots) => scan.slots.extend(slots),
                Err(err) => scan.errors.push(ContentError {
                    document: relative_path(&self.project_dir, &file),
                    error: format!("{err:#}"),
                }),
            }
        }
        Ok(scan)
    }
}

/// Fixed slot list, for callers that discover slots themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticSlots(pub Vec<SlotDefinition>);

impl SlotSource for StaticSlots {
    fn scan_slots(&self) -> Result<SlotScan> {
        Ok(SlotScan {
            slots: self.0.clone(),
            errors: Vec::new(),
        })
    }
}

struct Scope<'v> {
    object: &'v Map<String, Value>,
}

struct SlotWalk<'a, 'v> {
    document: &'a str,
    slots: &'a mut Vec<SlotDefinition>,
    scopes: Vec<Scope<'v>>,
}

impl<'a, 'v> SlotWalk<'a, 'v> {
    fn visit(&mut self, value: &'v Value, field_path: &str, key: Option<&str>) {
        match value {
            Value::Object(object) => {
                self.scopes.push(Scope { object });
                for (child_key, child) in object {
                    let child_path = if field_path.is_empty() {
                        child_key.clone()
                    } else {
                        format!("{field_path}.{child_key}")
                    };
                    self.visit(child, &child_path, Some(child_key));
                }
                self.scopes.pop();
            }
            Value::Array(items) => {
                for (idx, item) in items.iter().enumerate() {
                    self.visit(item, &format!("{field_path}[{idx}]"), key);
                }
            }
            Value::String(text) => {
                let key = key.unwrap_or("");
                if is_image_key(key) || has_image_extension(text) {
                    self.push_slot(field_path, key, text);
                }
            }
            _ => {}
        }
    }

    fn push_slot(&mut self, field_path: &str, key: &str, current_path: &str) {
        let component = self.component_for(field_path, key);
        let context = self.context_for(key);
        let required = self
            .nearest_bool("required")
            .unwrap_or(matches!(component.as_str(), "hero" | "service"));
        self.slots.push(SlotDefinition {
            document: self.document.to_string(),
            field_path: field_path.to_string(),
            component,
            context,
            required,
            current_path: current_path.trim().to_string(),
        });
    }

    fn component_for(&self, field_path: &str, key: &str) -> String {
        for scope in self.scopes.iter().rev() {
            for name in ["component", "type"] {
                if let Some(text) = scope.object.get(name).and_then(Value::as_str) {
                    let normalized = normalize_component(text);
                    if !normalized.is_empty() {
                        return normalized;
                    }
                }
            }
        }
        let lowered = format!("{field_path}.{key}").to_ascii_lowercase();
        if let Some(known) = KNOWN_COMPONENTS.iter().find(|known| lowered.contains(*known)) {
            return (*known).to_string();
        }
        if lowered.contains("background") {
            return "hero".to_string();
        }
        if lowered.contains("avatar") || lowered.contains("staff") {
            return "team".to_string();
        }
        "content".to_string()
    }

    fn context_for(&self, key: &str) -> String {
        for scope in self.scopes.iter().rev() {
            let parts: Vec<&str> = CONTEXT_KEYS
                .iter()
                .filter_map(|name| scope.object.get(*name).and_then(Value::as_str))
                .map(str::trim)
                .filter(|text| !text.is_empty() && !has_image_extension(text))
                .collect();
            if !parts.is_empty() {
                return parts.join(" - ");
            }
        }
        split_camel(key)
    }

    fn nearest_bool(&self, name: &str) -> Option<bool> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.object.get(name).and_then(Value::as_bool))
    }
}

fn is_image_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    matches!(
        lowered.as_str(),
        "image" | "images" | "photo" | "photos" | "avatar" | "thumbnail" | "picture" | "gallery"
    ) || lowered.ends_with("image")
        || lowered.ends_with("photo")
        || lowered.ends_with("images")
}

fn has_image_extension(text: &str) -> bool {
    let path = text.split(['?', '#']).next().unwrap_or("");
    extension_of(Path::new(path))
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn normalize_component(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let lowered = lowered
        .trim_end_matches("section")
        .trim_end_matches(['-', '_'])
        .to_string();
    if let Some(known) = KNOWN_COMPONENTS.iter().find(|known| lowered.contains(*known)) {
        return (*known).to_string();
    }
    lowered
}

fn split_camel(key: &str) -> String {
    let mut out = String::new();
    for ch in key.chars() {
        if ch.is_ascii_uppercase() && !out.is_empty() {
            out.push(' ');
        }
        if ch == '_' || ch == '-' {
            out.push(' ');
        } else {
            out.push(ch.to_ascii_lowercase());
        }
    }
    out
}

/// Where a discovered image file lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageArea {
    Pending,
    Approved,
    Stock,
}

impl StorageArea {
    pub fn source(self) -> ImageSource {
        match self {
            Self::Pending | Self::Approved => ImageSource::User,
            Self::Stock => ImageSource::Stock,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredImage {
    pub path: PathBuf,
    pub area: StorageArea,
}

/// Lists supported image files in the pending, approved and stock areas.
pub fn scan_storage(layout: &StorageLayout, processing: &ProcessingConfig) -> Result<Vec<DiscoveredImage>> {
    let mut found = Vec::new();
    for (dir, area) in [
        (&layout.pending, StorageArea::Pending),
        (&layout.approved, StorageArea::Approved),
        (&layout.stock, StorageArea::Stock),
    ] {
        if !dir.is_dir() {
            continue;
        }
        let mut files = Vec::new();
        collect_files(dir, &mut files)?;
        for path in files {
            if processing.is_supported(&path) {
                found.push(DiscoveredImage { path, area });
            }
        }
    }
    Ok(found)
}

/// Depth-first file listing with entries sorted by name at each level.
fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("failed listing {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect::<Vec<PathBuf>>();
    entries.sort();
    for path in entries {
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with('.'))
            .unwrap_or(false);
        if hidden {
            continue;
        }
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
}

/// `path` relative to `base` with forward slashes; paths outside `base` are
/// returned as given.
pub fn relative_path(base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            Component::RootDir => Some(String::new()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect();
    parts.join("/")
}
