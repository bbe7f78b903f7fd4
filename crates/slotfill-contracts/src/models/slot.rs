use serde::{Deserialize, Serialize};

/// Who placed the current match on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchOrigin {
    Engine,
    Stock,
    Manual,
}

/// A slot as produced by a content scanner, before it meets the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDefinition {
    pub document: String,
    pub field_path: String,
    pub component: String,
    pub context: String,
    pub required: bool,
    pub current_path: String,
}

impl SlotDefinition {
    /// Stable identity derived from where the slot lives in content.
    pub fn slot_id(&self) -> String {
        format!("{}:{}", self.document, self.field_path)
    }
}

/// A placeholder in generated content that must reference one concrete image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub id: String,
    pub component: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub current_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_by: Option<MatchOrigin>,
}

impl Slot {
    pub fn from_definition(definition: &SlotDefinition) -> Self {
        Self {
            id: definition.slot_id(),
            component: definition.component.clone(),
            context: definition.context.clone(),
            required: definition.required,
            current_path: definition.current_path.clone(),
            matched_image: None,
            relevance_score: None,
            matched_by: None,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.matched_image
            .as_deref()
            .map(|path| !path.trim().is_empty())
            .unwrap_or(false)
    }

    /// Refreshes the descriptive fields while keeping any existing match.
    /// Returns true when something changed.
    pub fn apply_definition(&mut self, definition: &SlotDefinition) -> bool {
        let changed = self.component != definition.component
            || self.context != definition.context
            || self.required != definition.required
            || self.current_path != definition.current_path;
        self.component = definition.component.clone();
        self.context = definition.context.clone();
        self.required = definition.required;
        self.current_path = definition.current_path.clone();
        changed
    }

    pub fn assign(&mut self, image_path: &str, score: u32, origin: MatchOrigin) {
        self.matched_image = Some(image_path.to_string());
        self.relevance_score = Some(score.min(100));
        self.matched_by = Some(origin);
    }

    pub fn clear_match(&mut self) {
        self.matched_image = None;
        self.relevance_score = None;
        self.matched_by = None;
    }

    /// Collapses half-set match state (e.g. hand-edited manifests) to unmatched.
    pub fn normalize(&mut self) {
        if !self.is_matched() {
            self.clear_match();
        } else if self.relevance_score.is_none() && self.matched_by.is_none() {
            self.matched_by = Some(MatchOrigin::Manual);
        }
    }

    /// Words describing what the slot wants, used to build stock queries.
    pub fn search_query(&self) -> String {
        format!("{} {}", self.component, self.context)
            .replace(['_', '-'], " ")
            .split_whitespace()
            .collect::<Vec<&str>>()
            .join(" ")
    }
}
