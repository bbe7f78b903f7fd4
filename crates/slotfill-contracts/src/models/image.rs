use std::path::Path;

use serde::{Deserialize, Serialize};

use super::analysis::AnalysisResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    User,
    Stock,
}

/// License/credit details carried by a downloaded stock photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockAttribution {
    pub provider: String,
    pub photo_id: String,
    #[serde(default)]
    pub photographer: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub description: String,
}

/// A candidate photograph known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub path: String,
    pub filename: String,
    pub source: ImageSource,
    #[serde(default)]
    pub analyzed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<StockAttribution>,
}

impl ImageRecord {
    pub fn new(path: impl Into<String>, source: ImageSource) -> Self {
        let path = path.into();
        let filename = Path::new(&path)
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or(path.as_str())
            .to_string();
        Self {
            path,
            filename,
            source,
            analyzed: false,
            analysis: None,
            content_hash: None,
            derived_from: None,
            attribution: None,
        }
    }

    pub fn mark_analyzed(&mut self, analysis: AnalysisResult, content_hash: Option<String>) {
        self.analysis = Some(analysis);
        self.analyzed = true;
        if content_hash.is_some() {
            self.content_hash = content_hash;
        }
    }

    /// Restores `analyzed` => `analysis` present and well-formed.
    pub fn normalize(&mut self) {
        let valid = self
            .analysis
            .as_ref()
            .map(AnalysisResult::is_well_formed)
            .unwrap_or(false);
        if !valid {
            self.analyzed = false;
            self.analysis = None;
        } else {
            self.analyzed = true;
        }
    }

    /// Identity used for uniqueness: byte content when known, otherwise path.
    pub fn identity(&self) -> String {
        self.content_hash
            .clone()
            .unwrap_or_else(|| format!("path:{}", self.path))
    }

    /// Lowercased filename stem with separators flattened to spaces.
    pub fn filename_words(&self) -> String {
        Path::new(&self.filename)
            .file_stem()
            .and_then(|value| value.to_str())
            .unwrap_or("")
            .to_ascii_lowercase()
            .replace(['_', '-', '.'], " ")
    }
}
