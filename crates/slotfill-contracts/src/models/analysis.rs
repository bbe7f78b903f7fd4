use serde::{Deserialize, Serialize};

/// Domain classifiers used to bias matching toward business-appropriate imagery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusinessRelevance {
    pub is_team_photo: bool,
    pub is_service_action: bool,
    pub is_before_after: bool,
    pub is_building: bool,
}

impl BusinessRelevance {
    pub fn any(&self) -> bool {
        self.is_team_photo || self.is_service_action || self.is_before_after || self.is_building
    }

    pub fn labels(&self) -> Vec<&'static str> {
        let mut labels = Vec::new();
        if self.is_team_photo {
            labels.push("team photo");
        }
        if self.is_service_action {
            labels.push("service action");
        }
        if self.is_before_after {
            labels.push("before/after");
        }
        if self.is_building {
            labels.push("building");
        }
        labels
    }
}

/// Semantic description of one image.
///
/// `confidence` is stamped by the provider chain with the fixed value of the
/// provider that produced the result, so it doubles as a provenance marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub scene: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub quality: u8,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub business_relevance: BusinessRelevance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl AnalysisResult {
    /// Rejects results that could not have come from a sane provider response.
    pub fn is_well_formed(&self) -> bool {
        self.quality <= 100
            && (0.0..=1.0).contains(&self.confidence)
            && !(self.subjects.is_empty() && self.tags.is_empty() && self.scene.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AnalysisResult, BusinessRelevance};

    #[test]
    fn analysis_result_reads_camel_case_and_defaults_missing_fields() -> anyhow::Result<()> {
        let parsed: AnalysisResult = serde_json::from_value(json!({
            "subjects": ["roof", "worker"],
            "scene": "residential exterior",
            "quality": 82,
            "confidence": 0.9,
            "businessRelevance": {"isServiceAction": true}
        }))?;
        assert_eq!(parsed.subjects, vec!["roof", "worker"]);
        assert!(parsed.tags.is_empty());
        assert!(parsed.business_relevance.is_service_action);
        assert!(!parsed.business_relevance.is_team_photo);
        assert!(parsed.is_well_formed());
        Ok(())
    }

    #[test]
    fn empty_analysis_is_not_well_formed() {
        let empty = AnalysisResult {
            subjects: Vec::new(),
            scene: " ".to_string(),
            description: String::new(),
            quality: 50,
            confidence: 0.75,
            tags: Vec::new(),
            business_relevance: BusinessRelevance::default(),
            provider: None,
        };
        assert!(!empty.is_well_formed());
    }

    #[test]
    fn relevance_labels_follow_flag_order() {
        let flags = BusinessRelevance {
            is_team_photo: true,
            is_service_action: false,
            is_before_after: true,
            is_building: false,
        };
        assert!(flags.any());
        assert_eq!(flags.labels(), vec!["team photo", "before/after"]);
    }
}
