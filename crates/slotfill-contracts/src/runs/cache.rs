use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::models::AnalysisResult;

/// Content-addressed store of prior analysis results (`analysis-cache.json`).
///
/// Every read refreshes from disk and every write merges only its own dirty
/// keys into the on-disk document, so two stores sharing a file never drop
/// each other's entries.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty_keys: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&mut self, key: &str) -> Option<Map<String, Value>> {
        self.ensure_loaded()
            .get(key)
            .and_then(Value::as_object)
            .cloned()
    }

    pub fn contains(&mut self, key: &str) -> bool {
        self.ensure_loaded().contains_key(key)
    }

    pub fn len(&mut self) -> usize {
        self.ensure_loaded().len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    pub fn set(&mut self, key: &str, value: Map<String, Value>) -> anyhow::Result<()> {
        let payload = self.ensure_loaded();
        let snapshot = Value::Object(value);
        if payload.get(key) == Some(&snapshot) {
            return Ok(());
        }
        payload.insert(key.to_string(), snapshot);
        if !self.dirty_keys.iter().any(|existing| existing == key) {
            self.dirty_keys.push(key.to_string());
        }
        self.flush()
    }

    /// Cached analysis for a content identity. Entries that no longer
    /// deserialize are treated as misses.
    pub fn get_analysis(&mut self, identity: &str) -> Option<AnalysisResult> {
        let entry = self.get(identity)?;
        let analysis = entry.get("analysis")?.clone();
        serde_json::from_value::<AnalysisResult>(analysis)
            .ok()
            .filter(AnalysisResult::is_well_formed)
    }

    pub fn put_analysis(
        &mut self,
        identity: &str,
        source_path: &str,
        analysis: &AnalysisResult,
    ) -> anyhow::Result<()> {
        let entry = json!({
            "path": source_path,
            "analysis": serde_json::to_value(analysis)?,
            "cachedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        self.set(identity, entry.as_object().cloned().unwrap_or_default())
    }

    /// Drops an entry so the next analysis of that image goes to providers.
    pub fn invalidate(&mut self, key: &str) -> anyhow::Result<bool> {
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        let removed = on_disk.remove(key).is_some();
        if removed {
            write_json_object(&self.path, &on_disk)?;
        }
        self.payload = Some(on_disk);
        self.dirty_keys.retain(|existing| existing != key);
        Ok(removed)
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.payload.is_none() || self.dirty_keys.is_empty() {
            return Ok(());
        }

        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if let Some(payload) = &self.payload {
            for key in &self.dirty_keys {
                if let Some(value) = payload.get(key) {
                    on_disk.insert(key.clone(), value.clone());
                }
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = Some(on_disk);
        self.dirty_keys.clear();
        Ok(())
    }

    fn ensure_loaded(&mut self) -> &mut Map<String, Value> {
        let mut fresh = read_json_object(&self.path).unwrap_or_default();
        if let Some(previous) = self.payload.take() {
            for key in &self.dirty_keys {
                if let Some(value) = previous.get(key) {
                    fresh.insert(key.clone(), value.clone());
                }
            }
        }
        self.payload.insert(fresh)
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use crate::models::{AnalysisResult, BusinessRelevance};

    use super::CacheStore;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn analysis(quality: u8) -> AnalysisResult {
        AnalysisResult {
            subjects: vec!["gutter".to_string()],
            scene: "residential exterior".to_string(),
            description: "worker clearing a gutter".to_string(),
            quality,
            confidence: 0.9,
            tags: vec!["cleaning".to_string()],
            business_relevance: BusinessRelevance {
                is_service_action: true,
                ..BusinessRelevance::default()
            },
            provider: Some("anthropic".to_string()),
        }
    }

    #[test]
    fn analysis_roundtrips_through_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("analysis-cache.json");
        let mut cache = CacheStore::new(&path);
        cache.put_analysis("hash-1", "pending/gutter.jpg", &analysis(81))?;

        let mut reloaded = CacheStore::new(path);
        assert_eq!(reloaded.get_analysis("hash-1"), Some(analysis(81)));
        assert_eq!(
            reloaded.get("hash-1").and_then(|row| row.get("path").cloned()),
            Some(json!("pending/gutter.jpg"))
        );
        assert!(reloaded.get_analysis("hash-2").is_none());
        Ok(())
    }

    #[test]
    fn malformed_entry_is_a_miss() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut cache = CacheStore::new(temp.path().join("cache.json"));
        cache.set("hash-1", obj(json!({"analysis": {"quality": "high"}})))?;
        assert!(cache.contains("hash-1"));
        assert!(cache.get_analysis("hash-1").is_none());
        Ok(())
    }

    #[test]
    fn set_merges_with_concurrent_writer() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut cache_a = CacheStore::new(&path);
        let mut cache_b = CacheStore::new(&path);

        cache_a.set("a", obj(json!({"value": 1})))?;
        cache_b.set("b", obj(json!({"value": 2})))?;
        cache_a.set("c", obj(json!({"value": 3})))?;

        let mut reloaded = CacheStore::new(path);
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.get("b"), Some(obj(json!({"value": 2}))));
        Ok(())
    }

    #[test]
    fn repeated_identical_writes_are_harmless() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut cache = CacheStore::new(&path);
        cache.put_analysis("hash-1", "a.jpg", &analysis(70))?;
        let mut other = CacheStore::new(&path);
        other.put_analysis("hash-1", "a.jpg", &analysis(70))?;
        assert_eq!(cache.get_analysis("hash-1"), Some(analysis(70)));
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[test]
    fn invalidate_removes_entry() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut cache = CacheStore::new(&path);
        cache.put_analysis("hash-1", "a.jpg", &analysis(70))?;
        assert!(cache.invalidate("hash-1")?);
        assert!(!cache.invalidate("hash-1")?);
        assert!(CacheStore::new(path).is_empty());
        Ok(())
    }
}
