use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};
use slotfill_contracts::config::{non_empty_env, Credentials, StockConfig};
use slotfill_contracts::events::{payload, EventWriter};
use slotfill_contracts::models::{ImageRecord, ImageSource, StockAttribution};
use slotfill_contracts::providers::{NamedProvider, ProviderChain};

use crate::analysis::content_hash;
use crate::http::{http_client, response_json_or_error, truncate_text, ProviderError};

/// One candidate photo, normalized across vendors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockPhoto {
    pub id: String,
    pub photographer: String,
    pub source_url: String,
    pub download_url: String,
    pub description: String,
    pub alt_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockSearchResult {
    pub provider: String,
    pub total_results: u64,
    pub photos: Vec<StockPhoto>,
}

pub trait StockProvider: NamedProvider + Send + Sync {
    fn is_configured(&self) -> bool;
    fn search(&self, query: &str, count: u32) -> Result<StockSearchResult, ProviderError>;
    fn download(&self, photo: &StockPhoto) -> Result<Vec<u8>, ProviderError>;
}

pub struct UnsplashStock {
    api_base: String,
    access_key: Option<String>,
    http: HttpClient,
}

impl UnsplashStock {
    pub fn new(access_key: Option<String>, timeout: Duration) -> Self {
        Self {
            api_base: api_base_from_env("UNSPLASH_API_BASE", "https://api.unsplash.com"),
            access_key,
            http: http_client(timeout),
        }
    }

    pub fn parse_search(body: &Value) -> Result<StockSearchResult, ProviderError> {
        let rows = body
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::malformed("unsplash", "missing results array"))?;
        let photos = rows
            .iter()
            .filter_map(|row| {
                let download_url = str_at(row, &["urls", "regular"])
                    .or_else(|| str_at(row, &["urls", "full"]))?;
                let description = str_at(row, &["description"]).unwrap_or_default();
                let alt_text = str_at(row, &["alt_description"]).unwrap_or_default();
                Some(StockPhoto {
                    id: id_at(row, "id")?,
                    photographer: str_at(row, &["user", "name"]).unwrap_or_default(),
                    source_url: str_at(row, &["links", "html"]).unwrap_or_default(),
                    download_url,
                    description: if description.is_empty() { alt_text.clone() } else { description },
                    alt_text,
                })
            })
            .collect::<Vec<StockPhoto>>();
        Ok(StockSearchResult {
            provider: "unsplash".to_string(),
            total_results: body.get("total").and_then(Value::as_u64).unwrap_or(photos.len() as u64),
            photos,
        })
    }
}

impl NamedProvider for UnsplashStock {
    fn name(&self) -> &str {
        "unsplash"
    }
}

impl StockProvider for UnsplashStock {
    fn is_configured(&self) -> bool {
        self.access_key.is_some()
    }

    fn search(&self, query: &str, count: u32) -> Result<StockSearchResult, ProviderError> {
        let provider = self.name();
        let Some(key) = self.access_key.as_deref() else {
            return Err(ProviderError::missing_credentials(provider));
        };
        let per_page = count.clamp(1, 30).to_string();
        let response = self
            .http
            .get(format!("{}/search/photos", self.api_base))
            .header(AUTHORIZATION, format!("Client-ID {key}"))
            .query(&[("query", query), ("per_page", per_page.as_str()), ("orientation", "landscape")])
            .send()
            .map_err(|err| ProviderError::transport(provider, &err))?;
        Self::parse_search(&response_json_or_error(provider, response)?)
    }

    fn download(&self, photo: &StockPhoto) -> Result<Vec<u8>, ProviderError> {
        download_bytes(&self.http, self.name(), &photo.download_url)
    }
}

pub struct PexelsStock {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl PexelsStock {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            api_base: api_base_from_env("PEXELS_API_BASE", "https://api.pexels.com/v1"),
            api_key,
            http: http_client(timeout),
        }
    }

    pub fn parse_search(body: &Value) -> Result<StockSearchResult, ProviderError> {
        let rows = body
            .get("photos")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::malformed("pexels", "missing photos array"))?;
        let photos = rows
            .iter()
            .filter_map(|row| {
                let download_url = str_at(row, &["src", "large"])
                    .or_else(|| str_at(row, &["src", "original"]))?;
                let alt_text = str_at(row, &["alt"]).unwrap_or_default();
                Some(StockPhoto {
                    id: id_at(row, "id")?,
                    photographer: str_at(row, &["photographer"]).unwrap_or_default(),
                    source_url: str_at(row, &["url"]).unwrap_or_default(),
                    download_url,
                    description: alt_text.clone(),
                    alt_text,
                })
            })
            .collect::<Vec<StockPhoto>>();
        Ok(StockSearchResult {
            provider: "pexels".to_string(),
            total_results: body
                .get("total_results")
                .and_then(Value::as_u64)
                .unwrap_or(photos.len() as u64),
            photos,
        })
    }
}

impl NamedProvider for PexelsStock {
    fn name(&self) -> &str {
        "pexels"
    }
}

impl StockProvider for PexelsStock {
    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn search(&self, query: &str, count: u32) -> Result<StockSearchResult, ProviderError> {
        let provider = self.name();
        let Some(key) = self.api_key.as_deref() else {
            return Err(ProviderError::missing_credentials(provider));
        };
        let per_page = count.clamp(1, 80).to_string();
        let response = self
            .http
            .get(format!("{}/search", self.api_base))
            .header(AUTHORIZATION, key)
            .query(&[("query", query), ("per_page", per_page.as_str()), ("orientation", "landscape")])
            .send()
            .map_err(|err| ProviderError::transport(provider, &err))?;
        Self::parse_search(&response_json_or_error(provider, response)?)
    }

    fn download(&self, photo: &StockPhoto) -> Result<Vec<u8>, ProviderError> {
        download_bytes(&self.http, self.name(), &photo.download_url)
    }
}

pub struct PixabayStock {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl PixabayStock {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            api_base: api_base_from_env("PIXABAY_API_BASE", "https://pixabay.com/api"),
            api_key,
            http: http_client(timeout),
        }
    }

    pub fn parse_search(body: &Value) -> Result<StockSearchResult, ProviderError> {
        let rows = body
            .get("hits")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::malformed("pixabay", "missing hits array"))?;
        let photos = rows
            .iter()
            .filter_map(|row| {
                let download_url = str_at(row, &["largeImageURL"])
                    .or_else(|| str_at(row, &["webformatURL"]))?;
                let tags = str_at(row, &["tags"]).unwrap_or_default();
                Some(StockPhoto {
                    id: id_at(row, "id")?,
                    photographer: str_at(row, &["user"]).unwrap_or_default(),
                    source_url: str_at(row, &["pageURL"]).unwrap_or_default(),
                    download_url,
                    description: tags.clone(),
                    alt_text: tags,
                })
            })
            .collect::<Vec<StockPhoto>>();
        Ok(StockSearchResult {
            provider: "pixabay".to_string(),
            total_results: body
                .get("totalHits")
                .or_else(|| body.get("total"))
                .and_then(Value::as_u64)
                .unwrap_or(photos.len() as u64),
            photos,
        })
    }
}

impl NamedProvider for PixabayStock {
    fn name(&self) -> &str {
        "pixabay"
    }
}

impl StockProvider for PixabayStock {
    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn search(&self, query: &str, count: u32) -> Result<StockSearchResult, ProviderError> {
        let provider = self.name();
        let Some(key) = self.api_key.as_deref() else {
            return Err(ProviderError::missing_credentials(provider));
        };
        // Pixabay rejects per_page below 3.
        let per_page = count.clamp(3, 200).to_string();
        let response = self
            .http
            .get(format!("{}/", self.api_base))
            .query(&[
                ("key", key),
                ("q", query),
                ("per_page", per_page.as_str()),
                ("image_type", "photo"),
                ("safesearch", "true"),
            ])
            .send()
            .map_err(|err| ProviderError::transport(provider, &err))?;
        Self::parse_search(&response_json_or_error(provider, response)?)
    }

    fn download(&self, photo: &StockPhoto) -> Result<Vec<u8>, ProviderError> {
        download_bytes(&self.http, self.name(), &photo.download_url)
    }
}

fn download_bytes(http: &HttpClient, provider: &str, url: &str) -> Result<Vec<u8>, ProviderError> {
    let response = http
        .get(url)
        .send()
        .map_err(|err| ProviderError::transport(provider, &err))?;
    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let body = response.text().unwrap_or_default();
        return Err(ProviderError::from_status(provider, status, &body));
    }
    let bytes = response
        .bytes()
        .map_err(|err| ProviderError::transport(provider, &err))?;
    if bytes.is_empty() {
        return Err(ProviderError::malformed(provider, "downloaded image is empty"));
    }
    Ok(bytes.to_vec())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptStatus {
    Found,
    Empty,
    Skipped,
    Failed { kind: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockAttempt {
    pub provider: String,
    pub status: AttemptStatus,
}

impl StockAttempt {
    pub fn is_rate_limited(&self) -> bool {
        matches!(&self.status, AttemptStatus::Failed { kind, .. } if *kind == "rate_limited")
    }
}

/// Stock vendors tried strictly in configured order.
pub struct StockChain {
    providers: ProviderChain<Box<dyn StockProvider>>,
    unknown: Vec<String>,
}

impl StockChain {
    pub fn new(providers: Vec<Box<dyn StockProvider>>) -> Self {
        Self {
            providers: ProviderChain::new(providers),
            unknown: Vec::new(),
        }
    }

    pub fn from_config(config: &StockConfig, credentials: &Credentials) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let available: Vec<Box<dyn StockProvider>> = vec![
            Box::new(UnsplashStock::new(credentials.unsplash.clone(), timeout)),
            Box::new(PexelsStock::new(credentials.pexels.clone(), timeout)),
            Box::new(PixabayStock::new(credentials.pixabay.clone(), timeout)),
        ];
        let build = ProviderChain::ordered(available, &config.chain);
        Self {
            providers: build.chain,
            unknown: build.unknown,
        }
    }

    pub fn unknown_providers(&self) -> &[String] {
        &self.unknown
    }

    pub fn providers(&self) -> &[Box<dyn StockProvider>] {
        self.providers.providers()
    }

    pub fn status(&self) -> Vec<(String, bool)> {
        self.providers
            .providers()
            .iter()
            .map(|provider| (provider.name().to_string(), provider.is_configured()))
            .collect()
    }

    pub fn has_configured(&self) -> bool {
        self.providers
            .providers()
            .iter()
            .any(|provider| provider.is_configured())
    }

    /// First non-empty result wins. A failing vendor counts as a miss.
    pub fn search(&self, query: &str, count: u32) -> (Option<StockSearchResult>, Vec<StockAttempt>) {
        let mut attempts = Vec::new();
        for provider in self.providers.providers() {
            let name = provider.name().to_string();
            if !provider.is_configured() {
                attempts.push(StockAttempt {
                    provider: name,
                    status: AttemptStatus::Skipped,
                });
                continue;
            }
            match provider.search(query, count) {
                Ok(result) if !result.photos.is_empty() => {
                    attempts.push(StockAttempt {
                        provider: name,
                        status: AttemptStatus::Found,
                    });
                    return (Some(result), attempts);
                }
                Ok(_) => attempts.push(StockAttempt {
                    provider: name,
                    status: AttemptStatus::Empty,
                }),
                Err(err) => attempts.push(failed_attempt(&name, &err)),
            }
        }
        (None, attempts)
    }
}

fn failed_attempt(provider: &str, err: &ProviderError) -> StockAttempt {
    StockAttempt {
        provider: provider.to_string(),
        status: AttemptStatus::Failed {
            kind: err.kind(),
            message: truncate_text(&err.to_string(), 512),
        },
    }
}

/// Outcome of one `fetch_best_match` call. `image` is `None` when every
/// vendor missed; that is a normal answer, not an error.
#[derive(Debug, Clone)]
pub struct StockFetch {
    pub query: String,
    pub image: Option<ImageRecord>,
    pub local_path: Option<PathBuf>,
    pub search: Option<StockSearchResult>,
    pub attempts: Vec<StockAttempt>,
}

impl StockFetch {
    pub fn rate_limited(&self) -> bool {
        self.attempts.iter().any(StockAttempt::is_rate_limited)
    }
}

/// Turns a text query into a downloaded, attributed stock photo.
///
/// A rate-limit signal from any vendor arms a cool-down that pauses the next
/// fetch before it issues requests.
pub struct StockPhotoService {
    chain: StockChain,
    per_page: u32,
    default_query: String,
    cooldown: Duration,
    cooldown_pending: AtomicBool,
    cooldowns_applied: AtomicUsize,
    events: EventWriter,
}

impl StockPhotoService {
    pub fn new(chain: StockChain) -> Self {
        Self {
            chain,
            per_page: 5,
            default_query: "business".to_string(),
            cooldown: Duration::from_secs(60),
            cooldown_pending: AtomicBool::new(false),
            cooldowns_applied: AtomicUsize::new(0),
            events: EventWriter::disabled(),
        }
    }

    pub fn from_config(config: &StockConfig, credentials: &Credentials) -> Self {
        let mut service = Self::new(StockChain::from_config(config, credentials));
        service.per_page = config.per_page.max(1);
        service.default_query = config.default_query.clone();
        service.cooldown = Duration::from_secs(config.rate_limit_cooldown_secs);
        service
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    pub fn chain(&self) -> &StockChain {
        &self.chain
    }

    pub fn is_available(&self) -> bool {
        self.chain.has_configured()
    }

    pub fn cooldowns_applied(&self) -> usize {
        self.cooldowns_applied.load(Ordering::SeqCst)
    }

    /// Normalized search across the chain, without downloading.
    pub fn search(&self, query: &str, count: u32) -> (Option<StockSearchResult>, Vec<StockAttempt>) {
        self.apply_pending_cooldown();
        let query = self.effective_query(query);
        let (result, attempts) = self.chain.search(&query, count);
        self.note_attempts(&query, &attempts);
        (result, attempts)
    }

    /// Searches, downloads the first usable photo of the winning vendor into
    /// `dest_dir` as `<provider>-<id>.<ext>` and writes an attribution
    /// sidecar next to it. Only local I/O failures are errors.
    pub fn fetch_best_match(&self, query: &str, dest_dir: &Path) -> Result<StockFetch> {
        self.fetch_best_match_excluding(query, dest_dir, &BTreeSet::new())
    }

    /// Like [`StockPhotoService::fetch_best_match`], skipping photos whose
    /// `<provider>:<id>` is in `exclude` (already serving another slot).
    pub fn fetch_best_match_excluding(
        &self,
        query: &str,
        dest_dir: &Path,
        exclude: &BTreeSet<String>,
    ) -> Result<StockFetch> {
        self.apply_pending_cooldown();
        let query = self.effective_query(query);
        let mut attempts = Vec::new();

        for provider in self.chain.providers() {
            let name = provider.name().to_string();
            if !provider.is_configured() {
                attempts.push(StockAttempt {
                    provider: name,
                    status: AttemptStatus::Skipped,
                });
                continue;
            }
            let result = match provider.search(&query, self.per_page) {
                Ok(result) if !result.photos.is_empty() => result,
                Ok(_) => {
                    attempts.push(StockAttempt {
                        provider: name,
                        status: AttemptStatus::Empty,
                    });
                    continue;
                }
                Err(err) => {
                    attempts.push(failed_attempt(&name, &err));
                    continue;
                }
            };

            let mut download_error = None;
            let mut usable = 0;
            for photo in &result.photos {
                if exclude.contains(&photo_key(&name, &photo.id)) {
                    continue;
                }
                usable += 1;
                match provider.download(photo) {
                    Ok(bytes) => {
                        let (record, local_path) = self.store_photo(&name, photo, &bytes, &query, dest_dir)?;
                        attempts.push(StockAttempt {
                            provider: name.clone(),
                            status: AttemptStatus::Found,
                        });
                        self.note_attempts(&query, &attempts);
                        self.events.record(
                            "stock_fetched",
                            payload(json!({
                                "query": query,
                                "provider": name,
                                "photo_id": photo.id,
                                "path": local_path.to_string_lossy(),
                            })),
                        );
                        return Ok(StockFetch {
                            query,
                            image: Some(record),
                            local_path: Some(local_path),
                            search: Some(result.clone()),
                            attempts,
                        });
                    }
                    Err(err) => {
                        let rate_limited = err.is_rate_limited();
                        download_error = Some(err);
                        if rate_limited {
                            break;
                        }
                    }
                }
            }
            if let Some(err) = download_error {
                attempts.push(failed_attempt(&name, &err));
            } else if usable == 0 {
                attempts.push(StockAttempt {
                    provider: name,
                    status: AttemptStatus::Empty,
                });
            }
        }

        self.note_attempts(&query, &attempts);
        self.events.record(
            "stock_miss",
            payload(json!({
                "query": query,
                "attempts": attempts.len(),
            })),
        );
        Ok(StockFetch {
            query,
            image: None,
            local_path: None,
            search: None,
            attempts,
        })
    }

    fn store_photo(
        &self,
        provider: &str,
        photo: &StockPhoto,
        bytes: &[u8],
        query: &str,
        dest_dir: &Path,
    ) -> Result<(ImageRecord, PathBuf)> {
        fs::create_dir_all(dest_dir).with_context(|| format!("failed creating {}", dest_dir.display()))?;
        let filename = stock_filename(provider, &photo.id, &photo.download_url);
        let local_path = dest_dir.join(&filename);
        fs::write(&local_path, bytes).with_context(|| format!("failed writing {}", local_path.display()))?;

        let attribution = StockAttribution {
            provider: provider.to_string(),
            photo_id: photo.id.clone(),
            photographer: photo.photographer.clone(),
            source_url: photo.source_url.clone(),
            description: photo.description.clone(),
        };
        let mut sidecar = serde_json::to_value(&attribution)?;
        if let Some(obj) = sidecar.as_object_mut() {
            obj.insert("altText".to_string(), Value::String(photo.alt_text.clone()));
            obj.insert("query".to_string(), Value::String(query.to_string()));
            obj.insert(
                "downloadedAt".to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        let sidecar_path = dest_dir.join(format!("{filename}.json"));
        fs::write(&sidecar_path, serde_json::to_string_pretty(&sidecar)?)
            .with_context(|| format!("failed writing {}", sidecar_path.display()))?;

        let mut record = ImageRecord::new(local_path.to_string_lossy().to_string(), ImageSource::Stock);
        record.content_hash = Some(content_hash(bytes));
        record.attribution = Some(attribution);
        Ok((record, local_path))
    }

    fn effective_query(&self, query: &str) -> String {
        let trimmed = query.split_whitespace().collect::<Vec<&str>>().join(" ");
        if trimmed.is_empty() {
            self.default_query.clone()
        } else {
            trimmed
        }
    }

    fn apply_pending_cooldown(&self) {
        if !self.cooldown_pending.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cooldowns_applied.fetch_add(1, Ordering::SeqCst);
        self.events.record(
            "rate_limited",
            payload(json!({
                "stage": "stock",
                "cooldown_secs": self.cooldown.as_secs_f64(),
            })),
        );
        if !self.cooldown.is_zero() {
            thread::sleep(self.cooldown);
        }
    }

    fn note_attempts(&self, query: &str, attempts: &[StockAttempt]) {
        for attempt in attempts {
            match &attempt.status {
                AttemptStatus::Skipped => self.events.record(
                    "provider_skipped",
                    payload(json!({
                        "stage": "stock",
                        "provider": attempt.provider,
                        "reason": "missing_credentials",
                    })),
                ),
                AttemptStatus::Failed { kind, message } => self.events.record(
                    "provider_failed",
                    payload(json!({
                        "stage": "stock",
                        "provider": attempt.provider,
                        "query": query,
                        "kind": kind,
                        "error": message,
                    })),
                ),
                AttemptStatus::Found | AttemptStatus::Empty => {}
            }
        }
        if attempts.iter().any(StockAttempt::is_rate_limited) {
            self.cooldown_pending.store(true, Ordering::SeqCst);
        }
    }
}

/// Key identifying one vendor photo across fetches.
pub fn photo_key(provider: &str, id: &str) -> String {
    format!("{provider}:{id}")
}

/// `<provider>-<id>.<ext>`, with the extension taken from the download URL
/// when it names a known image format.
pub fn stock_filename(provider: &str, id: &str, download_url: &str) -> String {
    let safe_id: String = id
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    let url_path = download_url.split(['?', '#']).next().unwrap_or("");
    let ext = Path::new(url_path)
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .filter(|value| matches!(value.as_str(), "jpg" | "jpeg" | "png" | "webp"))
        .unwrap_or_else(|| "jpg".to_string());
    format!("{provider}-{safe_id}.{ext}")
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    current
        .as_str()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn id_at(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn api_base_from_env(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}
