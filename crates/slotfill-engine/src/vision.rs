use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};
use slotfill_contracts::config::{non_empty_env, Credentials, VisionConfig};
use slotfill_contracts::events::{payload, EventWriter};
use slotfill_contracts::models::{AnalysisResult, BusinessRelevance};
use slotfill_contracts::providers::{normalize_provider_name, NamedProvider, ProviderChain};

use crate::http::{http_client, response_json_or_error, truncate_text, ProviderError};

pub const OPENAI_CONFIDENCE: f64 = 0.95;
pub const ANTHROPIC_CONFIDENCE: f64 = 0.90;
pub const OFFLINE_CONFIDENCE: f64 = 0.75;

const ANALYSIS_MAX_TOKENS: u64 = 500;

const ANALYSIS_PROMPT: &str = "Analyze this photograph for a local service business website. \
Respond with a single JSON object and nothing else, using exactly these keys: \
\"subjects\" (array of the main things visible, most prominent first), \
\"scene\" (one short scene label such as \"residential exterior\" or \"office interior\"), \
\"description\" (one sentence), \
\"quality\" (integer 0-100 rating sharpness, exposure and composition), \
\"tags\" (array of lowercase keywords), \
\"businessRelevance\" (object with booleans isTeamPhoto, isServiceAction, isBeforeAfter, isBuilding).";

/// Image bytes plus what providers need to describe them.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub dimensions: Option<(u32, u32)>,
}

impl ImagePayload {
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        Ok(Self::from_bytes(payload_filename(path), bytes))
    }

    /// Dimensions come from the image header only; pixel data is never
    /// decoded here.
    pub fn from_bytes(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        let filename = filename.into();
        let mime_type = mime_for_filename(&filename).to_string();
        let dimensions = image::ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .ok()
            .and_then(|reader| reader.into_dimensions().ok());
        Self {
            filename,
            bytes,
            mime_type,
            dimensions,
        }
    }

    pub fn base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64())
    }
}

pub(crate) fn payload_filename(path: &Path) -> String {
    path.file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("image")
        .to_string()
}

/// A hosted analyzer that may fail; the chain decides what happens next.
pub trait VisionProvider: NamedProvider + Send + Sync {
    /// Fixed confidence stamped on every result this provider produces.
    fn confidence(&self) -> f64;
    fn is_configured(&self) -> bool;
    fn analyze(&self, image: &ImagePayload) -> Result<AnalysisResult, ProviderError>;
}

pub struct OpenAiVision {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: HttpClient,
}

impl OpenAiVision {
    pub const DEFAULT_MODEL: &'static str = "gpt-4o";

    pub fn new(api_key: Option<String>, model: Option<String>, timeout: Duration) -> Self {
        Self {
            api_base: api_base_from_env("OPENAI_API_BASE", "https://api.openai.com/v1"),
            api_key,
            model: model.unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
            http: http_client(timeout),
        }
    }

    pub fn request_body(&self, image: &ImagePayload) -> Value {
        json!({
            "model": self.model,
            "max_tokens": ANALYSIS_MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": ANALYSIS_PROMPT },
                    {
                        "type": "image_url",
                        "image_url": { "url": image.data_url(), "detail": "low" },
                    },
                ],
            }],
        })
    }

    pub fn response_text(response: &Value) -> Option<String> {
        response
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

impl NamedProvider for OpenAiVision {
    fn name(&self) -> &str {
        "openai"
    }
}

impl VisionProvider for OpenAiVision {
    fn confidence(&self) -> f64 {
        OPENAI_CONFIDENCE
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn analyze(&self, image: &ImagePayload) -> Result<AnalysisResult, ProviderError> {
        let provider = self.name();
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ProviderError::missing_credentials(provider));
        };
        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .header(AUTHORIZATION, format!("Bearer {api_key}"))
            .json(&self.request_body(image))
            .send()
            .map_err(|err| ProviderError::transport(provider, &err))?;
        let body = response_json_or_error(provider, response)?;
        let text = Self::response_text(&body)
            .ok_or_else(|| ProviderError::malformed(provider, "response has no message content"))?;
        parse_analysis_text(provider, &text)
    }
}

pub struct AnthropicVision {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: HttpClient,
}

impl AnthropicVision {
    pub const DEFAULT_MODEL: &'static str = "claude-sonnet-4-20250514";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(api_key: Option<String>, model: Option<String>, timeout: Duration) -> Self {
        Self {
            api_base: api_base_from_env("ANTHROPIC_API_BASE", "https://api.anthropic.com/v1"),
            api_key,
            model: model.unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
            http: http_client(timeout),
        }
    }

    pub fn request_body(&self, image: &ImagePayload) -> Value {
        json!({
            "model": self.model,
            "max_tokens": ANALYSIS_MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": image.mime_type,
                            "data": image.base64(),
                        },
                    },
                    { "type": "text", "text": ANALYSIS_PROMPT },
                ],
            }],
        })
    }

    pub fn response_text(response: &Value) -> Option<String> {
        let blocks = response.get("content").and_then(Value::as_array)?;
        let text = blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<&str>>()
            .join("\n");
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

impl NamedProvider for AnthropicVision {
    fn name(&self) -> &str {
        "anthropic"
    }
}

impl VisionProvider for AnthropicVision {
    fn confidence(&self) -> f64 {
        ANTHROPIC_CONFIDENCE
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn analyze(&self, image: &ImagePayload) -> Result<AnalysisResult, ProviderError> {
        let provider = self.name();
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ProviderError::missing_credentials(provider));
        };
        let response = self
            .http
            .post(format!("{}/messages", self.api_base))
            .header("x-api-key", api_key)
            .header("anthropic-version", Self::API_VERSION)
            .json(&self.request_body(image))
            .send()
            .map_err(|err| ProviderError::transport(provider, &err))?;
        let body = response_json_or_error(provider, response)?;
        let text = Self::response_text(&body)
            .ok_or_else(|| ProviderError::malformed(provider, "response has no text content"))?;
        parse_analysis_text(provider, &text)
    }
}

/// Deterministic filename/dimension heuristic. Never fails, so it always
/// terminates the vision chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineAnalyzer;

const SUBJECT_KEYWORDS: &[(&str, &str)] = &[
    ("roof", "roof"),
    ("roofing", "roof"),
    ("gutter", "gutter"),
    ("gutters", "gutter"),
    ("house", "house"),
    ("home", "house"),
    ("building", "building"),
    ("office", "office"),
    ("shopfront", "building"),
    ("team", "team"),
    ("staff", "team"),
    ("crew", "team"),
    ("worker", "worker"),
    ("technician", "worker"),
    ("truck", "vehicle"),
    ("van", "vehicle"),
    ("driveway", "driveway"),
    ("window", "window"),
    ("windows", "window"),
    ("deck", "deck"),
    ("fence", "fence"),
    ("garden", "garden"),
    ("lawn", "lawn"),
    ("pool", "pool"),
    ("kitchen", "kitchen"),
    ("bathroom", "bathroom"),
    ("carpet", "carpet"),
    ("clean", "cleaning"),
    ("cleaning", "cleaning"),
    ("wash", "washing"),
    ("washing", "washing"),
    ("pressure", "pressure washing"),
    ("paint", "painting"),
    ("painting", "painting"),
    ("repair", "repair"),
];

const TEAM_WORDS: &[&str] = &["team", "staff", "crew", "employees", "owner", "portrait"];
const BEFORE_AFTER_WORDS: &[&str] = &["before", "after", "beforeafter", "transformation"];
const SERVICE_WORDS: &[&str] = &[
    "cleaning", "clean", "washing", "wash", "pressure", "service", "repair", "painting", "install",
    "installation", "working",
];
const BUILDING_WORDS: &[&str] = &[
    "house", "home", "building", "roof", "roofing", "office", "exterior", "shopfront", "property",
];
const INTERIOR_WORDS: &[&str] = &["kitchen", "bathroom", "office", "interior", "carpet", "living"];

impl OfflineAnalyzer {
    pub fn analyze(&self, image: &ImagePayload) -> AnalysisResult {
        let tokens = filename_tokens(&image.filename);
        let has = |words: &[&str]| tokens.iter().any(|token| words.contains(&token.as_str()));

        let mut subjects: Vec<String> = Vec::new();
        for token in &tokens {
            if let Some((_, subject)) = SUBJECT_KEYWORDS.iter().find(|(word, _)| word == token) {
                if !subjects.iter().any(|existing| existing == subject) {
                    subjects.push((*subject).to_string());
                }
            }
        }
        if subjects.is_empty() {
            subjects.push("photo".to_string());
        }

        let business_relevance = BusinessRelevance {
            is_team_photo: has(TEAM_WORDS),
            is_service_action: has(SERVICE_WORDS),
            is_before_after: has(BEFORE_AFTER_WORDS),
            is_building: has(BUILDING_WORDS),
        };
        let scene = if has(INTERIOR_WORDS) {
            "interior"
        } else if business_relevance.is_building || has(&["outdoor", "garden", "lawn", "driveway"]) {
            "exterior"
        } else {
            "general"
        };

        AnalysisResult {
            description: format!("{} ({})", subjects.join(", "), scene),
            subjects,
            scene: scene.to_string(),
            quality: quality_from_dimensions(image.dimensions),
            confidence: OFFLINE_CONFIDENCE,
            tags: tokens,
            business_relevance,
            provider: Some("offline".to_string()),
        }
    }
}

impl NamedProvider for OfflineAnalyzer {
    fn name(&self) -> &str {
        "offline"
    }
}

fn quality_from_dimensions(dimensions: Option<(u32, u32)>) -> u8 {
    match dimensions {
        Some((width, _)) if width >= 1920 => 85,
        Some((width, _)) if width >= 1200 => 78,
        Some((width, _)) if width < 600 => 55,
        Some(_) => 70,
        None => 65,
    }
}

fn filename_tokens(filename: &str) -> Vec<String> {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or(filename)
        .to_ascii_lowercase();
    let mut tokens: Vec<String> = Vec::new();
    for token in stem.split(|ch: char| !ch.is_ascii_alphanumeric()) {
        if token.len() < 3 || token.chars().all(|ch| ch.is_ascii_digit()) {
            continue;
        }
        if !tokens.iter().any(|existing| existing == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

/// One provider attempt that did not produce the final result.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider: String,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct VisionOutcome {
    pub analysis: AnalysisResult,
    pub failures: Vec<ProviderFailure>,
}

/// Ordered hosted analyzers with the offline analyzer as terminal fallback.
pub struct VisionChain {
    providers: ProviderChain<Box<dyn VisionProvider>>,
    offline: OfflineAnalyzer,
    rate_limit_retries: u32,
    rate_limit_backoff: Duration,
    unknown: Vec<String>,
    events: EventWriter,
}

impl VisionChain {
    pub fn new(providers: Vec<Box<dyn VisionProvider>>) -> Self {
        Self {
            providers: ProviderChain::new(providers),
            offline: OfflineAnalyzer,
            rate_limit_retries: 0,
            rate_limit_backoff: Duration::ZERO,
            unknown: Vec::new(),
            events: EventWriter::disabled(),
        }
    }

    pub fn from_config(config: &VisionConfig, credentials: &Credentials) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let available: Vec<Box<dyn VisionProvider>> = vec![
            Box::new(OpenAiVision::new(
                credentials.openai.clone(),
                config.models.openai.clone(),
                timeout,
            )),
            Box::new(AnthropicVision::new(
                credentials.anthropic.clone(),
                config.models.anthropic.clone(),
                timeout,
            )),
        ];
        // The offline analyzer is not a chain member; naming it is allowed.
        let order: Vec<String> = config
            .chain
            .iter()
            .filter(|name| normalize_provider_name(name) != "offline")
            .cloned()
            .collect();
        let build = ProviderChain::ordered(available, &order);
        Self {
            providers: build.chain,
            offline: OfflineAnalyzer,
            rate_limit_retries: config.rate_limit_retries,
            rate_limit_backoff: Duration::from_millis(config.rate_limit_backoff_ms),
            unknown: build.unknown,
            events: EventWriter::disabled(),
        }
    }

    pub fn with_retry_policy(mut self, retries: u32, backoff: Duration) -> Self {
        self.rate_limit_retries = retries;
        self.rate_limit_backoff = backoff;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    /// Chain names that matched no known provider.
    pub fn unknown_providers(&self) -> &[String] {
        &self.unknown
    }

    /// `(name, configured)` in chain order; the offline analyzer is last and
    /// always available.
    pub fn status(&self) -> Vec<(String, bool)> {
        let mut rows: Vec<(String, bool)> = self
            .providers
            .providers()
            .iter()
            .map(|provider| (provider.name().to_string(), provider.is_configured()))
            .collect();
        rows.push((self.offline.name().to_string(), true));
        rows
    }

    /// Runs the chain to completion. Always yields a result: failures of
    /// hosted providers fall through to the offline analyzer.
    pub fn analyze(&self, image: &ImagePayload) -> VisionOutcome {
        let mut failures = Vec::new();
        for provider in self.providers.providers() {
            let name = provider.name().to_string();
            if !provider.is_configured() {
                self.events.record(
                    "provider_skipped",
                    payload(json!({
                        "stage": "vision",
                        "provider": name,
                        "image": image.filename,
                        "reason": "missing_credentials",
                    })),
                );
                continue;
            }

            let mut attempt: u32 = 0;
            loop {
                match provider.analyze(image) {
                    Ok(mut analysis) => {
                        analysis.confidence = provider.confidence();
                        analysis.provider = Some(name.clone());
                        if analysis.is_well_formed() {
                            return VisionOutcome { analysis, failures };
                        }
                        let err = ProviderError::malformed(&name, "analysis has no subjects, tags or scene");
                        self.note_failure(&mut failures, &name, image, &err);
                        break;
                    }
                    Err(err) if err.is_rate_limited() && attempt < self.rate_limit_retries => {
                        attempt += 1;
                        let wait = self.rate_limit_backoff * attempt;
                        self.events.record(
                            "rate_limited",
                            payload(json!({
                                "stage": "vision",
                                "provider": name,
                                "image": image.filename,
                                "attempt": attempt,
                                "wait_ms": wait.as_millis() as u64,
                            })),
                        );
                        if !wait.is_zero() {
                            thread::sleep(wait);
                        }
                    }
                    Err(err) => {
                        self.note_failure(&mut failures, &name, image, &err);
                        break;
                    }
                }
            }
        }

        VisionOutcome {
            analysis: self.offline.analyze(image),
            failures,
        }
    }

    fn note_failure(
        &self,
        failures: &mut Vec<ProviderFailure>,
        provider: &str,
        image: &ImagePayload,
        err: &ProviderError,
    ) {
        let message = truncate_text(&err.to_string(), 512);
        self.events.record(
            "provider_failed",
            payload(json!({
                "stage": "vision",
                "provider": provider,
                "image": image.filename,
                "kind": err.kind(),
                "error": message,
            })),
        );
        failures.push(ProviderFailure {
            provider: provider.to_string(),
            kind: err.kind(),
            message,
        });
    }
}

/// Extracts an [`AnalysisResult`] from free-form model output: code fences
/// are stripped, the outermost JSON object is used, and missing or oddly
/// typed fields are tolerated.
pub fn parse_analysis_text(provider: &str, text: &str) -> Result<AnalysisResult, ProviderError> {
    let Some(object_text) = outermost_json_object(text) else {
        return Err(ProviderError::malformed(
            provider,
            format!("no JSON object in reply: {}", truncate_text(text.trim(), 160)),
        ));
    };
    let value: Value = serde_json::from_str(object_text)
        .map_err(|err| ProviderError::malformed(provider, format!("invalid analysis JSON: {err}")))?;
    let Some(obj) = value.as_object() else {
        return Err(ProviderError::malformed(provider, "analysis is not an object"));
    };

    let relevance = obj
        .get("businessRelevance")
        .or_else(|| obj.get("business_relevance"))
        .and_then(Value::as_object);
    let flag = |camel: &str, snake: &str| {
        relevance
            .and_then(|flags| flags.get(camel).or_else(|| flags.get(snake)))
            .map(truthy)
            .unwrap_or(false)
    };

    let analysis = AnalysisResult {
        subjects: string_list(obj.get("subjects")),
        scene: obj
            .get("scene")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string(),
        description: obj
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string(),
        quality: obj.get("quality").map(quality_value).unwrap_or(0),
        confidence: 0.0,
        tags: string_list(obj.get("tags"))
            .into_iter()
            .map(|tag| tag.to_ascii_lowercase())
            .collect(),
        business_relevance: BusinessRelevance {
            is_team_photo: flag("isTeamPhoto", "is_team_photo"),
            is_service_action: flag("isServiceAction", "is_service_action"),
            is_before_after: flag("isBeforeAfter", "is_before_after"),
            is_building: flag("isBuilding", "is_building"),
        },
        provider: Some(provider.to_string()),
    };
    if !analysis.is_well_formed() {
        return Err(ProviderError::malformed(provider, "analysis has no subjects, tags or scene"));
    }
    Ok(analysis)
}

fn outermost_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        Some(Value::String(joined)) => joined
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn quality_value(value: &Value) -> u8 {
    let raw = match value {
        Value::Number(number) => number.as_f64().unwrap_or(0.0),
        Value::String(text) => text.trim().trim_end_matches('%').parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    // The prompt asks for 0-100. A value strictly between 0 and 1 can only be
    // a ratio; anything else is read on the 0-100 scale as given.
    let scaled = if raw > 0.0 && raw < 1.0 { raw * 100.0 } else { raw };
    scaled.round().clamp(0.0, 100.0) as u8
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(text) => matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        _ => false,
    }
}

fn api_base_from_env(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

fn mime_for_filename(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}
