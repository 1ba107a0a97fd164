// Shared data model for recognition, credentials and translation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::core::errors::{CoreError, CoreResult};

/// Opaque credential identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(String);

impl CredentialId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CredentialId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// API key plus metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub secret: String,
    pub label: String,
    pub is_active: bool,
    pub error_count: u32,
    pub created_at: DateTime<Utc>,
    /// Set when the error threshold, not the user, deactivated this key
    #[serde(default)]
    pub deactivated_by_errors: bool,
}

impl Credential {
    /// Secret with everything but the edges hidden, safe for logs and UI
    pub fn masked_secret(&self) -> String {
        mask_secret(&self.secret)
    }
}

pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", head, tail)
}

/// Script the on-device recognizer should be tuned for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptMode {
    #[default]
    Auto,
    Latin,
    Chinese,
    Japanese,
    Korean,
    Devanagari,
}

/// Cloud model tiers. Provider ids only appear at the provider boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudModel {
    Fast,
    #[default]
    Balanced,
    Pro,
}

impl CloudModel {
    pub const ALL: [CloudModel; 3] = [CloudModel::Fast, CloudModel::Balanced, CloudModel::Pro];

    pub fn provider_id(self) -> &'static str {
        match self {
            CloudModel::Fast => "gemini-2.5-flash-lite",
            CloudModel::Balanced => "gemini-2.5-flash",
            CloudModel::Pro => "gemini-2.5-pro",
        }
    }

    pub fn from_provider_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.provider_id() == id)
    }

    /// Models to fall back to when this one is unavailable, fastest first
    pub fn fallbacks(self) -> Vec<CloudModel> {
        match self {
            CloudModel::Fast => vec![CloudModel::Balanced],
            CloudModel::Balanced => vec![CloudModel::Fast],
            CloudModel::Pro => vec![CloudModel::Balanced, CloudModel::Fast],
        }
    }

    /// Slow models get a doubled request timeout
    pub fn is_slow(self) -> bool {
        matches!(self, CloudModel::Pro)
    }
}

impl fmt::Display for CloudModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.provider_id())
    }
}

/// Recognition settings as edited by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfiguration {
    pub script_mode: ScriptMode,
    pub auto_detect: bool,
    /// On-device word confidence floor, fraction in [0, 1]
    pub confidence_threshold: f32,
    pub cloud_enabled: bool,
    /// Below this on-device percentage the cloud pass runs
    pub cloud_threshold_percent: u8,
    pub always_cloud: bool,
    pub selected_model: CloudModel,
    pub force_test_cloud: bool,
}

impl Default for RecognitionConfiguration {
    fn default() -> Self {
        Self {
            script_mode: ScriptMode::Auto,
            auto_detect: true,
            confidence_threshold: 0.5,
            cloud_enabled: false,
            cloud_threshold_percent: 70,
            always_cloud: false,
            selected_model: CloudModel::Balanced,
            force_test_cloud: false,
        }
    }
}

impl RecognitionConfiguration {
    pub fn validate(&self) -> CoreResult<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(CoreError::InvalidConfiguration(format!(
                "confidence_threshold must be in [0.0, 1.0], got {}",
                self.confidence_threshold
            )));
        }
        if self.cloud_threshold_percent > 100 {
            return Err(CoreError::InvalidConfiguration(format!(
                "cloud_threshold_percent must be in [0, 100], got {}",
                self.cloud_threshold_percent
            )));
        }
        Ok(())
    }
}

/// Translation settings persisted alongside recognition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationSettings {
    pub model: CloudModel,
    pub target_language: String,
    pub cache_enabled: bool,
    pub cache_ttl_days: u32,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            model: CloudModel::Fast,
            target_language: "en".to_string(),
            cache_enabled: true,
            cache_ttl_days: 30,
        }
    }
}

/// Convert a [0, 1] confidence into a whole percentage
pub fn confidence_to_percent(confidence: f32) -> u8 {
    (confidence.clamp(0.0, 1.0) * 100.0).round() as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionSource {
    OnDevice,
    Cloud,
    Unknown,
}

/// Character range of a word inside the recognized text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WordSpan {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordConfidence {
    pub span: WordSpan,
    pub confidence: f32,
}

/// Output of a single recognition test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub text: String,
    pub source: RecognitionSource,
    pub overall_confidence: f32,
    pub per_word_confidence: Vec<WordConfidence>,
    pub processing_time_ms: u64,
    pub fallback_triggered: bool,
    pub fallback_reason: Option<String>,
    pub cloud_processing_time_ms: Option<u64>,
}

impl RecognitionResult {
    pub fn on_device(text: impl Into<String>, overall_confidence: f32) -> Self {
        Self {
            text: text.into(),
            source: RecognitionSource::OnDevice,
            overall_confidence,
            per_word_confidence: Vec::new(),
            processing_time_ms: 0,
            fallback_triggered: false,
            fallback_reason: None,
            cloud_processing_time_ms: None,
        }
    }

    pub fn confidence_percent(&self) -> u8 {
        confidence_to_percent(self.overall_confidence)
    }

    pub fn quality(&self, bands: &QualityBands) -> QualityRating {
        bands.rate(self.overall_confidence)
    }

    /// True when the cloud pass was attempted but the on-device text was kept
    pub fn is_degraded(&self) -> bool {
        self.fallback_triggered && self.source != RecognitionSource::Cloud
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityRating {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl fmt::Display for QualityRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QualityRating::Excellent => "Excellent",
            QualityRating::Good => "Good",
            QualityRating::Fair => "Fair",
            QualityRating::Poor => "Poor",
        };
        f.write_str(label)
    }
}

/// Lower bounds (inclusive) of each quality band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityBands {
    pub excellent: f32,
    pub good: f32,
    pub fair: f32,
}

impl Default for QualityBands {
    fn default() -> Self {
        Self {
            excellent: 0.9,
            good: 0.7,
            fair: 0.5,
        }
    }
}

impl QualityBands {
    pub fn rate(&self, confidence: f32) -> QualityRating {
        if confidence >= self.excellent {
            QualityRating::Excellent
        } else if confidence >= self.good {
            QualityRating::Good
        } else if confidence >= self.fair {
            QualityRating::Fair
        } else {
            QualityRating::Poor
        }
    }

    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.excellent)
            && (0.0..=1.0).contains(&self.fair)
            && self.excellent >= self.good
            && self.good >= self.fair
    }
}

/// Image handed to the recognizers
#[derive(Debug, Clone)]
pub struct ImageData {
    pub name: String,
    pub bytes: Arc<Vec<u8>>,
    pub mime_type: String,
}

impl ImageData {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bytes: Arc::new(bytes),
            mime_type: mime_type.into(),
        }
    }
}

/// A pending model change, alive only during the debounce window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSwitchIntent {
    pub requested_model: CloudModel,
    pub submitted_at: DateTime<Utc>,
}
