// Narrow interfaces to the collaborators the core drives
//
// The on-device recognizer and the cloud SDKs live outside this crate;
// everything here talks to them only through these traits.

use async_trait::async_trait;

use crate::core::errors::CoreResult;
use crate::core::types::{CloudModel, Credential, ImageData, RecognitionResult, ScriptMode};

/// Local, offline text recognizer
#[async_trait]
pub trait OnDeviceRecognizer: Send + Sync {
    async fn recognize(
        &self,
        image: &ImageData,
        script_mode: ScriptMode,
    ) -> CoreResult<RecognitionResult>;
}

/// What to send to the cloud model
#[derive(Debug, Clone)]
pub enum CloudRequest {
    Prompt(String),
    Image { image: ImageData, prompt: String },
}

/// Remote vision / generation service
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Run `request` on `model`, moving down `fallback_models` when the
    /// model itself is unavailable.
    async fn generate_text(
        &self,
        credential: &Credential,
        request: &CloudRequest,
        model: CloudModel,
        fallback_models: &[CloudModel],
    ) -> CoreResult<String>;

    /// Lightweight request used to validate a key before it is stored
    async fn probe(&self, secret: &str) -> CoreResult<String>;
}

/// Remote machine translation
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    async fn translate(
        &self,
        credential: &Credential,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        model: CloudModel,
    ) -> CoreResult<String>;
}
