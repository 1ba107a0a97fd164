// Library exports for the recognition and translation core
//
// Credential pool, recognition fallback, debounced model selection and the
// translation cache, wired together by the settings store

// Core modules
pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{ConfigError, CoreError, CoreResult, ErrorClass},
    types::{
        CloudModel, Credential, CredentialId, ImageData, QualityBands, QualityRating,
        RecognitionConfiguration, RecognitionResult, RecognitionSource, ScriptMode,
        TranslationSettings,
    },
};

pub use middleware::{CredentialPool, CredentialView, KeyHealth, PoolPolicy, TaskSlot, TaskTicket};

pub use orchestration::{
    FallbackReason, ModelSelectionDebouncer, RecognitionFallbackController, SettingsStore,
    SwitchOutcome, TestState,
};

pub use services::{
    CloudProvider, GeminiClient, JsonFileStore, KeyValueStore, MemoryStore, OnDeviceRecognizer,
    TranslationCache, TranslationProvider, TranslationService,
};

pub use utils::{Clock, Metrics};
