pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{ConfigError, CoreError, CoreResult, ErrorClass};
pub use types::{
    CloudModel, Credential, CredentialId, ImageData, QualityBands, QualityRating,
    RecognitionConfiguration, RecognitionResult, RecognitionSource, ScriptMode,
    TranslationSettings,
};
