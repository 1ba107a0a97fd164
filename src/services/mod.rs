pub mod gemini;
pub mod providers;
pub mod storage;
pub mod translation;

// Re-export commonly used services
pub use gemini::GeminiClient;
pub use providers::{CloudProvider, CloudRequest, OnDeviceRecognizer, TranslationProvider};
pub use storage::{JsonFileStore, KeyValueStore, MemoryStore};
pub use translation::{TranslationCache, TranslationService};
