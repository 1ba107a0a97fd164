pub mod cache;
pub mod service;

pub use cache::{CacheEntry, CacheKey, CacheStats, TranslationCache};
pub use service::{TranslationOutcome, TranslationRequest, TranslationService};
