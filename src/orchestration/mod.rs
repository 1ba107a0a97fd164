// Orchestration: the components that drive providers, pool and storage

pub mod fallback_controller;
pub mod model_debouncer;
pub mod settings_sync;

pub use fallback_controller::{FallbackReason, RecognitionFallbackController, TestState};
pub use model_debouncer::{ModelSelectionDebouncer, SwitchOutcome};
pub use settings_sync::SettingsStore;
