// Debounced cloud model selection
//
// The new model is shown at once, but only persisted after a quiet period
// without further requests. A newer request supersedes the pending one.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::errors::CoreResult;
use crate::core::types::{CloudModel, ModelSwitchIntent};
use crate::middleware::TaskSlot;
use crate::orchestration::fallback_controller::RecognitionFallbackController;
use crate::orchestration::settings_sync::SettingsStore;
use crate::utils::{Clock, Metrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    Committed(CloudModel),
    /// A newer request arrived during the quiet period
    Superseded,
}

pub struct ModelSelectionDebouncer {
    settings: Arc<SettingsStore>,
    controller: Option<Arc<RecognitionFallbackController>>,
    slot: TaskSlot,
    pending: Mutex<Option<ModelSwitchIntent>>,
    quiet_period: Duration,
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
}

impl ModelSelectionDebouncer {
    pub fn new(
        settings: Arc<SettingsStore>,
        controller: Option<Arc<RecognitionFallbackController>>,
        quiet_period: Duration,
        clock: Arc<dyn Clock>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            settings,
            controller,
            slot: TaskSlot::new(),
            pending: Mutex::new(None),
            quiet_period,
            clock,
            metrics,
        }
    }

    /// Model waiting out its quiet period, if any
    pub fn pending(&self) -> Option<ModelSwitchIntent> {
        *self.pending.lock()
    }

    pub async fn request_switch(&self, model: CloudModel) -> CoreResult<SwitchOutcome> {
        let ticket = self.slot.begin();

        // A running test was started against the old model
        if let Some(ref controller) = self.controller {
            controller.cancel();
        }

        let intent = ModelSwitchIntent {
            requested_model: model,
            submitted_at: self.clock.now(),
        };
        self.slot.update(&ticket, || *self.pending.lock() = Some(intent));
        self.settings.show_selected_model(model);
        debug!("Model switch to {} pending", model);

        if ticket.run(tokio::time::sleep(self.quiet_period)).await.is_err() {
            debug!("Model switch to {} superseded", model);
            return Ok(SwitchOutcome::Superseded);
        }

        let Some(Some(intent)) = self.slot.finish(&ticket, || self.pending.lock().take()) else {
            return Ok(SwitchOutcome::Superseded);
        };

        match self
            .settings
            .commit_selected_model(intent.requested_model)
            .await
        {
            Ok(()) => {
                let waited = self.clock.now() - intent.submitted_at;
                info!(
                    "Model switched to {} after {} ms",
                    intent.requested_model,
                    waited.num_milliseconds()
                );
                if let Some(ref m) = self.metrics {
                    m.record_model_switch(true);
                }
                Ok(SwitchOutcome::Committed(intent.requested_model))
            }
            Err(e) => {
                warn!(
                    "Failed to persist model {}: {}",
                    intent.requested_model, e
                );
                // A newer request owns the visible selection now
                if !self.slot.is_running() {
                    self.settings.rollback_selected_model().await;
                }
                if let Some(ref m) = self.metrics {
                    m.record_model_switch(false);
                }
                Err(e)
            }
        }
    }

    /// Fire-and-forget variant for callers that do not wait on the outcome
    pub fn request_switch_detached(
        self: &Arc<Self>,
        model: CloudModel,
    ) -> JoinHandle<CoreResult<SwitchOutcome>> {
        let debouncer = Arc::clone(self);
        tokio::spawn(async move { debouncer.request_switch(model).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::CoreError;
    use crate::core::types::{
        Credential, ImageData, RecognitionConfiguration, RecognitionResult, ScriptMode,
    };
    use crate::orchestration::settings_sync::tests::{settings_on, FlakyStore};
    use crate::orchestration::settings_sync::RECOGNITION_KEY;
    use crate::services::providers::{CloudProvider, CloudRequest, OnDeviceRecognizer};
    use crate::services::storage::{get_json, KeyValueStore, MemoryStore};
    use crate::utils::system_clock;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;

    const QUIET: Duration = Duration::from_millis(300);

    async fn debouncer_on(
        store: Arc<dyn KeyValueStore>,
    ) -> (Arc<ModelSelectionDebouncer>, Arc<SettingsStore>, Metrics) {
        let settings = Arc::new(settings_on(store).await);
        let metrics = Metrics::new();
        let debouncer = Arc::new(ModelSelectionDebouncer::new(
            Arc::clone(&settings),
            None,
            QUIET,
            system_clock(),
            Some(metrics.clone()),
        ));
        (debouncer, settings, metrics)
    }

    async fn stored_model(store: &dyn KeyValueStore) -> Option<CloudModel> {
        get_json::<RecognitionConfiguration>(store, RECOGNITION_KEY)
            .await
            .unwrap()
            .map(|c| c.selected_model)
    }

    /// Memory store that records every recognition settings write
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        written: Mutex<Vec<CloudModel>>,
    }

    #[async_trait]
    impl KeyValueStore for RecordingStore {
        async fn get(&self, key: &str) -> CoreResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> CoreResult<()> {
            if key == RECOGNITION_KEY {
                let config: RecognitionConfiguration = serde_json::from_str(&value).unwrap();
                self.written.lock().push(config.selected_model);
            }
            self.inner.set(key, value).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_requests_commit_last_only() {
        let store = Arc::new(RecordingStore::default());
        let (debouncer, settings, metrics) = debouncer_on(store.clone()).await;

        let x = debouncer.request_switch_detached(CloudModel::Fast);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let y = debouncer.request_switch_detached(CloudModel::Balanced);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let z = debouncer.request_switch_detached(CloudModel::Pro);

        assert_eq!(x.await.unwrap().unwrap(), SwitchOutcome::Superseded);
        assert_eq!(y.await.unwrap().unwrap(), SwitchOutcome::Superseded);
        assert_eq!(
            z.await.unwrap().unwrap(),
            SwitchOutcome::Committed(CloudModel::Pro)
        );

        assert_eq!(*store.written.lock(), vec![CloudModel::Pro]);
        assert_eq!(settings.recognition().selected_model, CloudModel::Pro);
        assert_eq!(metrics.snapshot().model_switch_commits, 1);
        assert!(debouncer.pending().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_visible_before_commit() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let (debouncer, settings, _) = debouncer_on(Arc::clone(&store)).await;

        let handle = debouncer.request_switch_detached(CloudModel::Pro);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(settings.recognition().selected_model, CloudModel::Pro);
        assert_eq!(stored_model(store.as_ref()).await, None);
        assert_eq!(
            debouncer.pending().map(|i| i.requested_model),
            Some(CloudModel::Pro)
        );

        handle.await.unwrap().unwrap();
        assert_eq!(stored_model(store.as_ref()).await, Some(CloudModel::Pro));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failure_rolls_back() {
        let store = Arc::new(FlakyStore::default());
        let (debouncer, settings, metrics) = debouncer_on(store.clone()).await;
        store.fail_writes.store(true, Ordering::SeqCst);

        let err = debouncer.request_switch(CloudModel::Pro).await.unwrap_err();
        assert!(matches!(err, CoreError::PersistenceFailure { .. }));
        assert_eq!(settings.recognition().selected_model, CloudModel::Balanced);
        assert_eq!(metrics.snapshot().model_switch_rollbacks, 1);
    }

    struct SlowRecognizer;

    #[async_trait]
    impl OnDeviceRecognizer for SlowRecognizer {
        async fn recognize(
            &self,
            _image: &ImageData,
            _script_mode: ScriptMode,
        ) -> CoreResult<RecognitionResult> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(RecognitionResult::on_device("late", 0.9))
        }
    }

    struct NoCloud;

    #[async_trait]
    impl CloudProvider for NoCloud {
        async fn generate_text(
            &self,
            _credential: &Credential,
            _request: &CloudRequest,
            _model: CloudModel,
            _fallback_models: &[CloudModel],
        ) -> CoreResult<String> {
            Err(CoreError::provider("unused"))
        }

        async fn probe(&self, _secret: &str) -> CoreResult<String> {
            Err(CoreError::provider("unused"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_cancels_running_recognition() {
        let settings = Arc::new(settings_on(Arc::new(MemoryStore::new())).await);
        let controller = Arc::new(RecognitionFallbackController::new(
            Arc::new(SlowRecognizer),
            Arc::new(NoCloud),
            Arc::clone(settings.pool()),
            crate::core::Config::default().recognition,
            None,
        ));
        let debouncer = ModelSelectionDebouncer::new(
            Arc::clone(&settings),
            Some(Arc::clone(&controller)),
            QUIET,
            system_clock(),
            None,
        );

        let test = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .run_test(
                        ImageData::new("page", Vec::new(), "image/png"),
                        &RecognitionConfiguration::default(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = debouncer.request_switch(CloudModel::Fast).await.unwrap();
        assert_eq!(outcome, SwitchOutcome::Committed(CloudModel::Fast));
        assert!(matches!(test.await.unwrap(), Err(CoreError::Cancelled)));
        assert!(controller.subscribe_results().borrow().is_none());
    }
}
