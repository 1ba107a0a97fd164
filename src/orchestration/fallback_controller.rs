// Recognition fallback controller: on-device pass, evaluation, optional cloud pass

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::core::config::RecognitionConfig;
use crate::core::errors::{CoreError, CoreResult};
use crate::core::types::{
    CredentialId, ImageData, QualityBands, RecognitionConfiguration, RecognitionResult,
    RecognitionSource,
};
use crate::middleware::{CredentialPool, TaskSlot, TaskTicket};
use crate::services::providers::{CloudProvider, CloudRequest, OnDeviceRecognizer};
use crate::utils::Metrics;

/// Observable phase of the current recognition test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestState {
    Idle,
    RunningOnDevice,
    Evaluating,
    RunningCloud,
}

/// Why a test went to the cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    AlwaysCloud,
    ForcedTest,
    LowConfidence { percent: u8, threshold: u8 },
}

impl FallbackReason {
    /// `None` means the on-device result stands
    pub fn decide(config: &RecognitionConfiguration, on_device: &RecognitionResult) -> Option<Self> {
        if config.always_cloud {
            return Some(Self::AlwaysCloud);
        }
        if config.force_test_cloud {
            return Some(Self::ForcedTest);
        }
        let percent = on_device.confidence_percent();
        if config.cloud_enabled && percent < config.cloud_threshold_percent {
            return Some(Self::LowConfidence {
                percent,
                threshold: config.cloud_threshold_percent,
            });
        }
        None
    }

    /// Stable label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::AlwaysCloud => "always_cloud",
            Self::ForcedTest => "forced_test",
            Self::LowConfidence { .. } => "low_confidence",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlwaysCloud => f.write_str("always use cloud"),
            Self::ForcedTest => f.write_str("cloud test forced"),
            Self::LowConfidence { percent, threshold } => {
                write!(f, "confidence {}% below threshold {}%", percent, threshold)
            }
        }
    }
}

pub struct RecognitionFallbackController {
    on_device: Arc<dyn OnDeviceRecognizer>,
    cloud: Arc<dyn CloudProvider>,
    pool: Arc<CredentialPool>,
    slot: TaskSlot,
    state_tx: watch::Sender<TestState>,
    result_tx: watch::Sender<Option<Arc<RecognitionResult>>>,
    settings: RecognitionConfig,
    metrics: Option<Metrics>,
}

impl RecognitionFallbackController {
    pub fn new(
        on_device: Arc<dyn OnDeviceRecognizer>,
        cloud: Arc<dyn CloudProvider>,
        pool: Arc<CredentialPool>,
        settings: RecognitionConfig,
        metrics: Option<Metrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(TestState::Idle);
        let (result_tx, _) = watch::channel(None);
        Self {
            on_device,
            cloud,
            pool,
            slot: TaskSlot::new(),
            state_tx,
            result_tx,
            settings,
            metrics,
        }
    }

    pub fn quality_bands(&self) -> &QualityBands {
        &self.settings.quality_bands
    }

    pub fn state(&self) -> TestState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TestState> {
        self.state_tx.subscribe()
    }

    /// Latest delivered result. Superseded tests never show up here.
    pub fn subscribe_results(&self) -> watch::Receiver<Option<Arc<RecognitionResult>>> {
        self.result_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_running()
    }

    /// Run one recognition test, cancelling whichever test was running
    #[instrument(skip(self, image, config), fields(image = %image.name))]
    pub async fn run_test(
        &self,
        image: ImageData,
        config: &RecognitionConfiguration,
    ) -> CoreResult<RecognitionResult> {
        config.validate()?;

        let ticket = self.slot.begin();
        self.set_state(&ticket, TestState::RunningOnDevice);

        let start = Instant::now();
        let recognized = ticket
            .run_result(self.on_device.recognize(&image, config.script_mode))
            .await;
        let mut on_device = match recognized {
            Ok(result) => result,
            Err(e) => return Err(self.abandon(&ticket, e)),
        };
        let on_device_time = start.elapsed();
        on_device.source = RecognitionSource::OnDevice;
        on_device.processing_time_ms = on_device_time.as_millis() as u64;

        self.set_state(&ticket, TestState::Evaluating);
        let Some(reason) = FallbackReason::decide(config, &on_device) else {
            debug!(
                "On-device confidence {}% accepted",
                on_device.confidence_percent()
            );
            return self.complete(&ticket, on_device, on_device_time);
        };

        info!("Cloud fallback: {}", reason);
        if let Some(ref m) = self.metrics {
            m.record_fallback(reason.label());
        }
        self.set_state(&ticket, TestState::RunningCloud);

        let result = match ticket
            .run(self.cloud_pass(&image, config, on_device, reason))
            .await
        {
            Ok(result) => result,
            Err(e) => return Err(self.abandon(&ticket, e)),
        };
        self.complete(&ticket, result, on_device_time)
    }

    /// Cancel the running test. Safe to call when nothing is running.
    pub fn cancel(&self) -> bool {
        let cancelled = self.slot.cancel_with(|| {
            self.state_tx.send_replace(TestState::Idle);
        });
        if cancelled {
            debug!("Recognition test cancelled");
            if let Some(ref m) = self.metrics {
                m.record_recognition_cancelled();
            }
        }
        cancelled
    }

    async fn cloud_pass(
        &self,
        image: &ImageData,
        config: &RecognitionConfiguration,
        mut on_device: RecognitionResult,
        reason: FallbackReason,
    ) -> RecognitionResult {
        let request = CloudRequest::Image {
            image: image.clone(),
            prompt: self.settings.cloud_prompt.clone(),
        };
        let model = config.selected_model;
        let fallback_models = model.fallbacks();
        let attempts = self.settings.cloud_credential_attempts.max(1);

        let mut tried: Vec<CredentialId> = Vec::new();
        let mut last_error: Option<CoreError> = None;

        for _ in 0..attempts {
            let credential = if tried.is_empty() {
                self.pool.select_for_use().await
            } else {
                self.pool.next_viable(&tried).await
            };
            let Some(credential) = credential else {
                break;
            };

            let start = Instant::now();
            let response = self
                .cloud
                .generate_text(&credential, &request, model, &fallback_models)
                .await;
            let elapsed = start.elapsed();
            if let Some(ref m) = self.metrics {
                m.record_api_call(response.is_ok(), elapsed);
            }

            match response {
                Ok(text) => {
                    self.pool.record_success(&credential.id).await;
                    return RecognitionResult {
                        text,
                        source: RecognitionSource::Cloud,
                        overall_confidence: on_device.overall_confidence,
                        per_word_confidence: Vec::new(),
                        processing_time_ms: on_device.processing_time_ms,
                        fallback_triggered: true,
                        fallback_reason: Some(reason.to_string()),
                        cloud_processing_time_ms: Some(elapsed.as_millis() as u64),
                    };
                }
                Err(e) => {
                    warn!(
                        "Cloud recognition failed with key {}: {}",
                        credential.masked_secret(),
                        e
                    );
                    self.pool.record_failure(&credential.id).await;
                    tried.push(credential.id);
                    last_error = Some(e);
                }
            }
        }

        on_device.fallback_triggered = true;
        on_device.fallback_reason = Some(match last_error {
            Some(e) => e.to_string(),
            None => "no active credential".to_string(),
        });
        on_device
    }

    fn set_state(&self, ticket: &TaskTicket, state: TestState) {
        self.slot.update(ticket, || {
            self.state_tx.send_replace(state);
        });
    }

    /// Deliver `result` if this test still owns the slot
    fn complete(
        &self,
        ticket: &TaskTicket,
        result: RecognitionResult,
        on_device_time: std::time::Duration,
    ) -> CoreResult<RecognitionResult> {
        let delivered = self.slot.finish(ticket, || {
            self.result_tx.send_replace(Some(Arc::new(result.clone())));
            self.state_tx.send_replace(TestState::Idle);
        });

        if delivered.is_none() {
            debug!("Recognition test superseded, discarding result");
            return Err(CoreError::Cancelled);
        }

        if let Some(ref m) = self.metrics {
            m.record_recognition_test(on_device_time);
        }
        info!(
            "Recognition finished: {:?}, {}% ({}){}",
            result.source,
            result.confidence_percent(),
            result.quality(&self.settings.quality_bands),
            result
                .fallback_reason
                .as_deref()
                .map(|r| format!(", fallback: {}", r))
                .unwrap_or_default()
        );
        Ok(result)
    }

    /// Free the slot after a failed or cancelled pass
    fn abandon(&self, ticket: &TaskTicket, error: CoreError) -> CoreError {
        self.slot.finish(ticket, || {
            self.state_tx.send_replace(TestState::Idle);
        });
        if !error.is_cancelled() {
            warn!("Recognition test failed: {}", error);
        }
        error
    }
}
