// Cache-first translation on top of the remote provider

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

use crate::core::errors::{CoreError, CoreResult};
use crate::core::types::{CloudModel, CredentialId};
use crate::middleware::{CredentialPool, TaskSlot};
use crate::services::providers::TranslationProvider;
use crate::services::translation::cache::TranslationCache;
use crate::utils::Metrics;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub model: CloudModel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationOutcome {
    pub translated_text: String,
    pub from_cache: bool,
}

/// Result of the remote leg, before any state is touched
enum Fetched {
    Cached(String),
    Translated { text: String, credential: CredentialId },
    Failed { error: CoreError, credential: CredentialId },
}

pub struct TranslationService {
    cache: TranslationCache,
    provider: Arc<dyn TranslationProvider>,
    pool: Arc<CredentialPool>,
    test_slot: TaskSlot,
    cache_enabled: AtomicBool,
    metrics: Option<Metrics>,
}

impl TranslationService {
    pub fn new(
        cache: TranslationCache,
        provider: Arc<dyn TranslationProvider>,
        pool: Arc<CredentialPool>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            cache,
            provider,
            pool,
            test_slot: TaskSlot::new(),
            cache_enabled: AtomicBool::new(true),
            metrics,
        }
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.cache
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache_enabled.store(enabled, Ordering::Relaxed);
    }

    fn cache_enabled(&self) -> bool {
        self.cache_enabled.load(Ordering::Relaxed)
    }

    /// Translate, serving from the cache when a live entry exists
    #[instrument(skip(self, request), fields(model = %request.model, chars = request.text.len()))]
    pub async fn translate(&self, request: &TranslationRequest) -> CoreResult<TranslationOutcome> {
        let fetched = self.fetch(request).await?;
        self.apply(request, fetched).await
    }

    /// Cancellable translation test. Starting another test cancels this one
    /// and a cancelled test leaves the cache and pool untouched.
    pub async fn run_test(&self, request: &TranslationRequest) -> CoreResult<TranslationOutcome> {
        let ticket = self.test_slot.begin();
        let fetched = match ticket.run_result(self.fetch(request)).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.test_slot.release(&ticket);
                return Err(e);
            }
        };

        if self.test_slot.finish(&ticket, || ()).is_none() {
            debug!("Translation test superseded, discarding result");
            return Err(CoreError::Cancelled);
        }
        self.apply(request, fetched).await
    }

    pub fn cancel_test(&self) -> bool {
        self.test_slot.cancel()
    }

    async fn fetch(&self, request: &TranslationRequest) -> CoreResult<Fetched> {
        if request.text.trim().is_empty() {
            return Ok(Fetched::Cached(String::new()));
        }

        if self.cache_enabled() {
            if let Some(entry) = self.cache.lookup(
                &request.text,
                &request.source_lang,
                &request.target_lang,
                request.model,
            ) {
                debug!("Translation cache hit");
                return Ok(Fetched::Cached(entry.translated_text.clone()));
            }
        }

        let credential = self
            .pool
            .select_for_use()
            .await
            .ok_or_else(|| CoreError::provider("no active API key"))?;

        let start = Instant::now();
        let result = self
            .provider
            .translate(
                &credential,
                &request.text,
                &request.source_lang,
                &request.target_lang,
                request.model,
            )
            .await;

        if let Some(ref m) = self.metrics {
            m.record_api_call(result.is_ok(), start.elapsed());
        }

        Ok(match result {
            Ok(text) => Fetched::Translated {
                text,
                credential: credential.id,
            },
            Err(error) => Fetched::Failed {
                error,
                credential: credential.id,
            },
        })
    }

    async fn apply(
        &self,
        request: &TranslationRequest,
        fetched: Fetched,
    ) -> CoreResult<TranslationOutcome> {
        match fetched {
            Fetched::Cached(translated_text) => Ok(TranslationOutcome {
                translated_text,
                from_cache: true,
            }),
            Fetched::Translated { text, credential } => {
                self.pool.record_success(&credential).await;
                if self.cache_enabled() {
                    self.cache.store(
                        &request.text,
                        &request.source_lang,
                        &request.target_lang,
                        request.model,
                        &text,
                    );
                }
                Ok(TranslationOutcome {
                    translated_text: text,
                    from_cache: false,
                })
            }
            Fetched::Failed { error, credential } => {
                warn!("Translation failed with key {}: {}", credential, error);
                self.pool.record_failure(&credential).await;
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Credential;
    use crate::middleware::credential_pool::tests::key;
    use crate::middleware::PoolPolicy;
    use crate::utils::system_clock;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingTranslator {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl CountingTranslator {
        fn new(fail: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
                delay,
            })
        }
    }

    #[async_trait]
    impl TranslationProvider for CountingTranslator {
        async fn translate(
            &self,
            _credential: &Credential,
            text: &str,
            _source_lang: &str,
            target_lang: &str,
            _model: CloudModel,
        ) -> CoreResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(CoreError::provider("429 quota exceeded"))
            } else {
                Ok(format!("[{}] {}", target_lang, text))
            }
        }
    }

    async fn service(provider: Arc<CountingTranslator>) -> (TranslationService, Arc<CredentialPool>) {
        let pool = Arc::new(CredentialPool::new(PoolPolicy::default()));
        pool.add(&key(1), "main").await.unwrap();
        let cache = TranslationCache::new(30, system_clock(), None);
        (
            TranslationService::new(cache, provider, Arc::clone(&pool), None),
            pool,
        )
    }

    fn request(text: &str) -> TranslationRequest {
        TranslationRequest {
            text: text.to_string(),
            source_lang: "es".to_string(),
            target_lang: "en".to_string(),
            model: CloudModel::Fast,
        }
    }

    #[tokio::test]
    async fn test_second_call_hits_cache() {
        let provider = CountingTranslator::new(false, Duration::ZERO);
        let (service, _) = service(Arc::clone(&provider)).await;

        let first = service.translate(&request("hola")).await.unwrap();
        let second = service.translate(&request("hola")).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.translated_text, "[en] hola");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_calls_provider() {
        let provider = CountingTranslator::new(false, Duration::ZERO);
        let (service, _) = service(Arc::clone(&provider)).await;
        service.set_cache_enabled(false);

        service.translate(&request("hola")).await.unwrap();
        service.translate(&request("hola")).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(service.cache().stats().total_entries, 0);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_not_cached() {
        let provider = CountingTranslator::new(true, Duration::ZERO);
        let (service, pool) = service(provider).await;

        let err = service.translate(&request("hola")).await.unwrap_err();
        assert!(matches!(err, CoreError::ProviderFailure { .. }));
        assert_eq!(pool.snapshot().await[0].error_count, 1);
        assert_eq!(service.cache().stats().total_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_translation_test_leaves_no_trace() {
        let provider = CountingTranslator::new(false, Duration::from_secs(5));
        let (service, _) = service(provider).await;
        let service = Arc::new(service);

        let first = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.run_test(&request("uno")).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = service.run_test(&request("dos")).await.unwrap();
        assert_eq!(second.translated_text, "[en] dos");

        assert!(matches!(first.await.unwrap(), Err(CoreError::Cancelled)));
        assert_eq!(service.cache().stats().total_entries, 1);
    }
}
