// Settings synchronization: one owned store that persists and republishes
//
// Every mutation goes to durable storage first and is only published to
// observers once the write succeeded. Credential changes go through the pool
// and are restored from a checkpoint when the write fails. The selected cloud
// model is the other exception: the debouncer shows it immediately and
// commits or rolls back after the quiet period.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::errors::CoreResult;
use crate::core::types::{
    CloudModel, Credential, CredentialId, RecognitionConfiguration, TranslationSettings,
};
use crate::middleware::{CredentialPool, CredentialView, PoolCheckpoint, PoolPolicy};
use crate::services::providers::CloudProvider;
use crate::services::storage::{get_json, get_json_strict, set_json, KeyValueStore};
use crate::services::translation::{CacheStats, TranslationCache};
use crate::utils::{Clock, Metrics};

pub const RECOGNITION_KEY: &str = "recognition.config";
pub const TRANSLATION_KEY: &str = "translation.settings";
pub const CREDENTIALS_KEY: &str = "credentials";

pub struct SettingsStore {
    store: Arc<dyn KeyValueStore>,
    pool: Arc<CredentialPool>,
    /// Last successfully persisted recognition configuration
    persisted: Mutex<RecognitionConfiguration>,
    /// What observers see; may carry a not-yet-committed model selection
    recognition_tx: watch::Sender<RecognitionConfiguration>,
    translation: Mutex<TranslationSettings>,
    translation_tx: watch::Sender<TranslationSettings>,
    cache_stats_tx: watch::Sender<CacheStats>,
    credentials_lock: Mutex<()>,
}

impl SettingsStore {
    /// Read everything from `store` and build the credential pool
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        policy: PoolPolicy,
        clock: Arc<dyn Clock>,
        metrics: Option<Metrics>,
    ) -> CoreResult<Self> {
        let recognition: RecognitionConfiguration =
            match get_json::<RecognitionConfiguration>(store.as_ref(), RECOGNITION_KEY).await? {
                Some(config) => match config.validate() {
                    Ok(()) => config,
                    Err(e) => {
                        warn!("Stored recognition settings rejected, using defaults: {}", e);
                        RecognitionConfiguration::default()
                    }
                },
                None => RecognitionConfiguration::default(),
            };
        let translation: TranslationSettings = get_json(store.as_ref(), TRANSLATION_KEY)
            .await?
            .unwrap_or_default();
        // Unreadable keys fail the load; an empty pool would overwrite them
        let credentials: Vec<Credential> = get_json_strict(store.as_ref(), CREDENTIALS_KEY)
            .await?
            .unwrap_or_default();

        info!(
            "Loaded settings: model={}, cloud={}, {} stored API key(s)",
            recognition.selected_model,
            recognition.cloud_enabled,
            credentials.len()
        );

        let mut pool = CredentialPool::from_credentials(policy, credentials, clock);
        if let Some(metrics) = metrics {
            pool = pool.with_metrics(metrics);
        }

        let (recognition_tx, _) = watch::channel(recognition.clone());
        let (translation_tx, _) = watch::channel(translation.clone());
        let (cache_stats_tx, _) = watch::channel(CacheStats::default());

        Ok(Self {
            store,
            pool: Arc::new(pool),
            persisted: Mutex::new(recognition),
            recognition_tx,
            translation: Mutex::new(translation),
            translation_tx,
            cache_stats_tx,
            credentials_lock: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Currently visible recognition configuration
    pub fn recognition(&self) -> RecognitionConfiguration {
        self.recognition_tx.borrow().clone()
    }

    pub fn translation(&self) -> TranslationSettings {
        self.translation_tx.borrow().clone()
    }

    pub fn subscribe_recognition(&self) -> watch::Receiver<RecognitionConfiguration> {
        self.recognition_tx.subscribe()
    }

    pub fn subscribe_translation(&self) -> watch::Receiver<TranslationSettings> {
        self.translation_tx.subscribe()
    }

    pub fn subscribe_credentials(&self) -> watch::Receiver<Vec<CredentialView>> {
        self.pool.subscribe()
    }

    pub fn subscribe_cache_stats(&self) -> watch::Receiver<CacheStats> {
        self.cache_stats_tx.subscribe()
    }

    /// Apply `f` to the persisted configuration, persist, then publish
    pub async fn update_recognition(
        &self,
        f: impl FnOnce(&mut RecognitionConfiguration),
    ) -> CoreResult<RecognitionConfiguration> {
        let mut persisted = self.persisted.lock().await;
        let mut updated = persisted.clone();
        f(&mut updated);
        updated.validate()?;

        set_json(self.store.as_ref(), RECOGNITION_KEY, &updated).await?;
        *persisted = updated.clone();
        self.recognition_tx.send_replace(updated.clone());
        Ok(updated)
    }

    pub async fn update_translation(
        &self,
        f: impl FnOnce(&mut TranslationSettings),
    ) -> CoreResult<TranslationSettings> {
        let mut current = self.translation.lock().await;
        let mut updated = current.clone();
        f(&mut updated);

        set_json(self.store.as_ref(), TRANSLATION_KEY, &updated).await?;
        *current = updated.clone();
        self.translation_tx.send_replace(updated.clone());
        Ok(updated)
    }

    /// Show `model` to observers without persisting it
    pub fn show_selected_model(&self, model: CloudModel) {
        self.recognition_tx.send_modify(|config| config.selected_model = model);
    }

    /// Persist `model` as the selected model and publish it
    pub async fn commit_selected_model(&self, model: CloudModel) -> CoreResult<()> {
        let mut persisted = self.persisted.lock().await;
        let mut updated = persisted.clone();
        updated.selected_model = model;

        set_json(self.store.as_ref(), RECOGNITION_KEY, &updated).await?;
        *persisted = updated.clone();
        self.recognition_tx.send_replace(updated);
        debug!("Selected model persisted: {}", model);
        Ok(())
    }

    /// Put the last persisted model back in front of observers
    pub async fn rollback_selected_model(&self) -> CloudModel {
        let persisted = self.persisted.lock().await;
        let model = persisted.selected_model;
        self.recognition_tx
            .send_modify(|config| config.selected_model = model);
        warn!("Selected model rolled back to {}", model);
        model
    }

    pub async fn add_credential(&self, secret: &str, label: &str) -> CoreResult<CredentialId> {
        let _guard = self.credentials_lock.lock().await;
        let checkpoint = self.pool.checkpoint().await;
        let id = self.pool.add(secret, label).await?;
        self.save_or_restore(checkpoint).await?;
        Ok(id)
    }

    pub async fn remove_credential(&self, id: &CredentialId) -> CoreResult<bool> {
        let _guard = self.credentials_lock.lock().await;
        let checkpoint = self.pool.checkpoint().await;
        let removed = self.pool.remove(id).await;
        if removed {
            self.save_or_restore(checkpoint).await?;
        }
        Ok(removed)
    }

    pub async fn set_primary(&self, id: &CredentialId) -> CoreResult<bool> {
        let _guard = self.credentials_lock.lock().await;
        let checkpoint = self.pool.checkpoint().await;
        let moved = self.pool.set_primary(id).await?;
        if moved {
            self.save_or_restore(checkpoint).await?;
        }
        Ok(moved)
    }

    pub async fn activate(&self, id: &CredentialId) -> CoreResult<()> {
        let _guard = self.credentials_lock.lock().await;
        let checkpoint = self.pool.checkpoint().await;
        self.pool.activate(id).await?;
        self.save_or_restore(checkpoint).await
    }

    pub async fn deactivate(&self, id: &CredentialId) -> CoreResult<()> {
        let _guard = self.credentials_lock.lock().await;
        let checkpoint = self.pool.checkpoint().await;
        self.pool.deactivate(id).await?;
        self.save_or_restore(checkpoint).await
    }

    pub async fn reset_all_errors(&self) -> CoreResult<()> {
        let _guard = self.credentials_lock.lock().await;
        let checkpoint = self.pool.checkpoint().await;
        self.pool.reset_all_errors().await;
        self.save_or_restore(checkpoint).await
    }

    /// Probe a key without storing it
    pub async fn test_credential(
        &self,
        provider: &dyn CloudProvider,
        secret: &str,
    ) -> CoreResult<String> {
        self.pool.test(provider, secret).await
    }

    pub async fn persist_credentials(&self) -> CoreResult<()> {
        let _guard = self.credentials_lock.lock().await;
        self.write_credentials().await
    }

    /// Caller holds `credentials_lock`
    async fn write_credentials(&self) -> CoreResult<()> {
        let credentials = self.pool.credentials().await;
        set_json(self.store.as_ref(), CREDENTIALS_KEY, &credentials).await
    }

    /// Persist the pool, or put it back to `checkpoint` if the write fails.
    /// Caller holds `credentials_lock`.
    async fn save_or_restore(&self, checkpoint: PoolCheckpoint) -> CoreResult<()> {
        if let Err(e) = self.write_credentials().await {
            warn!("API key change not saved, reverting: {}", e);
            self.pool.restore(checkpoint).await;
            return Err(e);
        }
        Ok(())
    }

    pub fn publish_cache_stats(&self, cache: &TranslationCache) -> CacheStats {
        let stats = cache.stats();
        self.cache_stats_tx.send_replace(stats);
        stats
    }

    /// Persist the pool whenever it changes (error counts, deactivations)
    /// until `token` is cancelled
    pub fn spawn_credential_autosave(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let settings = Arc::clone(self);
        let mut changes = self.pool.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        changes.borrow_and_update();
                        if let Err(e) = settings.persist_credentials().await {
                            warn!("Failed to persist API keys: {}", e);
                        }
                    }
                }
            }
            debug!("Credential autosave stopped");
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::errors::CoreError;
    use crate::middleware::credential_pool::tests::key;
    use crate::services::storage::MemoryStore;
    use crate::utils::system_clock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Memory store whose writes can be switched to fail
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        inner: MemoryStore,
        pub(crate) fail_writes: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> CoreResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> CoreResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(CoreError::persistence(key, "disk full"));
            }
            self.inner.set(key, value).await
        }
    }

    pub(crate) async fn settings_on(store: Arc<dyn KeyValueStore>) -> SettingsStore {
        SettingsStore::load(store, PoolPolicy::default(), system_clock(), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_load_defaults_from_empty_store() {
        let settings = settings_on(Arc::new(MemoryStore::new())).await;
        assert_eq!(settings.recognition(), RecognitionConfiguration::default());
        assert_eq!(settings.translation(), TranslationSettings::default());
        assert!(settings.pool().is_empty().await);
    }

    #[tokio::test]
    async fn test_update_recognition_persists_and_publishes() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let settings = settings_on(Arc::clone(&store)).await;
        let mut rx = settings.subscribe_recognition();

        settings
            .update_recognition(|c| {
                c.cloud_enabled = true;
                c.cloud_threshold_percent = 55;
            })
            .await
            .unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().cloud_threshold_percent, 55);

        let reloaded = settings_on(store).await;
        assert!(reloaded.recognition().cloud_enabled);
        assert_eq!(reloaded.recognition().cloud_threshold_percent, 55);
    }

    #[tokio::test]
    async fn test_failed_write_publishes_nothing() {
        let store = Arc::new(FlakyStore::default());
        let settings = settings_on(store.clone()).await;
        let rx = settings.subscribe_recognition();
        store.fail_writes.store(true, Ordering::SeqCst);

        let err = settings
            .update_recognition(|c| c.always_cloud = true)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PersistenceFailure { .. }));
        assert!(!rx.has_changed().unwrap());
        assert!(!settings.recognition().always_cloud);
    }

    #[tokio::test]
    async fn test_load_replaces_invalid_stored_recognition() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let stored = RecognitionConfiguration {
            confidence_threshold: 1.5,
            ..RecognitionConfiguration::default()
        };
        set_json(store.as_ref(), RECOGNITION_KEY, &stored).await.unwrap();

        let settings = settings_on(store).await;
        assert_eq!(settings.recognition(), RecognitionConfiguration::default());
    }

    #[tokio::test]
    async fn test_invalid_update_is_rejected() {
        let settings = settings_on(Arc::new(MemoryStore::new())).await;
        let err = settings
            .update_recognition(|c| c.confidence_threshold = 1.5)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_show_then_rollback_model() {
        let settings = settings_on(Arc::new(MemoryStore::new())).await;
        settings.show_selected_model(CloudModel::Pro);
        assert_eq!(settings.recognition().selected_model, CloudModel::Pro);

        let restored = settings.rollback_selected_model().await;
        assert_eq!(restored, CloudModel::Balanced);
        assert_eq!(settings.recognition().selected_model, CloudModel::Balanced);
    }

    #[tokio::test]
    async fn test_credentials_survive_reload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let settings = settings_on(Arc::clone(&store)).await;

        let first = settings.add_credential(&key(1), "main").await.unwrap();
        let second = settings.add_credential(&key(2), "backup").await.unwrap();
        settings.activate(&second).await.unwrap();
        assert!(settings.set_primary(&second).await.unwrap());

        let reloaded = settings_on(store).await;
        let views = reloaded.pool().snapshot().await;
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].id, second);
        assert!(views[0].is_primary);
        assert_eq!(views[1].id, first);
    }

    async fn stored_credentials(store: &dyn KeyValueStore) -> Vec<Credential> {
        get_json::<Vec<Credential>>(store, CREDENTIALS_KEY)
            .await
            .unwrap()
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_failed_add_leaves_pool_unchanged() {
        let store = Arc::new(FlakyStore::default());
        let settings = settings_on(store.clone()).await;
        store.fail_writes.store(true, Ordering::SeqCst);

        let err = settings.add_credential(&key(1), "main").await.unwrap_err();
        assert!(matches!(err, CoreError::PersistenceFailure { .. }));
        assert!(settings.pool().is_empty().await);
        assert!(settings.pool().select_for_use().await.is_none());

        store.fail_writes.store(false, Ordering::SeqCst);
        settings.add_credential(&key(1), "main").await.unwrap();
        assert_eq!(stored_credentials(store.as_ref()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_remove_puts_key_back_in_place() {
        let store = Arc::new(FlakyStore::default());
        let settings = settings_on(store.clone()).await;
        let first = settings.add_credential(&key(1), "main").await.unwrap();
        let second = settings.add_credential(&key(2), "backup").await.unwrap();
        store.fail_writes.store(true, Ordering::SeqCst);

        assert!(settings.remove_credential(&first).await.is_err());

        let views = settings.pool().snapshot().await;
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].id, first);
        assert!(views[0].is_primary);
        assert_eq!(views[1].id, second);
    }

    #[tokio::test]
    async fn test_failed_set_primary_keeps_order() {
        let store = Arc::new(FlakyStore::default());
        let settings = settings_on(store.clone()).await;
        let first = settings.add_credential(&key(1), "main").await.unwrap();
        let second = settings.add_credential(&key(2), "backup").await.unwrap();
        settings.activate(&second).await.unwrap();
        store.fail_writes.store(true, Ordering::SeqCst);

        assert!(settings.set_primary(&second).await.is_err());
        assert_eq!(settings.pool().select_for_use().await.unwrap().id, first);
    }

    #[tokio::test]
    async fn test_failed_activation_changes_keep_flags() {
        let store = Arc::new(FlakyStore::default());
        let settings = settings_on(store.clone()).await;
        let first = settings.add_credential(&key(1), "main").await.unwrap();
        let second = settings.add_credential(&key(2), "backup").await.unwrap();
        store.fail_writes.store(true, Ordering::SeqCst);

        assert!(settings.activate(&second).await.is_err());
        assert!(settings.deactivate(&first).await.is_err());

        let views = settings.pool().snapshot().await;
        assert!(views[0].is_active);
        assert!(!views[1].is_active);
    }

    #[tokio::test]
    async fn test_failed_reset_keeps_errors() {
        let store = Arc::new(FlakyStore::default());
        let settings = settings_on(store.clone()).await;
        let id = settings.add_credential(&key(1), "main").await.unwrap();
        for _ in 0..3 {
            settings.pool().record_failure(&id).await;
        }
        store.fail_writes.store(true, Ordering::SeqCst);

        assert!(settings.reset_all_errors().await.is_err());

        let views = settings.pool().snapshot().await;
        assert_eq!(views[0].error_count, 3);
        assert!(!views[0].is_active);
    }

    #[tokio::test]
    async fn test_user_deactivated_key_stays_off_after_reload_and_reset() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let settings = settings_on(Arc::clone(&store)).await;
        let id = settings.add_credential(&key(1), "main").await.unwrap();
        for _ in 0..3 {
            settings.pool().record_failure(&id).await;
        }
        settings.activate(&id).await.unwrap();
        settings.deactivate(&id).await.unwrap();

        let reloaded = settings_on(store).await;
        reloaded.reset_all_errors().await.unwrap();
        assert_eq!(reloaded.pool().active_count().await, 0);
    }

    #[tokio::test]
    async fn test_unreadable_credentials_fail_load() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store
            .set(CREDENTIALS_KEY, "[{\"truncated\"".to_string())
            .await
            .unwrap();

        let loaded =
            SettingsStore::load(Arc::clone(&store), PoolPolicy::default(), system_clock(), None)
                .await;
        assert!(matches!(loaded, Err(CoreError::PersistenceFailure { .. })));
        assert!(store.get(CREDENTIALS_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_autosave_persists_error_counts() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let settings = Arc::new(settings_on(Arc::clone(&store)).await);
        let id = settings.add_credential(&key(1), "main").await.unwrap();

        let token = CancellationToken::new();
        let autosave = settings.spawn_credential_autosave(token.clone());

        settings.pool().record_failure(&id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stored = stored_credentials(store.as_ref()).await;
        assert_eq!(stored[0].error_count, 1);

        token.cancel();
        autosave.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_cache_stats() {
        let settings = settings_on(Arc::new(MemoryStore::new())).await;
        let cache = TranslationCache::new(30, system_clock(), None);
        cache.store("hola", "es", "en", CloudModel::Fast, "hello");

        let stats = settings.publish_cache_stats(&cache);
        assert_eq!(stats.total_entries, 1);
        assert_eq!(settings.subscribe_cache_stats().borrow().total_entries, 1);
    }
}
