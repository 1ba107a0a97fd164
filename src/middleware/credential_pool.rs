// Credential pool with health tracking and failover
//
// Keeps the user's API keys in priority order. The first active key is the
// primary; keys that keep failing drop out of the rotation until the errors
// are reset.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::core::config::PoolConfig;
use crate::core::errors::{CoreError, CoreResult};
use crate::core::types::{mask_secret, Credential, CredentialId};
use crate::services::providers::CloudProvider;
use crate::utils::{system_clock, Clock, Metrics};

static GEMINI_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^AIza[0-9A-Za-z_\-]{35}$").expect("static regex"));

/// Accepted shape of a provider key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    Gemini,
    /// Anything printable without whitespace of at least this length
    Opaque { min_len: usize },
}

impl KeyFormat {
    pub fn matches(self, secret: &str) -> bool {
        match self {
            KeyFormat::Gemini => GEMINI_KEY.is_match(secret),
            KeyFormat::Opaque { min_len } => {
                secret.len() >= min_len && !secret.chars().any(|c| c.is_whitespace())
            }
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            KeyFormat::Gemini => "AIza followed by 35 characters",
            KeyFormat::Opaque { .. } => "non-empty key without spaces",
        }
    }
}

/// Health of a credential as seen by the rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyHealth {
    Healthy,
    /// Has errors but is still below the deactivation threshold
    Degraded,
    /// Out of the rotation because of errors
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct PoolPolicy {
    pub capacity: usize,
    pub failure_threshold: u32,
    pub key_format: KeyFormat,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            capacity: 5,
            failure_threshold: 3,
            key_format: KeyFormat::Gemini,
        }
    }
}

impl From<&PoolConfig> for PoolPolicy {
    fn from(config: &PoolConfig) -> Self {
        Self {
            capacity: config.capacity,
            failure_threshold: config.failure_threshold,
            key_format: KeyFormat::Gemini,
        }
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    credential: Credential,
    last_used: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    total_requests: u64,
    total_failures: u64,
}

impl PoolEntry {
    fn new(credential: Credential) -> Self {
        Self {
            credential,
            last_used: None,
            last_failure: None,
            total_requests: 0,
            total_failures: 0,
        }
    }

    fn health(&self) -> KeyHealth {
        if self.credential.deactivated_by_errors {
            KeyHealth::Unhealthy
        } else if self.credential.error_count > 0 {
            KeyHealth::Degraded
        } else {
            KeyHealth::Healthy
        }
    }
}

/// Saved pool state, see `CredentialPool::checkpoint`
#[derive(Debug, Clone)]
pub struct PoolCheckpoint(Vec<PoolEntry>);

/// Read-only view of one credential, secret masked
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialView {
    pub id: CredentialId,
    pub label: String,
    pub masked_secret: String,
    pub is_active: bool,
    pub is_primary: bool,
    pub error_count: u32,
    pub health: KeyHealth,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub total_failures: u64,
}

/// Credential pool with serialized read-modify-write access
pub struct CredentialPool {
    entries: RwLock<Vec<PoolEntry>>,
    policy: PoolPolicy,
    clock: Arc<dyn Clock>,
    snapshot_tx: watch::Sender<Vec<CredentialView>>,
    metrics: Option<Metrics>,
}

impl CredentialPool {
    pub fn new(policy: PoolPolicy) -> Self {
        Self::from_credentials(policy, Vec::new(), system_clock())
    }

    /// Rebuild a pool from persisted credentials, keeping their order
    pub fn from_credentials(
        policy: PoolPolicy,
        credentials: Vec<Credential>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // Keys beyond a since-lowered capacity stay; `add` refuses new ones
        if credentials.len() > policy.capacity {
            warn!(
                "{} stored API keys exceed the pool capacity of {}; keeping all of them",
                credentials.len(),
                policy.capacity
            );
        }
        let entries: Vec<PoolEntry> = credentials.into_iter().map(PoolEntry::new).collect();
        let (snapshot_tx, _) = watch::channel(views(&entries));

        Self {
            entries: RwLock::new(entries),
            policy,
            clock,
            snapshot_tx,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// Add a key. The very first key is active; later ones start inactive.
    pub async fn add(&self, secret: &str, label: &str) -> CoreResult<CredentialId> {
        let secret = secret.trim();
        if !self.policy.key_format.matches(secret) {
            return Err(CoreError::InvalidFormat {
                expected: self.policy.key_format.description(),
            });
        }

        let mut entries = self.entries.write().await;

        if entries.iter().any(|e| e.credential.secret == secret) {
            return Err(CoreError::Duplicate);
        }

        if entries.len() >= self.policy.capacity {
            return Err(CoreError::CapacityExceeded {
                capacity: self.policy.capacity,
            });
        }

        let id = CredentialId::generate();
        let credential = Credential {
            id: id.clone(),
            secret: secret.to_string(),
            label: label.trim().to_string(),
            is_active: entries.is_empty(),
            error_count: 0,
            created_at: self.clock.now(),
            deactivated_by_errors: false,
        };
        info!(
            "Added API key {} ({}), active={}",
            credential.masked_secret(),
            id,
            credential.is_active
        );
        entries.push(PoolEntry::new(credential));
        self.publish(&entries);

        Ok(id)
    }

    /// Move `id` to the front. Returns false (and changes nothing) when the
    /// credential is inactive.
    pub async fn set_primary(&self, id: &CredentialId) -> CoreResult<bool> {
        let mut entries = self.entries.write().await;
        let position = entries
            .iter()
            .position(|e| &e.credential.id == id)
            .ok_or_else(|| CoreError::not_found("credential", id.as_str()))?;

        if !entries[position].credential.is_active {
            debug!("Ignoring set_primary for inactive credential {}", id);
            return Ok(false);
        }

        let entry = entries.remove(position);
        entries.insert(0, entry);
        self.publish(&entries);
        Ok(true)
    }

    pub async fn activate(&self, id: &CredentialId) -> CoreResult<()> {
        self.set_active(id, true).await
    }

    pub async fn deactivate(&self, id: &CredentialId) -> CoreResult<()> {
        self.set_active(id, false).await
    }

    async fn set_active(&self, id: &CredentialId, active: bool) -> CoreResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| &e.credential.id == id)
            .ok_or_else(|| CoreError::not_found("credential", id.as_str()))?;

        entry.credential.is_active = active;
        // Either way the user decided; the error marker no longer applies
        entry.credential.deactivated_by_errors = false;
        self.publish(&entries);
        Ok(())
    }

    pub async fn remove(&self, id: &CredentialId) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| &e.credential.id != id);
        let removed = entries.len() != before;
        if removed {
            info!("Removed API key {}", id);
            self.publish(&entries);
        }
        removed
    }

    /// Count a failed call. Returns true when this failure took the key out
    /// of the rotation.
    pub async fn record_failure(&self, id: &CredentialId) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.iter_mut().find(|e| &e.credential.id == id) else {
            debug!("record_failure for unknown credential {}", id);
            return false;
        };

        let now = self.clock.now();
        entry.credential.error_count = entry.credential.error_count.saturating_add(1);
        entry.last_failure = Some(now);
        entry.last_used = Some(now);
        entry.total_requests += 1;
        entry.total_failures += 1;

        let deactivated = entry.credential.is_active
            && entry.credential.error_count >= self.policy.failure_threshold;
        if deactivated {
            entry.credential.is_active = false;
            entry.credential.deactivated_by_errors = true;
            warn!(
                "API key {} removed from rotation ({} errors, {:.1}% failure rate)",
                entry.credential.masked_secret(),
                entry.credential.error_count,
                entry.total_failures as f64 / entry.total_requests as f64 * 100.0
            );
            if let Some(ref m) = self.metrics {
                m.record_credential_deactivated();
            }
        }

        self.publish(&entries);
        deactivated
    }

    /// Count a successful call. Error counts only go down through a reset.
    pub async fn record_success(&self, id: &CredentialId) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| &e.credential.id == id) {
            entry.last_used = Some(self.clock.now());
            entry.total_requests += 1;
            self.publish(&entries);
        }
    }

    /// Zero every error count and bring back keys the errors deactivated
    pub async fn reset_all_errors(&self) {
        let mut entries = self.entries.write().await;
        let mut reactivated = 0;
        for entry in entries.iter_mut() {
            entry.credential.error_count = 0;
            entry.last_failure = None;
            if entry.credential.deactivated_by_errors {
                entry.credential.is_active = true;
                entry.credential.deactivated_by_errors = false;
                reactivated += 1;
            }
        }
        info!("All API key errors reset ({} reactivated)", reactivated);
        self.publish(&entries);
    }

    /// First active credential in priority order
    pub async fn select_for_use(&self) -> Option<Credential> {
        self.next_viable(&[]).await
    }

    /// First active credential not already tried
    pub async fn next_viable(&self, excluding: &[CredentialId]) -> Option<Credential> {
        let entries = self.entries.read().await;
        let selected = entries
            .iter()
            .find(|e| e.credential.is_active && !excluding.contains(&e.credential.id))
            .map(|e| e.credential.clone());

        match selected {
            Some(ref c) => debug!("Using API key {} ({})", c.masked_secret(), c.id),
            None => warn!("No active API key available"),
        }
        selected
    }

    /// Validate a key against the provider without touching the pool
    pub async fn test(&self, provider: &dyn CloudProvider, secret: &str) -> CoreResult<String> {
        let secret = secret.trim();
        if !self.policy.key_format.matches(secret) {
            return Err(CoreError::InvalidFormat {
                expected: self.policy.key_format.description(),
            });
        }
        debug!("Probing API key {}", mask_secret(secret));
        provider.probe(secret).await
    }

    /// Credentials in priority order, secrets included, for persistence
    pub async fn credentials(&self) -> Vec<Credential> {
        let entries = self.entries.read().await;
        entries.iter().map(|e| e.credential.clone()).collect()
    }

    /// Copy of the whole pool, runtime stats included, for `restore`
    pub async fn checkpoint(&self) -> PoolCheckpoint {
        PoolCheckpoint(self.entries.read().await.clone())
    }

    /// Put the pool back to `checkpoint` and publish it
    pub async fn restore(&self, checkpoint: PoolCheckpoint) {
        let mut entries = self.entries.write().await;
        *entries = checkpoint.0;
        debug!("Credential pool restored ({} keys)", entries.len());
        self.publish(&entries);
    }

    pub async fn snapshot(&self) -> Vec<CredentialView> {
        let entries = self.entries.read().await;
        views(&entries)
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<CredentialView>> {
        self.snapshot_tx.subscribe()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn active_count(&self) -> usize {
        let entries = self.entries.read().await;
        entries.iter().filter(|e| e.credential.is_active).count()
    }

    fn publish(&self, entries: &[PoolEntry]) {
        self.snapshot_tx.send_replace(views(entries));
    }
}

fn views(entries: &[PoolEntry]) -> Vec<CredentialView> {
    let primary = entries
        .iter()
        .find(|e| e.credential.is_active)
        .map(|e| e.credential.id.clone());

    entries
        .iter()
        .map(|e| CredentialView {
            id: e.credential.id.clone(),
            label: e.credential.label.clone(),
            masked_secret: e.credential.masked_secret(),
            is_active: e.credential.is_active,
            is_primary: primary.as_ref() == Some(&e.credential.id),
            error_count: e.credential.error_count,
            health: e.health(),
            created_at: e.credential.created_at,
            last_used: e.last_used,
            last_failure: e.last_failure,
            total_requests: e.total_requests,
            total_failures: e.total_failures,
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    use crate::core::types::CloudModel;
    use crate::services::providers::CloudRequest;

    pub(crate) fn key(n: usize) -> String {
        format!("AIza{}{:03}", "x".repeat(32), n)
    }

    fn pool() -> CredentialPool {
        CredentialPool::new(PoolPolicy::default())
    }

    struct ProbeOk;

    #[async_trait]
    impl CloudProvider for ProbeOk {
        async fn generate_text(
            &self,
            _credential: &Credential,
            _request: &CloudRequest,
            _model: CloudModel,
            _fallback_models: &[CloudModel],
        ) -> CoreResult<String> {
            Ok(String::new())
        }

        async fn probe(&self, _secret: &str) -> CoreResult<String> {
            Ok("OK".to_string())
        }
    }

    #[test]
    fn test_gemini_key_format() {
        assert!(KeyFormat::Gemini.matches(&key(1)));
        assert!(!KeyFormat::Gemini.matches("AIza-too-short"));
        assert!(!KeyFormat::Gemini.matches(&format!("sk-{}", "x".repeat(36))));
        assert!(KeyFormat::Opaque { min_len: 8 }.matches("abcdefgh"));
        assert!(!KeyFormat::Opaque { min_len: 8 }.matches("abcd efgh"));
    }

    #[tokio::test]
    async fn test_first_key_is_active_and_primary() {
        let pool = pool();
        let first = pool.add(&key(1), "main").await.unwrap();
        let second = pool.add(&key(2), "backup").await.unwrap();

        let snapshot = pool.snapshot().await;
        assert!(snapshot[0].is_active && snapshot[0].is_primary);
        assert!(!snapshot[1].is_active && !snapshot[1].is_primary);
        assert_eq!(pool.select_for_use().await.unwrap().id, first);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_add_rejects_bad_format_duplicates_and_overflow() {
        let pool = pool();
        assert!(matches!(
            pool.add("not-a-key", "x").await,
            Err(CoreError::InvalidFormat { .. })
        ));

        pool.add(&key(1), "a").await.unwrap();
        assert!(matches!(
            pool.add(&key(1), "again").await,
            Err(CoreError::Duplicate)
        ));

        for n in 2..=5 {
            pool.add(&key(n), "more").await.unwrap();
        }
        assert!(matches!(
            pool.add(&key(6), "one too many").await,
            Err(CoreError::CapacityExceeded { capacity: 5 })
        ));
        assert_eq!(pool.len().await, 5);
    }

    #[tokio::test]
    async fn test_failover_after_threshold() {
        let pool = pool();
        let a = pool.add(&key(1), "a").await.unwrap();
        let b = pool.add(&key(2), "b").await.unwrap();
        pool.activate(&b).await.unwrap();

        assert_eq!(pool.select_for_use().await.unwrap().id, a);

        assert!(!pool.record_failure(&a).await);
        assert!(!pool.record_failure(&a).await);
        assert!(pool.record_failure(&a).await);

        assert_eq!(pool.select_for_use().await.unwrap().id, b);

        // Deactivated, not deleted
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].health, KeyHealth::Unhealthy);
        assert_eq!(snapshot[0].error_count, 3);
        assert!(snapshot[1].is_primary);
    }

    #[tokio::test]
    async fn test_reset_reactivates_only_error_deactivated_keys() {
        let pool = pool();
        let a = pool.add(&key(1), "a").await.unwrap();
        let b = pool.add(&key(2), "b").await.unwrap();

        for _ in 0..3 {
            pool.record_failure(&a).await;
        }
        assert!(pool.select_for_use().await.is_none());

        pool.reset_all_errors().await;

        let snapshot = pool.snapshot().await;
        assert!(snapshot[0].is_active);
        assert_eq!(snapshot[0].error_count, 0);
        // b was never activated by the user and stays off
        assert!(!snapshot[1].is_active);
        assert_eq!(snapshot[1].id, b);
        assert_eq!(pool.select_for_use().await.unwrap().id, a);
    }

    #[tokio::test]
    async fn test_user_deactivation_survives_reload_and_reset() {
        let pool = pool();
        let a = pool.add(&key(1), "a").await.unwrap();
        for _ in 0..3 {
            pool.record_failure(&a).await;
        }
        pool.activate(&a).await.unwrap();
        pool.deactivate(&a).await.unwrap();

        let reloaded = CredentialPool::from_credentials(
            PoolPolicy::default(),
            pool.credentials().await,
            system_clock(),
        );
        assert_eq!(reloaded.snapshot().await[0].error_count, 3);
        reloaded.reset_all_errors().await;
        assert_eq!(reloaded.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_error_deactivation_survives_reload() {
        let pool = pool();
        let a = pool.add(&key(1), "a").await.unwrap();
        for _ in 0..3 {
            pool.record_failure(&a).await;
        }

        let reloaded = CredentialPool::from_credentials(
            PoolPolicy::default(),
            pool.credentials().await,
            system_clock(),
        );
        assert_eq!(reloaded.snapshot().await[0].health, KeyHealth::Unhealthy);
        reloaded.reset_all_errors().await;
        assert_eq!(reloaded.select_for_use().await.unwrap().id, a);
    }

    #[tokio::test]
    async fn test_reload_keeps_keys_beyond_lowered_capacity() {
        let pool = pool();
        for n in 1..=4 {
            pool.add(&key(n), "k").await.unwrap();
        }

        let policy = PoolPolicy {
            capacity: 2,
            ..PoolPolicy::default()
        };
        let reloaded =
            CredentialPool::from_credentials(policy, pool.credentials().await, system_clock());
        assert_eq!(reloaded.len().await, 4);
        assert!(matches!(
            reloaded.add(&key(5), "new").await,
            Err(CoreError::CapacityExceeded { capacity: 2 })
        ));
    }

    #[tokio::test]
    async fn test_restore_undoes_changes() {
        let pool = pool();
        let a = pool.add(&key(1), "a").await.unwrap();
        let b = pool.add(&key(2), "b").await.unwrap();
        let checkpoint = pool.checkpoint().await;

        pool.remove(&a).await;
        pool.activate(&b).await.unwrap();
        pool.restore(checkpoint).await;

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, a);
        assert!(snapshot[0].is_primary);
        assert!(!snapshot[1].is_active);
    }

    #[tokio::test]
    async fn test_set_primary_reorders_and_ignores_inactive() {
        let pool = pool();
        let a = pool.add(&key(1), "a").await.unwrap();
        let b = pool.add(&key(2), "b").await.unwrap();

        assert!(!pool.set_primary(&b).await.unwrap());
        assert_eq!(pool.select_for_use().await.unwrap().id, a);

        pool.activate(&b).await.unwrap();
        assert!(pool.set_primary(&b).await.unwrap());
        assert_eq!(pool.select_for_use().await.unwrap().id, b);

        let missing = CredentialId::from("missing");
        assert!(matches!(
            pool.set_primary(&missing).await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove() {
        let pool = pool();
        let a = pool.add(&key(1), "a").await.unwrap();
        assert!(pool.remove(&a).await);
        assert!(!pool.remove(&a).await);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_success_never_lowers_error_count() {
        let pool = pool();
        let a = pool.add(&key(1), "a").await.unwrap();
        pool.record_failure(&a).await;
        pool.record_success(&a).await;

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot[0].error_count, 1);
        assert_eq!(snapshot[0].health, KeyHealth::Degraded);
        assert_eq!(snapshot[0].total_requests, 2);
    }

    #[tokio::test]
    async fn test_probe_does_not_touch_pool() {
        let pool = pool();
        assert_eq!(pool.test(&ProbeOk, &key(7)).await.unwrap(), "OK");
        assert!(pool.is_empty().await);
        assert!(matches!(
            pool.test(&ProbeOk, "bogus").await,
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot_is_published() {
        let pool = pool();
        let mut rx = pool.subscribe();
        pool.add(&key(1), "a").await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);
    }

    #[tokio::test]
    async fn test_pool_invariants_hold_under_random_operations() {
        let pool = pool();
        let mut rng = StdRng::seed_from_u64(7);
        let mut ids: Vec<CredentialId> = Vec::new();

        for _ in 0..500 {
            match rng.gen_range(0..6) {
                0 | 1 => {
                    if let Ok(id) = pool.add(&key(rng.gen_range(0..8)), "k").await {
                        ids.push(id);
                    }
                }
                2 if !ids.is_empty() => {
                    let id = ids.remove(rng.gen_range(0..ids.len()));
                    pool.remove(&id).await;
                }
                3 if !ids.is_empty() => {
                    let id = &ids[rng.gen_range(0..ids.len())];
                    pool.record_failure(id).await;
                }
                4 if !ids.is_empty() => {
                    let id = &ids[rng.gen_range(0..ids.len())];
                    pool.activate(id).await.unwrap();
                }
                _ => pool.reset_all_errors().await,
            }

            let credentials = pool.credentials().await;
            let secrets: HashSet<_> = credentials.iter().map(|c| c.secret.clone()).collect();
            assert_eq!(secrets.len(), credentials.len());
            assert!(credentials.len() <= 5);

            if let Some(selected) = pool.select_for_use().await {
                assert!(selected.is_active);
            }
        }
    }
}
