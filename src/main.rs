// Main entry point: settings, credential and translation service over HTTP

use docscan_ai::{
    core::{types::*, Config, CoreError, ErrorClass},
    middleware::{CredentialView, PoolPolicy},
    orchestration::{ModelSelectionDebouncer, SettingsStore, SwitchOutcome},
    services::{
        translation::{CacheStats, TranslationOutcome, TranslationRequest},
        GeminiClient, JsonFileStore, KeyValueStore, TranslationCache, TranslationService,
    },
    utils::{system_clock, Metrics},
};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    settings: Arc<SettingsStore>,
    translation: Arc<TranslationService>,
    debouncer: Arc<ModelSelectionDebouncer>,
    gemini: Arc<GeminiClient>,
    metrics: Metrics,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "docscan_ai={},tower_http=warn",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== DOCSCAN AI SERVICE ===");
    info!(
        "Config: pool={} keys, failure threshold={}, debounce={}ms, cache TTL={}d",
        config.pool.capacity,
        config.pool.failure_threshold,
        config.debounce.quiet_period.as_millis(),
        config.cache.default_ttl_days
    );

    let metrics = Metrics::new();
    let clock = system_clock();
    let shutdown = CancellationToken::new();

    // Settings and credentials
    let store: Arc<dyn KeyValueStore> =
        Arc::new(JsonFileStore::open(&config.storage.settings_file).await?);
    let settings = Arc::new(
        SettingsStore::load(
            store,
            PoolPolicy::from(&config.pool),
            clock.clone(),
            Some(metrics.clone()),
        )
        .await?,
    );

    if settings.pool().is_empty().await {
        for (i, secret) in config.api.seed_api_keys.iter().enumerate() {
            let label = format!("env #{}", i + 1);
            if let Err(e) = settings.add_credential(secret, &label).await {
                warn!("Skipping API key {} from environment: {}", label, e);
            }
        }
    }
    info!(
        "✓ {} API key(s), {} active",
        settings.pool().len().await,
        settings.pool().active_count().await
    );
    let autosave = settings.spawn_credential_autosave(shutdown.clone());

    // Translation
    let translation_settings = settings.translation();
    let cache = TranslationCache::persistent(
        &config.cache.cache_dir,
        translation_settings.cache_ttl_days,
        clock.clone(),
        Some(metrics.clone()),
    )
    .await?;
    let purged = cache.purge_expired();
    if purged > 0 {
        info!("Purged {} expired translations", purged);
    }
    let cache_saver = cache.start_persistence_task(config.cache.save_interval, shutdown.clone());
    spawn_cache_stats_relay(Arc::clone(&settings), cache.clone(), shutdown.clone());

    let gemini = Arc::new(GeminiClient::new(&config.api)?);
    let translation = Arc::new(TranslationService::new(
        cache,
        gemini.clone(),
        Arc::clone(settings.pool()),
        Some(metrics.clone()),
    ));
    translation.set_cache_enabled(translation_settings.cache_enabled);

    // The recognition controller lives with the on-device engine in the app
    let debouncer = Arc::new(ModelSelectionDebouncer::new(
        Arc::clone(&settings),
        None,
        config.debounce.quiet_period,
        clock,
        Some(metrics.clone()),
    ));

    let state = AppState {
        settings,
        translation,
        debouncer,
        gemini,
        metrics,
    };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/health/api-keys", get(health_api_keys))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/settings", get(get_settings))
        .route("/settings/recognition", put(put_recognition))
        .route("/settings/translation", put(put_translation))
        .route("/settings/model", post(switch_model))
        .route("/credentials", get(list_credentials).post(add_credential))
        .route("/credentials/test", post(test_credential))
        .route("/credentials/reset", post(reset_credentials))
        .route("/credentials/:id", delete(remove_credential))
        .route("/credentials/:id/primary", post(set_primary))
        .route("/credentials/:id/activate", post(activate_credential))
        .route("/credentials/:id/deactivate", post(deactivate_credential))
        .route("/translate", post(translate))
        .route("/translate/test", post(translate_test))
        .route("/translate/test/cancel", post(cancel_translate_test))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(clear_cache))
        .route("/cache/purge", post(purge_cache))
        .with_state(state)
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /health            - Health check");
    info!("  GET  /health/api-keys   - API key health status");
    info!("  GET  /metrics           - Prometheus metrics");
    info!("  GET  /settings          - Current settings");
    info!("  POST /settings/model    - Debounced model switch");
    info!("  *    /credentials/...   - API key management");
    info!("  POST /translate         - Cached translation");
    info!("  *    /cache/...         - Translation cache");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(handle) = cache_saver {
        let _ = handle.await;
    }
    let _ = autosave.await;

    Ok(())
}

/// Keep the settings store's cache statistics in step with the cache
fn spawn_cache_stats_relay(
    settings: Arc<SettingsStore>,
    cache: TranslationCache,
    shutdown: CancellationToken,
) {
    let mut changes = cache.subscribe_stats();
    settings.publish_cache_stats(&cache);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    settings.publish_cache_stats(&cache);
                }
            }
        }
    });
}

fn api_error(e: CoreError) -> (StatusCode, String) {
    let status = match (&e, e.class()) {
        (CoreError::NotFound { .. }, _) => StatusCode::NOT_FOUND,
        (CoreError::PersistenceFailure { .. }, _) => StatusCode::INTERNAL_SERVER_ERROR,
        (_, ErrorClass::Configuration) => StatusCode::BAD_REQUEST,
        (_, ErrorClass::Transient) => StatusCode::BAD_GATEWAY,
        (_, ErrorClass::Silent) => StatusCode::CONFLICT,
    };
    if status.is_server_error() {
        error!("Request failed: {}", e);
    }
    let message = e.user_message().unwrap_or_else(|| e.to_string());
    (status, message)
}

async fn root() -> &'static str {
    "DocScan AI - recognition and translation service"
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API key health status endpoint
async fn health_api_keys(State(state): State<AppState>) -> Json<serde_json::Value> {
    let views = state.settings.pool().snapshot().await;
    let count = |h: docscan_ai::KeyHealth| views.iter().filter(|v| v.health == h).count();
    let active = views.iter().filter(|v| v.is_active).count();

    Json(serde_json::json!({
        "status": if active > 0 { "healthy" } else { "degraded" },
        "total_keys": views.len(),
        "active_keys": active,
        "healthy_keys": count(docscan_ai::KeyHealth::Healthy),
        "degraded_keys": count(docscan_ai::KeyHealth::Degraded),
        "unhealthy_keys": count(docscan_ai::KeyHealth::Unhealthy),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    serde_json::to_value(state.metrics.snapshot())
        .map(Json)
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialize metrics: {}", e),
            )
        })
}

async fn get_settings(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "recognition": state.settings.recognition(),
        "translation": state.settings.translation(),
        "pending_model": state.debouncer.pending().map(|i| i.requested_model),
    }))
}

async fn put_recognition(
    State(state): State<AppState>,
    Json(body): Json<RecognitionConfiguration>,
) -> ApiResult<RecognitionConfiguration> {
    state
        .settings
        .update_recognition(|config| *config = body)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn put_translation(
    State(state): State<AppState>,
    Json(body): Json<TranslationSettings>,
) -> ApiResult<TranslationSettings> {
    let updated = state
        .settings
        .update_translation(|settings| *settings = body)
        .await
        .map_err(api_error)?;

    state.translation.set_cache_enabled(updated.cache_enabled);
    state.translation.cache().set_ttl_days(updated.cache_ttl_days);
    Ok(Json(updated))
}

#[derive(Deserialize)]
struct ModelSwitchBody {
    model: CloudModel,
}

async fn switch_model(
    State(state): State<AppState>,
    Json(body): Json<ModelSwitchBody>,
) -> ApiResult<serde_json::Value> {
    let outcome = state
        .debouncer
        .request_switch(body.model)
        .await
        .map_err(api_error)?;

    Ok(Json(match outcome {
        SwitchOutcome::Committed(model) => {
            serde_json::json!({ "outcome": "committed", "model": model })
        }
        SwitchOutcome::Superseded => serde_json::json!({ "outcome": "superseded" }),
    }))
}

async fn list_credentials(State(state): State<AppState>) -> Json<Vec<CredentialView>> {
    Json(state.settings.pool().snapshot().await)
}

#[derive(Deserialize)]
struct AddCredentialBody {
    secret: String,
    #[serde(default)]
    label: String,
}

async fn add_credential(
    State(state): State<AppState>,
    Json(body): Json<AddCredentialBody>,
) -> ApiResult<serde_json::Value> {
    let id = state
        .settings
        .add_credential(&body.secret, &body.label)
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "id": id })))
}

#[derive(Deserialize)]
struct TestCredentialBody {
    secret: String,
}

async fn test_credential(
    State(state): State<AppState>,
    Json(body): Json<TestCredentialBody>,
) -> ApiResult<serde_json::Value> {
    let reply = state
        .settings
        .test_credential(state.gemini.as_ref(), &body.secret)
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "valid": true, "reply": reply })))
}

async fn reset_credentials(State(state): State<AppState>) -> ApiResult<Vec<CredentialView>> {
    state.settings.reset_all_errors().await.map_err(api_error)?;
    Ok(Json(state.settings.pool().snapshot().await))
}

async fn remove_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let removed = state
        .settings
        .remove_credential(&CredentialId::from(id.as_str()))
        .await
        .map_err(api_error)?;
    if !removed {
        return Err(api_error(CoreError::not_found("credential", id)));
    }
    Ok(Json(serde_json::json!({ "removed": true })))
}

async fn set_primary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let moved = state
        .settings
        .set_primary(&CredentialId::from(id.as_str()))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "primary": moved })))
}

async fn activate_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<CredentialView>> {
    state
        .settings
        .activate(&CredentialId::from(id.as_str()))
        .await
        .map_err(api_error)?;
    Ok(Json(state.settings.pool().snapshot().await))
}

async fn deactivate_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<CredentialView>> {
    state
        .settings
        .deactivate(&CredentialId::from(id.as_str()))
        .await
        .map_err(api_error)?;
    Ok(Json(state.settings.pool().snapshot().await))
}

async fn translate(
    State(state): State<AppState>,
    Json(request): Json<TranslationRequest>,
) -> ApiResult<TranslationOutcome> {
    state
        .translation
        .translate(&request)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn translate_test(
    State(state): State<AppState>,
    Json(request): Json<TranslationRequest>,
) -> ApiResult<TranslationOutcome> {
    state
        .translation
        .run_test(&request)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn cancel_translate_test(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "cancelled": state.translation.cancel_test() }))
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.translation.cache().stats())
}

async fn clear_cache(State(state): State<AppState>) -> Json<serde_json::Value> {
    let removed = state.translation.cache().clear_all();
    Json(serde_json::json!({ "removed": removed }))
}

#[derive(Deserialize)]
struct PurgeBody {
    /// Defaults to the configured TTL
    days: Option<u32>,
}

async fn purge_cache(
    State(state): State<AppState>,
    Json(body): Json<PurgeBody>,
) -> Json<serde_json::Value> {
    let cache = state.translation.cache();
    let removed = match body.days {
        Some(days) => cache.purge_older_than(days),
        None => cache.purge_expired(),
    };
    Json(serde_json::json!({ "removed": removed }))
}
