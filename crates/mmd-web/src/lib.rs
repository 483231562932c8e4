//! Read-only JSON query surface over the metric catalog.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use mmd_core::{ConversionGroup, IntegrityIssue, IssueType, Metric, Synonym};
use mmd_pipeline::{flatten, EngineConfig, IntegrityChecker, SynonymResolver};
use mmd_storage::CatalogStore;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "mmd-web";

#[derive(Clone)]
pub struct AppState {
    pub store: CatalogStore,
    pub auto_map_threshold: f64,
}

impl AppState {
    pub fn new(store: CatalogStore) -> Self {
        Self {
            store,
            auto_map_threshold: mmd_pipeline::AUTO_MAP_THRESHOLD,
        }
    }

    pub fn with_auto_map_threshold(mut self, threshold: f64) -> Self {
        self.auto_map_threshold = threshold;
        self
    }
}

#[derive(Debug, Serialize)]
struct MetricDetail {
    metric: Metric,
    synonyms: Vec<Synonym>,
    conversion_groups: Vec<ConversionGroup>,
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct IntegrityQuery {
    #[serde(default)]
    require_system: bool,
}

#[derive(Debug, Serialize)]
struct IntegrityBody<'a> {
    issue_count: usize,
    issues_by_type: BTreeMap<IssueType, Vec<&'a IntegrityIssue>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/metrics/{id}", get(metric_detail_handler))
        .route("/synonyms", get(synonyms_handler))
        .route("/synonyms/resolve", get(resolve_handler))
        .route("/integrity", get(integrity_handler))
        .route("/versions", get(versions_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &EngineConfig, port: u16) -> anyhow::Result<()> {
    let store = config.open_store().await.context("opening catalog store")?;
    let state = AppState::new(store).with_auto_map_threshold(config.auto_map_threshold);
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "catalog query surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    serve(&config, config.web_port).await
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME })).into_response()
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.read_snapshot().await {
        Ok(view) => Json(view.metrics).into_response(),
        Err(err) => server_error(err),
    }
}

async fn metric_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let view = match state.store.read_snapshot().await {
        Ok(view) => view,
        Err(err) => return server_error(err),
    };
    let Some(metric) = view.metric(&id).cloned() else {
        return not_found(format!("metric {id} not found"));
    };
    Json(MetricDetail {
        synonyms: view.synonyms_for(&id).cloned().collect(),
        conversion_groups: view.groups_for(&id).cloned().collect(),
        metric,
    })
    .into_response()
}

async fn synonyms_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.read_snapshot().await {
        Ok(view) => Json(flatten(&view)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn resolve_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResolveQuery>,
) -> Response {
    let view = match state.store.read_snapshot().await {
        Ok(view) => view,
        Err(err) => return server_error(err),
    };
    let resolver = SynonymResolver::new(flatten(&view)).with_threshold(state.auto_map_threshold);
    match resolver.best_match(&query.name) {
        Some(found) => Json(found).into_response(),
        None => not_found(format!("no synonym matches \"{}\"", query.name)),
    }
}

async fn integrity_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IntegrityQuery>,
) -> Response {
    match state.store.read_snapshot().await {
        Ok(view) => {
            let report = IntegrityChecker::new()
                .require_system(query.require_system)
                .check(&view);
            Json(IntegrityBody {
                issue_count: report.len(),
                issues_by_type: report.grouped(),
            })
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn versions_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.versions().await {
        Ok(versions) => Json(versions).into_response(),
        Err(err) => server_error(err),
    }
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: impl Display) -> Response {
    error!(error = %err, "catalog query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("Server error: {err}") })),
    )
        .into_response()
}
