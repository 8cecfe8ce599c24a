//! JSON HTTP handlers.
//!
//! A thin translation layer: query parameters in, core calls out. Handlers
//! map error kinds onto status codes and hold no state of their own —
//! everything lives in the [`SearchService`] behind [`AppContext`].

use crate::errors::Error;
use crate::service::SearchService;
use crate::state::SearchState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use peerdb_core::{AmountUnit, Filters, Identifier};
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// Shared handler context.
#[derive(Clone)]
pub struct AppContext {
    pub service: Arc<SearchService>,
    pub start_time: Instant,
}

/// Mount every API route.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/s", get(api_state))
        .route("/api/d", get(api_documents))
        .route("/api/doc/{id}", get(api_document))
        .route("/api/filters", get(api_filters))
        .route("/api/facet/{kind}", get(api_facet))
        .with_state(ctx)
}

type ApiError = (StatusCode, Json<serde_json::Value>);

/// Map an error's root kind onto an HTTP status.
fn error_response(err: Error) -> ApiError {
    let status = match err.root() {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::NotReady => StatusCode::CONFLICT,
        Error::Unsupported(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Cancelled | Error::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Error::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    // Terse human string outward; the full chain stays in the logs.
    tracing::debug!(error = %err, "request failed");
    (status, Json(json!({ "error": err.root().to_string() })))
}

fn parse_id(raw: &str) -> Result<Identifier, ApiError> {
    Identifier::from_str(raw).map_err(|e| error_response(e.into()))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn api_health(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "states": ctx.service.registry().len(),
        "uptime_seconds": ctx.start_time.elapsed().as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StateQuery {
    s: Option<String>,
    q: Option<String>,
    p: Option<String>,
    at: Option<String>,
    filters: Option<String>,
}

fn state_json(state: &SearchState, reused: bool, at: Option<&Identifier>) -> serde_json::Value {
    json!({
        "s": state.id,
        "root": state.root_id,
        "parent": state.parent_id,
        "q": state.search_query,
        "p": state.prompt,
        "at": at,
        "filters": state.filters,
        "ready": state.ready(),
        "prompt_error": state.prompt_error,
        "reused": reused,
    })
}

/// Resolve or create a search state from `s`/`q`/`p`/`at`/`filters`. A bare
/// `s` with nothing else is a pure lookup and 404s on an unknown id.
async fn api_state(
    State(ctx): State<AppContext>,
    Query(params): Query<StateQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let existing = match &params.s {
        Some(raw) => Some(parse_id(raw)?),
        None => None,
    };
    let at = match &params.at {
        Some(raw) => Some(parse_id(raw)?),
        None => None,
    };
    let filters: Option<Filters> = match &params.filters {
        Some(raw) => {
            let filters: Filters =
                serde_json::from_str(raw).map_err(|e| error_response(e.into()))?;
            filters.validate().map_err(|e| error_response(e.into()))?;
            Some(filters)
        }
        None => None,
    };
    let is_prompt = params.p.is_some();
    let text = params.p.as_deref().or(params.q.as_deref());

    if let (Some(id), None, None) = (&existing, &text, &filters) {
        let state = ctx.service.registry().get(id).map_err(error_response)?;
        return Ok(Json(state_json(&state, true, at.as_ref())));
    }

    let (state, reused) =
        ctx.service
            .get_or_create_state(existing.as_ref(), text, filters.as_ref(), is_prompt);
    Ok(Json(state_json(&state, reused, at.as_ref())))
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct DocumentsQuery {
    s: String,
    limit: Option<usize>,
}

async fn api_documents(
    State(ctx): State<AppContext>,
    Query(params): Query<DocumentsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let state_id = parse_id(&params.s)?;
    let limit = params.limit.unwrap_or(crate::service::DEFAULT_SEARCH_LIMIT).min(1000);
    let hits = ctx.service.search(&state_id, limit).await.map_err(error_response)?;
    Ok(Json(serde_json::to_value(hits).map_err(|e| error_response(e.into()))?))
}

/// One document by id, from the store.
async fn api_document(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    let doc = ctx.service.document(&id).await.map_err(error_response)?;
    Ok(Json(serde_json::to_value(doc).map_err(|e| error_response(e.into()))?))
}

// ---------------------------------------------------------------------------
// Facets
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct FiltersQuery {
    s: String,
}

async fn api_filters(
    State(ctx): State<AppContext>,
    Query(params): Query<FiltersQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let state_id = parse_id(&params.s)?;
    let overview = ctx.service.filters_overview(&state_id).await.map_err(error_response)?;
    Ok(Json(json!({ "filters": overview })))
}

#[derive(Deserialize)]
struct FacetQuery {
    s: String,
    prop: Option<String>,
    unit: Option<String>,
    mode: Option<String>,
}

/// One facet, by kind: `rel`, `string`, `time`, `amount`, `index`, `size`.
/// `time` and `amount` default to histograms; `mode=values` selects the
/// discrete terms form.
async fn api_facet(
    State(ctx): State<AppContext>,
    Path(kind): Path<String>,
    Query(params): Query<FacetQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let state_id = parse_id(&params.s)?;
    let service = &ctx.service;

    let need_prop = || -> Result<Identifier, ApiError> {
        match &params.prop {
            Some(raw) => parse_id(raw),
            None => Err(error_response(Error::invalid("missing \"prop\" parameter"))),
        }
    };
    let values_mode = params.mode.as_deref() == Some("values");

    let body = match kind.as_str() {
        "rel" => {
            let facet =
                service.rel_values(&state_id, &need_prop()?).await.map_err(error_response)?;
            serde_json::to_value(facet)
        }
        "string" => {
            let facet =
                service.string_values(&state_id, &need_prop()?).await.map_err(error_response)?;
            serde_json::to_value(facet)
        }
        "time" if values_mode => {
            let facet =
                service.time_values(&state_id, &need_prop()?).await.map_err(error_response)?;
            serde_json::to_value(facet)
        }
        "time" => {
            let hist =
                service.time_histogram(&state_id, &need_prop()?).await.map_err(error_response)?;
            serde_json::to_value(hist)
        }
        "amount" if values_mode => {
            let facet =
                service.amount_values(&state_id, &need_prop()?).await.map_err(error_response)?;
            serde_json::to_value(facet)
        }
        "amount" => {
            let unit = match &params.unit {
                Some(raw) => AmountUnit::from_str(raw)
                    .map_err(|e| error_response(Error::invalid(e.to_string())))?,
                None => return Err(error_response(Error::invalid("missing \"unit\" parameter"))),
            };
            let hist = service
                .amount_histogram(&state_id, &need_prop()?, unit)
                .await
                .map_err(error_response)?;
            serde_json::to_value(hist)
        }
        "index" => {
            let facet = service.index_values(&state_id).await.map_err(error_response)?;
            serde_json::to_value(facet)
        }
        "size" => {
            let hist = service.size_histogram(&state_id).await.map_err(error_response)?;
            serde_json::to_value(hist)
        }
        other => {
            return Err(error_response(Error::invalid(format!("unknown facet kind {other:?}"))));
        }
    };
    Ok(Json(body.map_err(|e| error_response(e.into()))?))
}
