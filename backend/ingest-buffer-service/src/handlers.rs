//! Admin HTTP handlers: buffer inspection, manual flushes and live lookups.

use actix_web::{web, HttpResponse};
use event_buffer::metrics::gather_text;
use event_buffer::LastEventLookup;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{Result, ServiceError};
use crate::state::AppState;

const DEFAULT_DLQ_LIMIT: usize = 10;
const MAX_DLQ_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    pub limit: Option<usize>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/ready", web::get().to(ready))
        .service(
            web::scope("/metrics")
                .route("", web::get().to(get_counters))
                .route("/reset", web::post().to(reset_counters))
                .route("/prometheus", web::get().to(prometheus_metrics)),
        )
        .service(
            web::scope("/buffer")
                .route("/stats", web::get().to(buffer_stats))
                .route("/dlq", web::get().to(inspect_dlq))
                .route("/dlq", web::delete().to(clear_dlq))
                .route("/flush", web::post().to(flush_buffer))
                .route("/retry", web::post().to(process_retry)),
        )
        .service(
            web::scope("/projects/{project_id}")
                .route("/live-visitors", web::get().to(live_visitors))
                .route(
                    "/profiles/{profile_id}/last-screen-view",
                    web::get().to(last_screen_view_by_profile),
                )
                .route(
                    "/sessions/{session_id}/last-screen-view",
                    web::get().to(last_screen_view_by_session),
                ),
        );
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

/// Ready once the shared store answers.
async fn ready(state: web::Data<AppState>) -> HttpResponse {
    match state.buffer.get_buffer_size().await {
        Ok(_) => HttpResponse::Ok().json(json!({ "status": "ready" })),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            HttpResponse::ServiceUnavailable().json(json!({ "status": "unavailable" }))
        }
    }
}

/// Shared ingestion counters plus current queue sizes.
async fn get_counters(state: web::Data<AppState>) -> Result<HttpResponse> {
    let counters = state.buffer.read_counters().await?;
    let stats = state.buffer.get_buffer_stats().await?;
    Ok(HttpResponse::Ok().json(json!({ "counters": counters, "buffer": stats })))
}

async fn reset_counters(state: web::Data<AppState>) -> Result<HttpResponse> {
    state.buffer.reset_counters().await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true })))
}

async fn prometheus_metrics() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(gather_text())
}

async fn buffer_stats(state: web::Data<AppState>) -> Result<HttpResponse> {
    let stats = state.buffer.get_buffer_stats().await?;
    Ok(HttpResponse::Ok().json(stats))
}

async fn inspect_dlq(
    state: web::Data<AppState>,
    query: web::Query<DlqQuery>,
) -> Result<HttpResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_DLQ_LIMIT);
    if limit == 0 || limit > MAX_DLQ_LIMIT {
        return Err(ServiceError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_DLQ_LIMIT
        )));
    }

    let events = state.buffer.inspect_dlq(limit).await?;
    Ok(HttpResponse::Ok().json(json!({ "count": events.len(), "events": events })))
}

async fn clear_dlq(state: web::Data<AppState>) -> Result<HttpResponse> {
    let removed = state.buffer.clear_dlq().await?;
    info!(removed = removed, "Dead letter queue cleared via admin API");
    Ok(HttpResponse::Ok().json(json!({ "removed": removed })))
}

async fn flush_buffer(state: web::Data<AppState>) -> Result<HttpResponse> {
    let outcome = state.buffer.process_buffer().await?;
    Ok(HttpResponse::Ok().json(outcome))
}

async fn process_retry(state: web::Data<AppState>) -> Result<HttpResponse> {
    let outcome = state.buffer.process_retry_buffer().await?;
    Ok(HttpResponse::Ok().json(outcome))
}

async fn live_visitors(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let project_id = path.into_inner();
    let count = state.buffer.get_active_visitor_count(&project_id).await?;
    Ok(HttpResponse::Ok().json(json!({ "projectId": project_id, "count": count })))
}

async fn last_screen_view_by_profile(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse> {
    let (project_id, profile_id) = path.into_inner();
    let lookup = LastEventLookup::ByProfile {
        project_id,
        profile_id,
    };
    last_screen_view(&state, lookup).await
}

async fn last_screen_view_by_session(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse> {
    let (project_id, session_id) = path.into_inner();
    let lookup = LastEventLookup::BySession {
        project_id,
        session_id,
    };
    last_screen_view(&state, lookup).await
}

async fn last_screen_view(state: &AppState, lookup: LastEventLookup) -> Result<HttpResponse> {
    match state.buffer.get_last_screen_view(&lookup).await? {
        Some(event) => Ok(HttpResponse::Ok().json(event)),
        None => Err(ServiceError::NotFound("no screen view recorded".to_string())),
    }
}
