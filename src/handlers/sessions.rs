//! Session inspection endpoints.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// GET /api/v1/sessions
pub async fn list_sessions(state: web::Data<AppState>) -> HttpResponse {
    let summary = state.sessions.get_sessions_summary();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "summary": summary
    }))
}

/// GET /api/v1/sessions/{id}
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let session = state
        .sessions
        .get_session(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))?;

    Ok(HttpResponse::Ok().json(session.summary()))
}

/// DELETE /api/v1/sessions/{id}
///
/// Closes the session; its client socket is closed by the write pump.
pub async fn close_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    if !state.sessions.remove_session(&session_id).await {
        return Err(AppError::NotFound(format!("session {}", session_id)));
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "closed",
        "session_id": session_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}
