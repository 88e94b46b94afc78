/// 任务接口

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use uuid::Uuid;

use super::ErrorResponse;
use crate::app_state::AppState;
use crate::jobs::JobRecord;

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions/:session_id/jobs", post(submit_job))
        .route("/jobs/:job_id", get(get_job))
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid, (StatusCode, Json<ErrorResponse>)> {
    Uuid::parse_str(raw).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(format!("无效的 {}: {}", what, raw))),
        )
    })
}

/// 解析任务参数，空请求体视为 `null`
fn parse_params(body: &[u8]) -> Result<Value, (StatusCode, Json<ErrorResponse>)> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(format!("任务参数不是合法的 JSON: {}", e))),
        )
    })
}

/// 提交会话工作流任务
pub async fn submit_job(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<ErrorResponse>)> {
    let session_id = parse_uuid(&session_id, "session_id")?;
    let params = parse_params(&body)?;

    let job_id = state.jobs.enqueue(session_id, params).await;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

/// 查询任务状态
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, (StatusCode, Json<ErrorResponse>)> {
    let job_id = parse_uuid(&job_id, "job_id")?;
    state.jobs.get(job_id).await.map(Json).map_err(|e| {
        (StatusCode::NOT_FOUND, Json(ErrorResponse::new(e.to_string())))
    })
}
