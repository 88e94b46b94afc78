/// 会话数据接口

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};

use super::ErrorResponse;
use crate::app_state::AppState;

pub fn session_routes() -> Router<AppState> {
    Router::new().route("/session-data/:client_uuid", get(get_session_data))
}

/// 获取会话数据
pub async fn get_session_data(
    State(state): State<AppState>,
    Path(client_uuid): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<ErrorResponse>)> {
    match state.sessions.find_session(&client_uuid).await {
        Some(data) => Ok(Json(json!({ "success": true, "data": data }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("会话数据不存在: {}", client_uuid))),
        )),
    }
}
