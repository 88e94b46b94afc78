/// 消息投递接口
///
/// `POST /send/:connection_id` 把消息交给总线，由持有该连接的 worker 投递。
/// 只确认发布成功，不确认目标在线

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::utils::validate_connection_id;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::ErrorResponse;
use crate::app_state::AppState;

/// 查询参数 `?message=...`
#[derive(Debug, Deserialize)]
pub struct SendMessageQuery {
    pub message: Option<String>,
}

/// 请求体 `{"message": "..."}`
#[derive(Debug, Deserialize, Validate)]
pub struct SendMessageDto {
    #[validate(length(min = 1, message = "message 不能为空"))]
    pub message: String,
}

/// 发布结果
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// 向指定连接发送消息（查询参数优先于请求体）
pub async fn send_message(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    Query(query): Query<SendMessageQuery>,
    body: Option<Json<SendMessageDto>>,
) -> Response {
    if let Err(e) = validate_connection_id(&connection_id) {
        return bad_request(e.to_string());
    }

    let dto = match (query.message, body) {
        (Some(message), _) => SendMessageDto { message },
        (None, Some(Json(dto))) => dto,
        (None, None) => return bad_request("缺少 message 参数"),
    };
    if let Err(e) = dto.validate() {
        return bad_request(format!("验证失败: {}", e));
    }

    match state.gateway.publish(&connection_id, dto.message).await {
        Ok(()) => (
            StatusCode::OK,
            Json(PublishResponse {
                status: "published",
                detail: None,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(PublishResponse {
                status: "error",
                detail: Some(e.to_string()),
            }),
        )
            .into_response(),
    }
}

fn bad_request(error: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(error))).into_response()
}
