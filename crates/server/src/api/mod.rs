pub mod jobs;
pub mod messages;
pub mod sessions;

use axum::Router;
use serde::Serialize;

use crate::app_state::AppState;

/// 错误响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// `/api` 下的所有路由
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(sessions::session_routes())
        .nest("/v1", jobs::job_routes())
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::body::{to_bytes, Body};
    use axum::http::Response;
    use serde_json::Value;

    pub async fn body_json(response: Response<Body>) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
