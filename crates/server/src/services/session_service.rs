/// 会话数据服务

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

/// 按客户端 UUID 查询会话数据
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 没有数据时返回 `None`
    async fn find_session(&self, client_uuid: &str) -> Option<Value>;
}

/// 占位实现：对任意 UUID 返回示例数据
pub struct PlaceholderSessionStore;

#[async_trait]
impl SessionStore for PlaceholderSessionStore {
    async fn find_session(&self, client_uuid: &str) -> Option<Value> {
        debug!("查询会话数据: {}", client_uuid);
        Some(json!({
            "example": "data associated with",
            "uuid": client_uuid,
        }))
    }
}
