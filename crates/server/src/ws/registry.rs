/// 本地连接表
///
/// 只保存本 worker 接受的客户端连接：connection_id -> 连接句柄。
/// 连接处理器写入/移除，总线监听任务只读

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// 发往客户端的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// 文本消息
    Text(String),
    /// 关闭连接
    Close,
}

/// 投递错误
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("连接已断开: {0}")]
    Disconnected(String),
}

/// 客户端连接句柄
#[derive(Debug)]
pub struct ClientConnection {
    /// 连接 ID
    pub connection_id: String,

    /// 连接时间
    pub connected_at: chrono::DateTime<chrono::Utc>,

    /// 本 worker 内的接入序号，用于区分同一 ID 的前后两次接入
    seq: u64,

    /// 写任务的发送通道
    sender: mpsc::UnboundedSender<OutboundFrame>,
}

impl ClientConnection {
    /// 发送文本消息
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), DeliveryError> {
        self.sender
            .send(OutboundFrame::Text(text.into()))
            .map_err(|_| DeliveryError::Disconnected(self.connection_id.clone()))
    }

    /// 发送 JSON 消息
    pub fn send_json(&self, value: &Value) -> Result<(), DeliveryError> {
        self.send_text(value.to_string())
    }

    /// 请求写任务发送 Close 帧
    pub fn close(&self) -> Result<(), DeliveryError> {
        self.sender
            .send(OutboundFrame::Close)
            .map_err(|_| DeliveryError::Disconnected(self.connection_id.clone()))
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// 本地连接表
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    /// 所有连接的映射：connection_id -> ClientConnection
    connections: Arc<RwLock<HashMap<String, Arc<ClientConnection>>>>,

    next_seq: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    /// 创建新的连接表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接，同一 ID 已存在时覆盖旧句柄
    pub async fn register(
        &self,
        connection_id: String,
        sender: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Arc<ClientConnection> {
        let connection = Arc::new(ClientConnection {
            connection_id: connection_id.clone(),
            connected_at: chrono::Utc::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            sender,
        });

        let mut connections = self.connections.write().await;
        if let Some(previous) = connections.insert(connection_id.clone(), connection.clone()) {
            warn!(
                "连接 ID 重复，覆盖旧连接: {} (旧序号 {})",
                connection_id,
                previous.seq()
            );
        }

        info!("客户端连接已注册: {}", connection_id);
        connection
    }

    /// 查找连接
    pub async fn lookup(&self, connection_id: &str) -> Option<Arc<ClientConnection>> {
        let connections = self.connections.read().await;
        connections.get(connection_id).cloned()
    }

    /// 移除连接
    pub async fn remove(&self, connection_id: &str) -> Option<Arc<ClientConnection>> {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(connection_id);
        if removed.is_some() {
            info!("客户端连接已注销: {}", connection_id);
        }
        removed
    }

    /// 仅当表中仍是这个句柄时才移除
    ///
    /// 同一 ID 被新连接接管后，旧处理器退出时不能把新连接删掉
    pub async fn remove_if_current(&self, connection: &ClientConnection) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&connection.connection_id) {
            Some(current) if current.seq() == connection.seq() => {
                connections.remove(&connection.connection_id);
                info!("客户端连接已注销: {}", connection.connection_id);
                true
            }
            Some(_) => {
                debug!("连接 {} 已被新连接接管，保留表项", connection.connection_id);
                false
            }
            None => false,
        }
    }

    /// 获取连接数量
    pub async fn count(&self) -> usize {
        let connections = self.connections.read().await;
        connections.len()
    }

    /// 获取所有连接 ID
    pub async fn list_ids(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        let mut ids: Vec<String> = connections.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_lookup_remove() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = registry.register("abc".to_string(), tx).await;
        let found = registry.lookup("abc").await.unwrap();
        assert!(Arc::ptr_eq(&handle, &found));
        assert_eq!(registry.count().await, 1);

        assert!(registry.remove("abc").await.is_some());
        assert!(registry.lookup("abc").await.is_none());
        assert!(registry.remove("abc").await.is_none());
    }

    #[tokio::test]
    async fn test_register_overwrites_previous_handle() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let first = registry.register("abc".to_string(), tx1).await;
        let second = registry.register("abc".to_string(), tx2).await;
        assert_ne!(first.seq(), second.seq());
        assert_eq!(registry.count().await, 1);

        registry.lookup("abc").await.unwrap().send_text("hi").unwrap();
        assert_eq!(rx2.recv().await, Some(OutboundFrame::Text("hi".to_string())));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_if_current_keeps_newer_registration() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let stale = registry.register("abc".to_string(), tx1).await;
        let fresh = registry.register("abc".to_string(), tx2).await;

        assert!(!registry.remove_if_current(&stale).await);
        assert!(registry.lookup("abc").await.is_some());

        assert!(registry.remove_if_current(&fresh).await);
        assert!(registry.lookup("abc").await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_fails() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = registry.register("gone".to_string(), tx).await;
        drop(rx);

        assert!(matches!(handle.send_text("x"), Err(DeliveryError::Disconnected(id)) if id == "gone"));
        assert!(handle.close().is_err());
    }

    #[tokio::test]
    async fn test_list_ids_sorted() {
        let registry = ConnectionRegistry::new();
        for id in ["c", "a", "b"] {
            let (tx, _rx) = mpsc::unbounded_channel();
            registry.register(id.to_string(), tx).await;
        }
        assert_eq!(registry.list_ids().await, vec!["a", "b", "c"]);
    }
}
