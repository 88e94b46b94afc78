/// WebSocket 客户端
///
/// 连接到 `{base_url}/{connection_id}`，断线后按固定间隔重连

use common::utils::truncate_for_log;
use common::ClientFrame;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::listeners::ListenerRegistry;

/// 客户端错误
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("未连接到中继")]
    NotConnected,

    #[error("WebSocket 错误: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// WebSocket 客户端状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// 中继客户端
#[derive(Clone)]
pub struct RelayClient {
    /// 中继基础地址
    base_url: String,

    /// 本客户端的连接 ID
    connection_id: String,

    /// 客户端状态
    state: Arc<RwLock<ClientState>>,

    /// 按类型分发的监听器
    listeners: ListenerRegistry,

    /// 重连间隔
    reconnect_interval: Duration,

    /// 当前连接的发送通道
    outbound: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
}

impl RelayClient {
    pub fn new(
        base_url: impl Into<String>,
        connection_id: impl Into<String>,
        listeners: ListenerRegistry,
        reconnect_interval: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            connection_id: connection_id.into(),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            listeners,
            reconnect_interval,
            outbound: Arc::new(RwLock::new(None)),
        }
    }

    /// 实际连接地址
    pub fn url(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.connection_id)
    }

    /// 运行直到被取消（断线自动重连）
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let url = self.url();
            info!("尝试连接到中继: {}", url);

            match self.connect_and_run(&url, &shutdown).await {
                Ok(()) => info!("连接正常关闭"),
                Err(e) => error!("连接错误: {}", e),
            }

            self.set_state(ClientState::Disconnected).await;
            *self.outbound.write().await = None;

            if shutdown.is_cancelled() {
                break;
            }

            // 等待后重连
            warn!("{}秒后重新连接...", self.reconnect_interval.as_secs_f32());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }

        self.set_state(ClientState::Disconnected).await;
        *self.outbound.write().await = None;
        info!("客户端已停止");
    }

    /// 连接并运行
    async fn connect_and_run(&self, url: &str, shutdown: &CancellationToken) -> Result<(), ClientError> {
        self.set_state(ClientState::Connecting).await;

        let (ws_stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = connect_async(url) => result?,
        };
        info!("✅ WebSocket 连接成功: {}", self.connection_id);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.write().await = Some(tx.clone());
        self.set_state(ClientState::Connected).await;

        // 启动发送任务
        let send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = ws_sender.send(msg).await {
                    error!("发送消息失败: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!("发送任务结束");
        });

        // 启动接收任务
        let listeners = self.listeners.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(result) = ws_receiver.next().await {
                match result {
                    Ok(Message::Text(text)) => Self::dispatch_text(&listeners, &text).await,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => Self::dispatch_text(&listeners, &text).await,
                        Err(e) => warn!("二进制消息不是 UTF-8: {}", e),
                    },
                    Ok(Message::Close(frame)) => {
                        info!("服务端关闭连接: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("接收消息错误: {}", e);
                        break;
                    }
                }
            }
            debug!("接收任务结束");
        });

        // 等待任一任务完成
        let mut send_task = send_task;
        let mut recv_task = recv_task;
        tokio::select! {
            _ = &mut send_task => {
                debug!("发送任务已结束");
                recv_task.abort();
            }
            _ = &mut recv_task => {
                debug!("接收任务已结束");
                send_task.abort();
            }
            _ = shutdown.cancelled() => {
                let _ = tx.send(Message::Close(None));
                let _ = tokio::time::timeout(Duration::from_secs(1), &mut send_task).await;
                send_task.abort();
                recv_task.abort();
            }
        }

        Ok(())
    }

    /// 解析并按类型分发一条文本消息
    async fn dispatch_text(listeners: &ListenerRegistry, text: &str) {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => match map.get("type").and_then(Value::as_str) {
                Some(frame_type) => {
                    let payload = map.get("payload").cloned().unwrap_or(Value::Null);
                    listeners.dispatch(frame_type, &payload).await;
                }
                None => warn!("收到没有 type 的消息: {}", truncate_for_log(text, 200)),
            },
            _ => info!("收到非结构化消息: {}", truncate_for_log(text, 200)),
        }
    }

    /// 发送 `{type, payload}` 帧
    pub async fn send_message(&self, frame_type: &str, payload: Value) -> Result<(), ClientError> {
        let json = ClientFrame::new(frame_type, payload).to_json()?;
        let outbound = self.outbound.read().await;
        let sender = outbound.as_ref().ok_or(ClientError::NotConnected)?;
        sender
            .send(Message::Text(json))
            .map_err(|_| ClientError::NotConnected)?;
        debug!("已发送消息: type={}", frame_type);
        Ok(())
    }

    /// 获取当前状态
    #[cfg(test)]
    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ClientState) {
        *self.state.write().await = state;
    }
}
