/// 客户端 WebSocket 连接处理器
///
/// 每个连接一个处理器: 注册到本地连接表 -> 读循环 -> 关闭时从表中移除。
/// 无论以何种方式退出，都会执行清理

use axum::extract::ws::{Message as AxumWsMessage, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::relay::frame::{self, transform_inbound};
use common::utils::{generate_id, truncate_for_log, validate_connection_id};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::{ClientConnection, OutboundFrame};
use crate::api::ErrorResponse;
use crate::app_state::AppState;

/// 关闭时等待 Close 帧发出的上限
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// 读循环退出原因
#[derive(Debug)]
enum ReadExit {
    /// 对端关闭
    PeerClosed,
    /// worker 正在关闭
    Shutdown,
    /// 读取或回复失败
    Error(String),
}

/// WebSocket 升级处理器（客户端指定连接 ID）
pub async fn handle_client_websocket(
    ws: WebSocketUpgrade,
    Path(connection_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    if let Err(e) = validate_connection_id(&connection_id) {
        warn!("拒绝 WebSocket 连接: {}", e);
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                success: false,
                error: e.to_string(),
            }),
        )
            .into_response();
    }

    upgrade(ws, connection_id, false, state)
}

/// WebSocket 升级处理器（服务端分配连接 ID）
pub async fn handle_anonymous_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, generate_id(), true, state)
}

fn upgrade(ws: WebSocketUpgrade, connection_id: String, announce: bool, state: AppState) -> Response {
    let tracker = state.tracker.clone();
    ws.on_upgrade(move |socket| {
        tracker.track_future(handle_client_connection(socket, connection_id, announce, state))
    })
}

/// 处理客户端 WebSocket 连接
async fn handle_client_connection(
    socket: WebSocket,
    connection_id: String,
    announce: bool,
    state: AppState,
) {
    info!(
        "客户端已连接: {} (worker pid: {})",
        connection_id,
        std::process::id()
    );

    let (ws_sender, mut ws_receiver) = socket.split();

    // 创建消息发送通道
    let (tx, rx) = mpsc::unbounded_channel::<OutboundFrame>();

    // 注册到连接表
    let connection = state.registry().register(connection_id.clone(), tx).await;

    if announce {
        if let Err(e) = connection.send_json(&frame::connection_established(&connection_id)) {
            warn!("发送连接建立通知失败: {}", e);
        }
    }

    // 创建消息发送任务
    let writer_id = connection_id.clone();
    let mut send_task = tokio::spawn(write_loop(ws_sender, rx, writer_id));

    // 创建消息接收任务
    let reader_connection = connection.clone();
    let prefix = state.echo_prefix.clone();
    let shutdown = state.shutdown.clone();
    let mut recv_task = tokio::spawn(async move {
        read_loop(&mut ws_receiver, &reader_connection, &prefix, &shutdown).await
    });

    // 等待任一任务完成
    tokio::select! {
        _ = &mut send_task => {
            debug!("客户端发送任务已结束: {}", connection_id);
            recv_task.abort();
        }
        exit = &mut recv_task => {
            match exit {
                Ok(ReadExit::PeerClosed) => {
                    debug!("客户端主动断开: {}", connection_id);
                }
                Ok(ReadExit::Shutdown) => {
                    info!("worker 关闭，断开客户端: {}", connection_id);
                    if connection.close().is_ok() {
                        let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut send_task).await;
                    }
                }
                Ok(ReadExit::Error(e)) => {
                    error!("客户端连接 {} 出错: {}", connection_id, e);
                }
                Err(e) => {
                    error!("客户端接收任务异常退出: {} ({})", connection_id, e);
                }
            }
            send_task.abort();
        }
    }

    // 清理：从连接表中注销
    state.registry().remove_if_current(&connection).await;
    let lifetime = chrono::Utc::now() - connection.connected_at;
    info!(
        "客户端连接已关闭: {} (持续 {}s, worker pid: {})",
        connection_id,
        lifetime.num_seconds(),
        std::process::id()
    );
}

/// 把发送队列中的帧写入 socket
async fn write_loop(
    mut sender: SplitSink<WebSocket, AxumWsMessage>,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    connection_id: String,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            OutboundFrame::Text(text) => {
                if let Err(e) = sender.send(AxumWsMessage::Text(text)).await {
                    warn!("发送客户端消息失败: {} ({})", connection_id, e);
                    break;
                }
            }
            OutboundFrame::Close => {
                let _ = sender.send(AxumWsMessage::Close(None)).await;
                break;
            }
        }
    }
    debug!("客户端消息发送任务结束: {}", connection_id);
}

/// 读循环：逐帧处理，直到对端关闭、出错或 worker 关闭
async fn read_loop(
    receiver: &mut SplitStream<WebSocket>,
    connection: &ClientConnection,
    prefix: &str,
    shutdown: &CancellationToken,
) -> ReadExit {
    loop {
        // 只在帧与帧之间响应关闭信号，正在处理的帧会完成
        let next = tokio::select! {
            _ = shutdown.cancelled() => return ReadExit::Shutdown,
            next = receiver.next() => next,
        };

        let msg = match next {
            None => return ReadExit::PeerClosed,
            Some(Err(e)) => return ReadExit::Error(format!("接收消息错误: {}", e)),
            Some(Ok(msg)) => msg,
        };

        let reply = match msg {
            AxumWsMessage::Text(text) => process_text(&text, connection, prefix),
            AxumWsMessage::Binary(data) => match String::from_utf8(data) {
                Ok(text) => process_text(&text, connection, prefix),
                Err(e) => frame::error_notification(
                    format!("二进制消息不是合法的 UTF-8: {}", e),
                    &format!("<{} bytes binary>", e.as_bytes().len()),
                ),
            },
            AxumWsMessage::Close(_) => return ReadExit::PeerClosed,
            // Ping/Pong 由 axum 自动处理
            _ => continue,
        };

        if let Err(e) = connection.send_json(&reply) {
            return ReadExit::Error(format!("回复客户端失败: {}", e));
        }
    }
}

fn process_text(text: &str, connection: &ClientConnection, prefix: &str) -> serde_json::Value {
    let outcome = transform_inbound(text, prefix);
    if outcome.is_rejected() {
        warn!(
            "客户端 {} 发送的消息不是 JSON 对象: {}",
            connection.connection_id,
            truncate_for_log(text, 200)
        );
    } else {
        debug!(
            "收到客户端 {} 消息: {}",
            connection.connection_id,
            truncate_for_log(text, 200)
        );
    }
    outcome.into_reply()
}
