/// WS Relay - Client
///
/// 终端客户端：按连接 ID 连接中继，标准输入的每一行作为聊天消息发送，
/// 收到的帧按类型打印

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod ws;

use ws::{ListenerRegistry, RelayClient, Subscription};

/// 聊天消息帧类型
const CHAT_FRAME_TYPE: &str = "chat_message";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置
    dotenvy::dotenv().ok();
    let cfg = config::Config::from_env()?;

    // 初始化日志
    // 可以通过环境变量 RUST_LOG 覆盖 LOG_LEVEL
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    info!("🚀 启动 WS Relay Client...");
    info!("📌 连接 ID: {}", cfg.connection_id);

    let listeners = ListenerRegistry::new();
    let subscriptions = register_printers(&listeners).await;

    let client = RelayClient::new(
        cfg.relay_ws_url.clone(),
        cfg.connection_id.clone(),
        listeners.clone(),
        cfg.reconnect_interval(),
    );
    info!("🎯 连接到中继: {}", client.url());

    let shutdown = CancellationToken::new();
    let runner = {
        let client = client.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.run(shutdown).await })
    };

    // 标准输入的每一行作为一条聊天消息
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("收到 Ctrl+C，正在退出");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    if let Err(e) = client.send_message(CHAT_FRAME_TYPE, json!({ "text": text })).await {
                        warn!("发送失败: {}", e);
                    }
                }
                Ok(None) => {
                    info!("标准输入已关闭，正在退出");
                    break;
                }
                Err(e) => {
                    error!("读取标准输入失败: {}", e);
                    break;
                }
            },
        }
    }

    // 退出前不再打印后续收到的帧
    for subscription in &subscriptions {
        listeners.unsubscribe(subscription).await;
    }
    shutdown.cancel();
    runner.await?;
    Ok(())
}

/// 为常见帧类型注册打印监听器
async fn register_printers(listeners: &ListenerRegistry) -> Vec<Subscription> {
    let mut subscriptions = Vec::new();

    let chat = listeners
        .subscribe(CHAT_FRAME_TYPE, |payload: &Value| {
            match payload.get("text").and_then(Value::as_str) {
                Some(text) => println!("< {}", text),
                None => println!("< {}", payload),
            }
            Ok(())
        })
        .await;
    subscriptions.push(chat);

    let established = listeners
        .subscribe(common::relay::frame::CONNECTION_ESTABLISHED_FRAME_TYPE, |payload: &Value| {
            info!("服务端分配连接 ID: {}", payload["connection_id"]);
            Ok(())
        })
        .await;
    subscriptions.push(established);

    let errors = listeners
        .subscribe(common::relay::frame::ERROR_FRAME_TYPE, |payload: &Value| {
            warn!("服务端返回错误: {}", payload["message"]);
            Ok(())
        })
        .await;
    subscriptions.push(errors);

    let task_updates = listeners
        .subscribe("task_status_update", |payload: &Value| {
            println!("[任务 {}] {}", payload["task_id"], payload["status"]);
            Ok(())
        })
        .await;
    subscriptions.push(task_updates);

    subscriptions
}
