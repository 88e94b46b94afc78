/// WS Relay - Server
///
/// 多 worker WebSocket 中继：客户端连接到任意 worker，
/// 消息经广播总线送达持有目标连接的 worker

mod api;
mod app_state;
mod bus;
mod config;
mod jobs;
mod services;
mod ws;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::{
    app_state::AppState,
    bus::{BusListener, ListenerConfig, PublishGateway},
    jobs::{JobQueue, JobQueueConfig, SimulatedWorkflow},
    services::PlaceholderSessionStore,
    ws::ConnectionRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境变量
    dotenvy::dotenv().ok();

    // 加载配置
    let cfg = config::Config::from_env()?;

    // 初始化日志
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    let pid = std::process::id();
    info!("🚀 启动 WS Relay worker (pid={})...", pid);
    info!("✅ 配置加载成功: bus={:?}, topic={}", cfg.bus_backend, cfg.redis_channel);

    // 广播总线（本 worker 内监听任务与发布网关共享）
    let bus = bus::connect(&cfg)?;
    info!("✅ 广播总线已就绪: {}", bus.name());

    let registry = ConnectionRegistry::new();
    let gateway = PublishGateway::new(bus.clone(), cfg.redis_channel.clone());
    info!("✅ 发布网关已就绪: topic={}", gateway.topic());
    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();

    // 每个 worker 恰好一个总线监听任务
    let listener = BusListener::new(bus, registry.clone(), ListenerConfig::from(&cfg));
    let listener_state = listener.state();
    let listener_task = tokio::spawn(listener.run(shutdown.child_token()));
    info!("✅ 总线监听任务已启动");

    let jobs = JobQueue::new(
        Arc::new(SimulatedWorkflow::new(Duration::from_millis(
            cfg.job_simulated_duration_ms,
        ))),
        gateway.clone(),
        JobQueueConfig::from(&cfg),
        tracker.clone(),
        shutdown.clone(),
    );

    let app_state = AppState::new(
        registry.clone(),
        gateway,
        jobs,
        Arc::new(PlaceholderSessionStore),
        cfg.echo_prefix.clone(),
        listener_state,
        shutdown.clone(),
        tracker.clone(),
    );

    let app = build_router(app_state);

    // 启动服务器
    let host: std::net::IpAddr = cfg.server_host.parse()?;
    let addr = SocketAddr::new(host, cfg.server_port);
    info!("🎯 服务器监听在 http://{}", addr);

    let tcp = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // 停止监听任务和连接处理器，等待它们结束
    info!("正在关闭 worker，剩余连接: {}", registry.count().await);
    debug!("剩余连接 ID: {:?}", registry.list_ids().await);
    shutdown.cancel();
    tracker.close();
    if tokio::time::timeout(cfg.shutdown_grace(), tracker.wait()).await.is_err() {
        warn!(
            "等待连接处理器超时（{}s），强制退出",
            cfg.shutdown_grace_secs
        );
    }
    if let Err(e) = listener_task.await {
        warn!("总线监听任务异常退出: {}", e);
    }

    info!("👋 worker 已退出 (pid={})", pid);
    Ok(())
}

/// 构建应用路由
pub fn build_router(state: AppState) -> Router {
    // 设置CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws::handle_anonymous_websocket))
        .route("/ws/:connection_id", get(ws::handle_client_websocket))
        .route("/send/:connection_id", post(api::messages::send_message))
        .nest("/api", api::api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 等待 SIGINT / SIGTERM，或内部取消
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("监听 Ctrl+C 失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("监听 SIGTERM 失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到 Ctrl+C，开始关闭"),
        _ = terminate => info!("收到 SIGTERM，开始关闭"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

async fn root_handler() -> &'static str {
    "WS Relay Server"
}

/// 健康检查
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "worker_pid": std::process::id(),
        "connections": state.registry.count().await,
        "listener": state.listener_state().as_str(),
    }))
}
