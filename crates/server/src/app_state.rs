/// 应用全局状态

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bus::{ListenerState, PublishGateway};
use crate::jobs::JobQueue;
use crate::services::session_service::SessionStore;
use crate::ws::ConnectionRegistry;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    /// 本 worker 的连接表（与总线监听任务共享）
    pub registry: ConnectionRegistry,
    /// 发布网关
    pub gateway: PublishGateway,
    /// 后台任务队列
    pub jobs: JobQueue,
    /// 会话数据查询
    pub sessions: Arc<dyn SessionStore>,
    /// 回显前缀
    pub echo_prefix: Arc<str>,
    /// 总线监听状态
    pub listener_state: watch::Receiver<ListenerState>,
    /// worker 关闭信号
    pub shutdown: CancellationToken,
    /// 跟踪连接处理任务，关闭时等待其结束
    pub tracker: TaskTracker,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: ConnectionRegistry,
        gateway: PublishGateway,
        jobs: JobQueue,
        sessions: Arc<dyn SessionStore>,
        echo_prefix: impl Into<String>,
        listener_state: watch::Receiver<ListenerState>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            registry,
            gateway,
            jobs,
            sessions,
            echo_prefix: Arc::from(echo_prefix.into()),
            listener_state,
            shutdown,
            tracker,
        }
    }

    /// 获取连接表
    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    /// 当前总线监听状态
    pub fn listener_state(&self) -> ListenerState {
        *self.listener_state.borrow()
    }
}
