/// 广播总线模块
///
/// 跨进程发布/订阅通道。每个 worker 持有一个订阅，所有信封都发往同一个 topic，
/// 由各 worker 的监听任务按本地连接表决定是否投递

pub mod gateway;
pub mod listener;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_bus;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{BusBackend, Config};

pub use gateway::PublishGateway;
pub use listener::{BusListener, ListenerConfig, ListenerState};
pub use memory::MemoryBus;

/// 订阅流中的一帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusFrame {
    /// 订阅确认（总线内部控制消息）
    Subscribed { topic: String },
    /// 数据消息
    Message { topic: String, payload: Vec<u8> },
}

/// 订阅句柄：流结束表示底层连接已断开
pub type BusSubscription = BoxStream<'static, BusFrame>;

/// 总线错误
#[derive(Debug, Error)]
pub enum BusError {
    #[error("总线连接错误: {0}")]
    Transport(String),

    #[error("总线已关闭")]
    Closed,

    #[error("消息编码失败: {0}")]
    Encode(#[from] common::Error),

    #[error("不支持的总线后端: {0}")]
    Unsupported(String),
}

impl BusError {
    /// 是否为可重试的连接类错误
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Closed)
    }
}

/// 广播总线
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    /// 发布消息，交给传输层后立即返回
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError>;

    /// 订阅 topic
    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError>;

    /// 后端名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 进程内共享的总线句柄
pub type SharedBus = Arc<dyn BroadcastBus>;

/// 按配置创建总线
pub fn connect(cfg: &Config) -> Result<SharedBus, BusError> {
    match cfg.bus_backend {
        BusBackend::Memory => Ok(Arc::new(MemoryBus::new())),
        #[cfg(feature = "redis")]
        BusBackend::Redis => Ok(Arc::new(redis_bus::RedisBus::new(&cfg.redis_url())?)),
        #[cfg(not(feature = "redis"))]
        BusBackend::Redis => Err(BusError::Unsupported(
            "redis（编译时未启用 redis feature）".to_string(),
        )),
    }
}
