/// WebSocket 客户端模块
///
/// 按连接 ID 连接到中继，收到的帧按 `type` 分发给订阅者

pub mod client;
pub mod listeners;

pub use client::RelayClient;
pub use listeners::{ListenerRegistry, Subscription};
