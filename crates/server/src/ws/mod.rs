/// WebSocket 模块
///
/// 管理本 worker 接受的客户端 WebSocket 连接

pub mod handler;
pub mod registry;

pub use handler::{handle_anonymous_websocket, handle_client_websocket};
pub use registry::ConnectionRegistry;
