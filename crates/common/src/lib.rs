/// WS Relay - 公共库
///
/// 提供 Server 和 Client 共享的消息类型、错误处理、工具函数等

pub mod errors;
pub mod relay;
pub mod utils;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use relay::{ClientFrame, Envelope, InboundOutcome};
