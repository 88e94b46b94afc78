/// 消息中继协议模块
///
/// 包含总线信封与客户端帧两部分

pub mod envelope;
pub mod frame;

pub use envelope::Envelope;
pub use frame::{ClientFrame, InboundOutcome, transform_inbound};
