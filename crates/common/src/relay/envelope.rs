/// 广播总线消息信封
///
/// 所有 worker 共享同一个 topic，信封中的 `target` 决定由哪个 worker 投递

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// 总线信封
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// 目标连接 ID（兼容旧字段名 `target_uuid`）
    #[serde(alias = "target_uuid")]
    pub target: String,

    /// 投递给客户端的文本
    pub message: String,
}

impl Envelope {
    /// 创建信封
    pub fn new(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message: message.into(),
        }
    }

    /// 序列化为 JSON 字符串
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 从总线负载解码，并校验目标不为空
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        // 只接受 JSON 对象，serde 派生的实现也会接受数组形式
        let envelope: Envelope = match serde_json::from_slice(bytes)? {
            object @ serde_json::Value::Object(_) => serde_json::from_value(object)?,
            _ => return Err(Error::InvalidEnvelope("信封必须是 JSON 对象".to_string())),
        };
        if envelope.target.trim().is_empty() {
            return Err(Error::InvalidEnvelope("target 不能为空".to_string()));
        }
        Ok(envelope)
    }
}
