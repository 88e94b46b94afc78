/// 客户端 WebSocket 帧定义
///
/// 客户端与 worker 之间交换的都是带 `type` 与 `payload` 的 JSON 对象

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// 错误通知的帧类型
pub const ERROR_FRAME_TYPE: &str = "error";

/// 分配连接 ID 后发送的帧类型
pub const CONNECTION_ESTABLISHED_FRAME_TYPE: &str = "connection_established";

/// 入站消息不是 JSON 对象时的错误提示
pub const NOT_AN_OBJECT_MESSAGE: &str = "消息必须是 JSON 对象";

/// 入站对象缺少 `payload.text` 时附加的警告
pub const MISSING_TEXT_WARNING: &str = "原始 payload 缺少预期的结构";

/// 默认回显前缀
pub const DEFAULT_ECHO_PREFIX: &str = "Echooo ";

/// 客户端帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// 帧类型
    #[serde(rename = "type")]
    pub frame_type: String,

    /// 帧负载
    #[serde(default)]
    pub payload: Value,
}

impl ClientFrame {
    /// 创建帧
    pub fn new(frame_type: impl Into<String>, payload: Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            payload,
        }
    }

    /// 创建文本消息帧 `{type, payload: {text}}`
    pub fn text(frame_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(frame_type, json!({ "text": text.into() }))
    }

    /// 序列化为 JSON 字符串
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 从 JSON 字符串反序列化，只接受 JSON 对象
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str(json)? {
            object @ Value::Object(_) => serde_json::from_value(object),
            _ => Err(serde::de::Error::custom("帧必须是 JSON 对象")),
        }
    }
}

/// 错误通知 `{type: "error", payload: {message, received}}`
pub fn error_notification(message: impl Into<String>, received: &str) -> Value {
    json!({
        "type": ERROR_FRAME_TYPE,
        "payload": {
            "message": message.into(),
            "received": received,
        }
    })
}

/// 连接建立通知，携带服务端分配的连接 ID
pub fn connection_established(connection_id: &str) -> Value {
    json!({
        "type": CONNECTION_ESTABLISHED_FRAME_TYPE,
        "payload": {
            "connection_id": connection_id,
        }
    })
}

/// 入站消息的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// `payload.text` 已加上前缀
    Transformed(Value),
    /// 是 JSON 对象但缺少 `payload.text`，原样回显并附带警告
    Unexpected(Value),
    /// 不是 JSON 对象，回复错误通知
    Rejected(Value),
}

impl InboundOutcome {
    /// 取出需要回复给客户端的帧
    pub fn into_reply(self) -> Value {
        match self {
            Self::Transformed(v) | Self::Unexpected(v) | Self::Rejected(v) => v,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// 处理一条入站文本消息
///
/// 只对 `payload.text` 加一次前缀，其余字段保持不变
pub fn transform_inbound(raw: &str, prefix: &str) -> InboundOutcome {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            return InboundOutcome::Rejected(error_notification(
                format!("{}: {}", NOT_AN_OBJECT_MESSAGE, e),
                raw,
            ));
        }
    };

    let mut object = match value {
        Value::Object(map) => map,
        _ => return InboundOutcome::Rejected(error_notification(NOT_AN_OBJECT_MESSAGE, raw)),
    };

    if prefix_payload_text(&mut object, prefix) {
        InboundOutcome::Transformed(Value::Object(object))
    } else {
        object.insert("warning".to_string(), Value::String(MISSING_TEXT_WARNING.to_string()));
        InboundOutcome::Unexpected(Value::Object(object))
    }
}

fn prefix_payload_text(object: &mut Map<String, Value>, prefix: &str) -> bool {
    let Some(Value::Object(payload)) = object.get_mut("payload") else {
        return false;
    };
    let Some(text) = payload.get_mut("text") else {
        return false;
    };

    let original = match &mut *text {
        Value::String(s) => std::mem::take(s),
        other => other.to_string(),
    };
    *text = Value::String(format!("{}{}", prefix, original));
    true
}
