/// 工具函数集合

use uuid::Uuid;

use crate::{Error, Result};

/// 连接 ID 最大长度
pub const MAX_CONNECTION_ID_LEN: usize = 128;

/// 生成唯一 ID
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// 验证连接 ID 格式
///
/// 允许 1..=128 个字符，只能包含 ASCII 字母数字以及 `-` `_` `.` `:`
pub fn validate_connection_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidConnectionId("连接 ID 不能为空".to_string()));
    }

    if id.len() > MAX_CONNECTION_ID_LEN {
        return Err(Error::InvalidConnectionId(format!(
            "连接 ID 长度超过 {} 个字符",
            MAX_CONNECTION_ID_LEN
        )));
    }

    let valid = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if !valid {
        return Err(Error::InvalidConnectionId(format!("包含非法字符: {}", id)));
    }

    Ok(())
}

/// 截断过长的字符串用于日志输出
pub fn truncate_for_log(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let head: String = s.chars().take(max_chars).collect();
    format!("{}…", head)
}
