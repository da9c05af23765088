//! # JSON 辅助工具

use serde_json::Value;

/// 确保文本以合法 JSON 值入库
///
/// 本身是合法 JSON 时原样解析，否则包装为 JSON 字符串
#[must_use]
pub fn ensure_json_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
