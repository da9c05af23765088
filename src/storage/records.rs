//! # 缓存记录类型
//!
//! 协调器与两级存储之间流转的记录结构；
//! Redis 中以 JSON 形式原样存储，Postgres 侧与实体互转

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Embedding 缓存记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    #[serde(default)]
    pub id: i32,
    #[serde(default)]
    pub input_hash: String,
    #[serde(default)]
    pub input_text: String,
    #[serde(default)]
    pub model_name: String,
    pub embedding: Vec<f64>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub token_count: Option<i32>,
    #[serde(default)]
    pub dimensions: Option<i32>,
    #[serde(default)]
    pub start_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub end_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub expire_at: Option<NaiveDateTime>,
}

impl EmbeddingRecord {
    /// 由起止时间推导耗时毫秒数
    #[must_use]
    pub fn derive_duration_ms(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// LLM 响应缓存记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRecord {
    #[serde(default)]
    pub id: i32,
    #[serde(default)]
    pub request_hash: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub request: Value,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
    pub response: Value,
    #[serde(default)]
    pub total_tokens: Option<i32>,
    #[serde(default)]
    pub prompt_tokens: Option<i32>,
    #[serde(default)]
    pub completion_tokens: Option<i32>,
    #[serde(default)]
    pub start_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub end_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub expire_at: Option<NaiveDateTime>,
}

impl Default for LlmRecord {
    fn default() -> Self {
        Self {
            id: 0,
            request_hash: String::new(),
            request_id: None,
            request: Value::Null,
            model_name: String::new(),
            temperature: None,
            max_tokens: None,
            response: Value::Null,
            total_tokens: None,
            prompt_tokens: None,
            completion_tokens: None,
            start_time: None,
            end_time: None,
            duration_ms: None,
            created_at: None,
            updated_at: None,
            expire_at: None,
        }
    }
}

impl LlmRecord {
    /// 由起止时间推导耗时毫秒数
    #[must_use]
    pub fn derive_duration_ms(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    /// 取出响应 JSON 的序列化字节
    #[must_use]
    pub fn response_bytes(&self) -> Vec<u8> {
        match &self.response {
            // 入库前已是字符串包装的非 JSON 文本，原样还原
            Value::String(text) => text.clone().into_bytes(),
            value => serde_json::to_vec(value).unwrap_or_default(),
        }
    }
}

impl From<entity::embedding_cache::Model> for EmbeddingRecord {
    fn from(model: entity::embedding_cache::Model) -> Self {
        Self {
            id: model.id,
            input_hash: model.input_hash,
            input_text: model.input_text,
            model_name: model.model_name,
            embedding: model.embedding,
            request_id: model.request_id,
            token_count: model.token_count,
            dimensions: model.dimensions,
            start_time: model.start_time,
            end_time: model.end_time,
            duration_ms: model.duration_ms,
            created_at: Some(model.created_at),
            updated_at: Some(model.updated_at),
            expire_at: model.expire_at,
        }
    }
}

impl From<entity::llm_cache::Model> for LlmRecord {
    fn from(model: entity::llm_cache::Model) -> Self {
        Self {
            id: model.id,
            request_hash: model.request_hash,
            request_id: model.request_id,
            request: model.request,
            model_name: model.model_name,
            temperature: model.temperature,
            max_tokens: model.max_tokens,
            response: model.response,
            total_tokens: model.total_tokens,
            prompt_tokens: model.prompt_tokens,
            completion_tokens: model.completion_tokens,
            start_time: model.start_time,
            end_time: model.end_time,
            duration_ms: model.duration_ms,
            created_at: Some(model.created_at),
            updated_at: Some(model.updated_at),
            expire_at: model.expire_at,
        }
    }
}
