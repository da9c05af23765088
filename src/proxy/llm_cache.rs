//! # LLM 响应缓存协调器
//!
//! 以完整请求体字节为键缓存聊天补全响应：
//! 代理前查缓存命中直接回包，代理后解压、提取用量并落库；
//! 流式请求完全绕过缓存

use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::storage::{CacheStorage, LlmRecord};
use crate::utils::compression::decompress_gzip;
use crate::utils::fingerprint;
use crate::utils::json::ensure_json_value;
use crate::{linfo, lwarn};
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::NaiveDateTime;
use std::sync::Arc;

/// 请求级缓存旁路头
pub const LLM_CACHE_BYPASS_HEADER: &str = "x-llm-cache-bypass";
/// 缓存结果响应头
pub const LLM_CACHE_HEADER: &str = "x-llm-cache";

/// 代理前阶段收集的缓存元数据，供代理后阶段落库
pub struct LlmCacheMetadata {
    pub prompt: Bytes,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    pub stream: bool,
    pub start_time: NaiveDateTime,
    pub request_id: String,
}

/// 代理前阶段的处理结果
pub enum LlmPreOutcome {
    /// 缓存命中，请求在此终结
    Terminal(Box<Response>),
    /// 未命中，携带元数据继续代理
    Cacheable(LlmCacheMetadata),
    /// 本请求不参与缓存
    Skip,
}

/// LLM 缓存协调器
pub struct LlmCacheCoordinator {
    storage: Arc<dyn CacheStorage>,
}

impl LlmCacheCoordinator {
    #[must_use]
    pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
        Self { storage }
    }

    /// 该请求是否参与 LLM 缓存
    #[must_use]
    pub fn applies(&self, method: &Method, path: &str, headers: &HeaderMap) -> bool {
        if headers.contains_key(LLM_CACHE_BYPASS_HEADER) {
            return false;
        }
        path == "/chat/completions" && method == Method::POST
    }

    /// 代理前阶段：查缓存，命中即终结请求
    pub async fn pre_proxy(&self, request_id: &str, body: &Bytes) -> LlmPreOutcome {
        if body.is_empty() {
            return LlmPreOutcome::Skip;
        }

        let payload: Option<serde_json::Value> = match serde_json::from_slice(body) {
            Ok(value) => Some(value),
            Err(e) => {
                lwarn!(
                    request_id,
                    LogStage::Cache,
                    LogComponent::LlmCache,
                    "request_parse_failed",
                    "解析请求体失败, 跳过 LLM 缓存",
                    error = %e
                );
                None
            }
        };

        let Some(payload) = payload else {
            return LlmPreOutcome::Skip;
        };

        // stream 字段缺失视为可缓存，非布尔值视为不可缓存
        match payload.get("stream") {
            None => {}
            Some(serde_json::Value::Bool(false)) => {}
            Some(serde_json::Value::Bool(true)) => return LlmPreOutcome::Skip,
            Some(_) => return LlmPreOutcome::Skip,
        }

        let model = payload
            .get("model")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        if model.is_empty() {
            return LlmPreOutcome::Skip;
        }

        let temperature = payload
            .get("temperature")
            .and_then(serde_json::Value::as_f64)
            .map(|t| t as f32);
        let max_tokens = payload
            .get("max_tokens")
            .and_then(serde_json::Value::as_i64)
            .map(|t| t as i32);

        match self.storage.get_llm(body, &model).await {
            Ok(Some(record)) => {
                let response_bytes = record.response_bytes();
                if !response_bytes.is_empty() {
                    linfo!(
                        request_id,
                        LogStage::Cache,
                        LogComponent::LlmCache,
                        "llm_cache_hit",
                        "LLM 缓存命中, 直接返回",
                        model = %model
                    );
                    return LlmPreOutcome::Terminal(Box::new(hit_response(response_bytes)));
                }
            }
            Ok(None) => {}
            Err(e) => {
                // 存储故障按未命中处理
                lwarn!(
                    request_id,
                    LogStage::Cache,
                    LogComponent::LlmCache,
                    "llm_cache_lookup_failed",
                    "LLM 缓存查询失败, 按未命中处理",
                    model = %model,
                    error = %e
                );
            }
        }

        LlmPreOutcome::Cacheable(LlmCacheMetadata {
            prompt: body.clone(),
            model,
            temperature,
            max_tokens,
            stream: false,
            start_time: chrono::Utc::now().naive_utc(),
            request_id: request_id.to_string(),
        })
    }

    /// 代理后阶段：标记 MISS、校正 Content-Length、解压并落库
    ///
    /// 客户端可见的响应体保持上游原样（gzip 时仍是 gzip 字节）
    pub async fn post_proxy(
        &self,
        meta: &LlmCacheMetadata,
        status: StatusCode,
        headers: &mut HeaderMap,
        body: &Bytes,
    ) {
        if meta.stream {
            return;
        }

        headers.insert(LLM_CACHE_HEADER, HeaderValue::from_static("MISS"));

        if status != StatusCode::OK {
            return;
        }

        if body.is_empty() {
            headers.remove(header::CONTENT_LENGTH);
        } else {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        }

        let mut body_to_store = body.to_vec();
        if crate::utils::compression::is_gzip_encoded(headers) {
            match decompress_gzip(body) {
                Ok(decompressed) => body_to_store = decompressed,
                Err(e) => {
                    lwarn!(
                        meta.request_id,
                        LogStage::Response,
                        LogComponent::LlmCache,
                        "gzip_decompress_failed",
                        "解压上游响应失败, 按原始字节落库",
                        model = %meta.model,
                        error = %e
                    );
                }
            }
        }

        let Ok(body_text) = std::str::from_utf8(&body_to_store) else {
            lwarn!(
                meta.request_id,
                LogStage::Response,
                LogComponent::LlmCache,
                "response_not_utf8",
                "响应不是合法 UTF-8, 跳过缓存",
                model = %meta.model
            );
            return;
        };

        let (total_tokens, prompt_tokens, completion_tokens) = extract_usage(body_text);

        let prompt_text = String::from_utf8_lossy(&meta.prompt);
        let record = LlmRecord {
            request_hash: fingerprint::llm_cache_key(&meta.prompt),
            request_id: Some(meta.request_id.clone()),
            request: ensure_json_value(&prompt_text),
            model_name: meta.model.clone(),
            temperature: meta.temperature,
            max_tokens: meta.max_tokens,
            response: ensure_json_value(body_text),
            total_tokens,
            prompt_tokens,
            completion_tokens,
            start_time: Some(meta.start_time),
            end_time: Some(chrono::Utc::now().naive_utc()),
            ..Default::default()
        };

        if let Err(e) = self.store_record(&record).await {
            lwarn!(
                meta.request_id,
                LogStage::Cache,
                LogComponent::LlmCache,
                "llm_cache_store_failed",
                "写入 LLM 缓存失败",
                model = %meta.model,
                error = %e
            );
        } else {
            linfo!(
                meta.request_id,
                LogStage::Cache,
                LogComponent::LlmCache,
                "llm_cache_stored",
                "响应已写入 LLM 缓存",
                model = %meta.model
            );
        }
    }

    async fn store_record(&self, record: &LlmRecord) -> Result<()> {
        self.storage.upsert_llm(record).await
    }
}

/// 缓存命中时的终结响应
fn hit_response(response_bytes: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(response_bytes));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
        .headers_mut()
        .insert(LLM_CACHE_HEADER, HeaderValue::from_static("HIT"));
    response
}

/// 尽力解析 usage 字段，缺失保持 None
fn extract_usage(body_text: &str) -> (Option<i32>, Option<i32>, Option<i32>) {
    let Ok(payload) = serde_json::from_str::<serde_json::Value>(body_text) else {
        return (None, None, None);
    };
    let Some(usage) = payload.get("usage") else {
        return (None, None, None);
    };

    let pick = |key: &str| {
        usage
            .get(key)
            .and_then(serde_json::Value::as_i64)
            .map(|v| v as i32)
    };
    (
        pick("total_tokens"),
        pick("prompt_tokens"),
        pick("completion_tokens"),
    )
}
