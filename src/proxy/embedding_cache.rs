//! # Embedding 批量缓存协调器
//!
//! 代理前把批量输入拆成命中与未命中两部分，只把未命中子批发往上游；
//! 代理后按原始下标把上游结果与缓存命中合并回完整响应，并持久化新向量

use crate::logging::{LogComponent, LogStage};
use crate::storage::{CacheStorage, EmbeddingRecord};
use crate::utils::compression::{decompress_gzip, is_gzip_encoded};
use crate::{linfo, lwarn};
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// 请求级缓存旁路头
pub const EMBEDDING_CACHE_BYPASS_HEADER: &str = "x-embedding-cache-bypass";
/// 缓存结果响应头
pub const EMBEDDING_CACHE_HEADER: &str = "x-embedding-cache";

/// 单条输入在原始批次中的位置与内容
#[derive(Debug, Clone)]
pub struct EmbeddingInputMeta {
    pub index: usize,
    pub value: String,
}

/// 代理前阶段收集的拆分元数据，供代理后阶段合并
pub struct EmbeddingCacheMetadata {
    pub model: String,
    pub dimensions: Option<i32>,
    pub total: usize,
    pub hits: HashMap<usize, EmbeddingRecord>,
    pub misses: Vec<EmbeddingInputMeta>,
    pub original_was_array: bool,
    pub start_time: NaiveDateTime,
    pub request_id: String,
}

/// 代理前阶段的处理结果
pub enum EmbeddingPreOutcome {
    /// 全部命中，请求在此终结
    Terminal(Box<Response>),
    /// 部分或全部未命中，请求体已改写为未命中子批
    Rewritten {
        body: Bytes,
        meta: Box<EmbeddingCacheMetadata>,
    },
    /// 存储故障，标记 BYPASS 后按原请求代理
    Bypass,
    /// 本请求不参与缓存
    Skip,
}

/// 上游 embeddings 响应结构（部分字段）
#[derive(Debug, Default, Serialize, Deserialize)]
struct EmbeddingApiResponse {
    #[serde(default)]
    object: String,
    #[serde(default)]
    data: Vec<EmbeddingResponseDatum>,
    #[serde(default)]
    model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<EmbeddingUsage>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EmbeddingResponseDatum {
    #[serde(default)]
    object: String,
    #[serde(default)]
    index: usize,
    #[serde(default)]
    embedding: Vec<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EmbeddingUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prompt_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_tokens: Option<i64>,
}

/// Embedding 缓存协调器
pub struct EmbeddingCacheCoordinator {
    storage: Arc<dyn CacheStorage>,
}

impl EmbeddingCacheCoordinator {
    #[must_use]
    pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
        Self { storage }
    }

    /// 该请求是否参与 Embedding 缓存
    #[must_use]
    pub fn applies(&self, method: &Method, path: &str, headers: &HeaderMap) -> bool {
        if headers.contains_key(EMBEDDING_CACHE_BYPASS_HEADER) {
            return false;
        }
        method == Method::POST && path.contains("embeddings")
    }

    /// 代理前阶段：逐条查缓存并拆分命中/未命中
    pub async fn pre_proxy(&self, request_id: &str, body: &Bytes) -> EmbeddingPreOutcome {
        if body.is_empty() {
            return EmbeddingPreOutcome::Skip;
        }

        let mut payload: serde_json::Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                lwarn!(
                    request_id,
                    LogStage::Cache,
                    LogComponent::EmbeddingCache,
                    "request_parse_failed",
                    "解析 embedding 请求体失败, 跳过缓存",
                    error = %e
                );
                return EmbeddingPreOutcome::Skip;
            }
        };

        let model = payload
            .get("model")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        if model.is_empty() {
            return EmbeddingPreOutcome::Skip;
        }

        let dimensions = payload
            .get("dimensions")
            .and_then(serde_json::Value::as_i64)
            .map(|d| d as i32);

        let Some(input_raw) = payload.get("input") else {
            return EmbeddingPreOutcome::Skip;
        };

        let (inputs, original_was_array) = match extract_embedding_inputs(input_raw) {
            Ok(extracted) => extracted,
            Err(e) => {
                lwarn!(
                    request_id,
                    LogStage::Cache,
                    LogComponent::EmbeddingCache,
                    "input_normalize_failed",
                    "embedding 输入不合法, 跳过缓存",
                    error = %e
                );
                return EmbeddingPreOutcome::Skip;
            }
        };
        if inputs.is_empty() {
            return EmbeddingPreOutcome::Skip;
        }

        let mut hits: HashMap<usize, EmbeddingRecord> = HashMap::new();
        let mut misses: Vec<EmbeddingInputMeta> = Vec::new();
        for input in &inputs {
            match self
                .storage
                .get_embedding(&input.value, &model, dimensions)
                .await
            {
                Ok(Some(record)) => {
                    hits.insert(input.index, record);
                }
                Ok(None) => misses.push(input.clone()),
                Err(e) => {
                    lwarn!(
                        request_id,
                        LogStage::Cache,
                        LogComponent::EmbeddingCache,
                        "embedding_lookup_failed",
                        "embedding 缓存查询失败, 本请求旁路缓存",
                        model = %model,
                        error = %e
                    );
                    return EmbeddingPreOutcome::Bypass;
                }
            }
        }

        if misses.is_empty() {
            let response_payload =
                marshal_response_from_records(&model, request_id, &inputs, &hits);
            let Ok(response_bytes) = serde_json::to_vec(&response_payload) else {
                lwarn!(
                    request_id,
                    LogStage::Cache,
                    LogComponent::EmbeddingCache,
                    "hit_marshal_failed",
                    "序列化全命中响应失败, 回退到上游",
                    model = %model
                );
                return EmbeddingPreOutcome::Skip;
            };
            linfo!(
                request_id,
                LogStage::Cache,
                LogComponent::EmbeddingCache,
                "embedding_all_hit",
                "embedding 全部命中缓存",
                model = %model,
                hits = inputs.len()
            );
            return EmbeddingPreOutcome::Terminal(Box::new(hit_response(response_bytes)));
        }

        // 请求体改写为仅包含未命中的输入
        payload["input"] = build_miss_input_payload(&misses, original_was_array);
        let Ok(new_body) = serde_json::to_vec(&payload) else {
            lwarn!(
                request_id,
                LogStage::Cache,
                LogComponent::EmbeddingCache,
                "miss_marshal_failed",
                "序列化未命中子批失败, 跳过缓存",
                model = %model
            );
            return EmbeddingPreOutcome::Skip;
        };

        EmbeddingPreOutcome::Rewritten {
            body: Bytes::from(new_body),
            meta: Box::new(EmbeddingCacheMetadata {
                model,
                dimensions,
                total: inputs.len(),
                hits,
                misses,
                original_was_array,
                start_time: chrono::Utc::now().naive_utc(),
                request_id: request_id.to_string(),
            }),
        }
    }

    /// 代理后阶段：持久化上游新向量并按原始下标合并响应
    ///
    /// 返回客户端可见的响应体字节
    pub async fn post_proxy(
        &self,
        meta: &EmbeddingCacheMetadata,
        status: StatusCode,
        headers: &mut HeaderMap,
        body: Bytes,
    ) -> Bytes {
        if status != StatusCode::OK || body.is_empty() {
            headers.insert(EMBEDDING_CACHE_HEADER, HeaderValue::from_static("MISS"));
            return body;
        }

        let mut decompressed = body.clone();
        if is_gzip_encoded(headers) {
            match decompress_gzip(&body) {
                Ok(bytes) => {
                    decompressed = Bytes::from(bytes);
                    headers.remove(header::CONTENT_ENCODING);
                }
                Err(e) => {
                    lwarn!(
                        meta.request_id,
                        LogStage::Response,
                        LogComponent::EmbeddingCache,
                        "gzip_decompress_failed",
                        "解压 embedding 响应失败, 原样转发",
                        error = %e
                    );
                    headers.insert(EMBEDDING_CACHE_HEADER, HeaderValue::from_static("MISS"));
                    return body;
                }
            }
        }

        let payload: EmbeddingApiResponse = match serde_json::from_slice(&decompressed) {
            Ok(payload) => payload,
            Err(e) => {
                lwarn!(
                    meta.request_id,
                    LogStage::Response,
                    LogComponent::EmbeddingCache,
                    "response_parse_failed",
                    "解析 embedding 响应失败, 原样转发",
                    error = %e
                );
                headers.insert(EMBEDDING_CACHE_HEADER, HeaderValue::from_static("MISS"));
                set_content_length(headers, decompressed.len());
                return decompressed;
            }
        };

        let end_time = chrono::Utc::now().naive_utc();

        // 上游按未命中子批的顺序返回, data[k].index == k；
        // 通过记录的 miss 顺序映射回原始下标
        let mut new_records: HashMap<usize, EmbeddingRecord> = HashMap::new();
        for (position, item) in payload.data.iter().enumerate() {
            let miss = meta
                .misses
                .get(position)
                .or_else(|| meta.misses.get(item.index));
            let Some(miss) = miss else {
                continue;
            };

            let record = EmbeddingRecord {
                input_text: miss.value.clone(),
                model_name: meta.model.clone(),
                embedding: item.embedding.clone(),
                request_id: Some(meta.request_id.clone()),
                dimensions: meta.dimensions,
                start_time: Some(meta.start_time),
                end_time: Some(end_time),
                ..Default::default()
            };

            if let Err(e) = self.storage.upsert_embedding(&record).await {
                // 持久化失败不影响合并结果
                lwarn!(
                    meta.request_id,
                    LogStage::Cache,
                    LogComponent::EmbeddingCache,
                    "embedding_persist_failed",
                    "embedding 缓存写入失败",
                    model = %meta.model,
                    error = %e
                );
            }
            new_records.insert(miss.index, record);
        }

        // 按原始下标合并命中与新增记录
        let data_object = payload
            .data
            .first()
            .map(|datum| datum.object.clone())
            .filter(|object| !object.is_empty())
            .unwrap_or_else(|| "embedding".to_string());

        let mut combined = Vec::with_capacity(meta.total);
        let mut total_tokens: i64 = 0;
        for index in 0..meta.total {
            let record = meta.hits.get(&index).or_else(|| new_records.get(&index));
            let Some(record) = record else {
                continue;
            };
            combined.push(EmbeddingResponseDatum {
                object: data_object.clone(),
                index,
                embedding: record.embedding.clone(),
            });
            if let Some(token_count) = record.token_count {
                total_tokens += i64::from(token_count);
            }
        }
        if let Some(upstream_total) = payload.usage.as_ref().and_then(|usage| usage.total_tokens) {
            total_tokens += upstream_total;
        }

        let combined_payload = EmbeddingApiResponse {
            object: payload.object,
            data: combined,
            model: if payload.model.trim().is_empty() {
                meta.model.clone()
            } else {
                payload.model
            },
            usage: (total_tokens > 0).then_some(EmbeddingUsage {
                prompt_tokens: None,
                total_tokens: Some(total_tokens),
            }),
            id: payload.id,
        };

        let Ok(final_bytes) = serde_json::to_vec(&combined_payload) else {
            lwarn!(
                meta.request_id,
                LogStage::Response,
                LogComponent::EmbeddingCache,
                "combined_marshal_failed",
                "序列化合并响应失败, 原样转发"
            );
            headers.insert(EMBEDDING_CACHE_HEADER, HeaderValue::from_static("MISS"));
            set_content_length(headers, decompressed.len());
            return decompressed;
        };

        let cache_status = if !meta.hits.is_empty() && !new_records.is_empty() {
            "PARTIAL"
        } else if !meta.hits.is_empty() {
            "HIT"
        } else {
            "MISS"
        };
        headers.insert(
            EMBEDDING_CACHE_HEADER,
            HeaderValue::from_str(cache_status).unwrap_or(HeaderValue::from_static("MISS")),
        );
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        set_content_length(headers, final_bytes.len());

        linfo!(
            meta.request_id,
            LogStage::Response,
            LogComponent::EmbeddingCache,
            "embedding_merged",
            "embedding 未命中子批已合并",
            model = %meta.model,
            cache_status = cache_status,
            hits = meta.hits.len(),
            misses = new_records.len()
        );

        Bytes::from(final_bytes)
    }
}

fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
}

/// 缓存命中时的终结响应
fn hit_response(response_bytes: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(response_bytes));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response.headers_mut().insert(
        EMBEDDING_CACHE_HEADER,
        HeaderValue::from_static("HIT"),
    );
    response
}

/// 归一化 input 字段：仅接受字符串或字符串数组
fn extract_embedding_inputs(
    raw: &serde_json::Value,
) -> Result<(Vec<EmbeddingInputMeta>, bool), String> {
    match raw {
        serde_json::Value::String(value) => Ok((
            vec![EmbeddingInputMeta {
                index: 0,
                value: value.clone(),
            }],
            false,
        )),
        serde_json::Value::Array(items) => {
            let mut inputs = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let serde_json::Value::String(value) = item else {
                    return Err(format!(
                        "input 仅支持字符串或字符串数组, 第 {index} 项类型不符"
                    ));
                };
                inputs.push(EmbeddingInputMeta {
                    index,
                    value: value.clone(),
                });
            }
            Ok((inputs, true))
        }
        _ => Err("input 仅支持字符串或字符串数组".to_string()),
    }
}

/// 构建未命中子批的 input 负载
///
/// 原始输入是单字符串且恰好一条未命中时保持单字符串形态
fn build_miss_input_payload(
    misses: &[EmbeddingInputMeta],
    original_was_array: bool,
) -> serde_json::Value {
    if !original_was_array && misses.len() == 1 {
        return serde_json::Value::String(misses[0].value.clone());
    }
    serde_json::Value::Array(
        misses
            .iter()
            .map(|miss| serde_json::Value::String(miss.value.clone()))
            .collect(),
    )
}

/// 全命中时按原始下标合成上游形态的响应
fn marshal_response_from_records(
    model: &str,
    request_id: &str,
    inputs: &[EmbeddingInputMeta],
    hits: &HashMap<usize, EmbeddingRecord>,
) -> EmbeddingApiResponse {
    let mut data = Vec::with_capacity(inputs.len());
    let mut total_tokens: i64 = 0;
    for input in inputs {
        let Some(record) = hits.get(&input.index) else {
            continue;
        };
        data.push(EmbeddingResponseDatum {
            object: "embedding".to_string(),
            index: input.index,
            embedding: record.embedding.clone(),
        });
        if let Some(token_count) = record.token_count {
            total_tokens += i64::from(token_count);
        }
    }

    EmbeddingApiResponse {
        object: "list".to_string(),
        data,
        model: model.to_string(),
        usage: (total_tokens > 0).then_some(EmbeddingUsage {
            prompt_tokens: Some(total_tokens),
            total_tokens: Some(total_tokens),
        }),
        id: format!("emb-cache-{request_id}"),
    }
}
