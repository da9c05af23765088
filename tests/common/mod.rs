//! # 测试共用工具
//!
//! 内存版缓存存储与请求构造辅助
#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::response::Response;
use bytes::Bytes;
use llm_proxy::error::{ProxyError, Result};
use llm_proxy::storage::{CacheStorage, EmbeddingRecord, LlmRecord};
use llm_proxy::utils::fingerprint;
use llm_proxy::AppConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// 内存版两级存储替身
#[derive(Default)]
pub struct FakeStorage {
    embeddings: Mutex<HashMap<String, EmbeddingRecord>>,
    llm: Mutex<HashMap<String, LlmRecord>>,
    fail_gets: AtomicBool,
    upserted_embeddings: Mutex<Vec<EmbeddingRecord>>,
    upserted_llm: Mutex<Vec<LlmRecord>>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一条 embedding 缓存
    pub fn seed_embedding(
        &self,
        input_text: &str,
        model_name: &str,
        embedding: Vec<f64>,
        token_count: Option<i32>,
    ) {
        let key = fingerprint::embedding_cache_key(input_text, model_name, None);
        let record = EmbeddingRecord {
            input_hash: key.clone(),
            input_text: input_text.to_string(),
            model_name: model_name.to_string(),
            embedding,
            token_count,
            ..Default::default()
        };
        self.embeddings.lock().unwrap().insert(key, record);
    }

    /// 之后的所有查询都返回错误
    pub fn fail_gets(&self) {
        self.fail_gets.store(true, Ordering::SeqCst);
    }

    pub fn upserted_embeddings(&self) -> Vec<EmbeddingRecord> {
        self.upserted_embeddings.lock().unwrap().clone()
    }

    pub fn upserted_llm(&self) -> Vec<LlmRecord> {
        self.upserted_llm.lock().unwrap().clone()
    }

    pub fn llm_record_count(&self) -> usize {
        self.llm.lock().unwrap().len()
    }
}

#[async_trait]
impl CacheStorage for FakeStorage {
    async fn get_embedding(
        &self,
        input_text: &str,
        model_name: &str,
        dimensions: Option<i32>,
    ) -> Result<Option<EmbeddingRecord>> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(ProxyError::cache("fake storage failure"));
        }
        let key = fingerprint::embedding_cache_key(input_text, model_name, dimensions);
        Ok(self.embeddings.lock().unwrap().get(&key).cloned())
    }

    async fn upsert_embedding(&self, record: &EmbeddingRecord) -> Result<()> {
        let key = fingerprint::embedding_cache_key(
            &record.input_text,
            &record.model_name,
            record.dimensions,
        );
        self.embeddings
            .lock()
            .unwrap()
            .insert(key, record.clone());
        self.upserted_embeddings.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn get_llm(&self, raw_request: &[u8], _model_name: &str) -> Result<Option<LlmRecord>> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(ProxyError::cache("fake storage failure"));
        }
        let key = fingerprint::llm_cache_key(raw_request);
        Ok(self.llm.lock().unwrap().get(&key).cloned())
    }

    async fn upsert_llm(&self, record: &LlmRecord) -> Result<()> {
        self.llm
            .lock()
            .unwrap()
            .insert(record.request_hash.clone(), record.clone());
        self.upserted_llm.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// 由 YAML 片段构造配置
pub fn config_from_yaml(yaml: &str) -> AppConfig {
    serde_yaml::from_str(yaml).expect("parse test config")
}

/// 构造携带对端地址的请求
pub fn request_with_peer(method: &str, path: &str, body: Body) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .body(body)
        .expect("build request");
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 1234))));
    request
}

/// 读出完整响应体
pub async fn response_body(response: Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body")
}
