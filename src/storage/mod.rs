//! # 两级缓存存储模块
//!
//! Redis（一级，1 小时 TTL）读穿透到 Postgres（二级，持久），
//! 写入时先落库再尽力更新一级缓存；一级缓存故障永不影响读取结果

mod postgres_store;
mod records;
mod redis_store;

pub use postgres_store::PostgresStore;
pub use records::{EmbeddingRecord, LlmRecord};
pub use redis_store::{RedisStore, CACHE_TTL_SECONDS};

use crate::config::AppConfig;
use crate::database;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::utils::fingerprint;
use crate::{lerror, lwarn};
use async_trait::async_trait;

/// 缓存存储抽象，便于协调器测试时注入内存实现
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// 查询 Embedding 记录，未命中返回 None
    async fn get_embedding(
        &self,
        input_text: &str,
        model_name: &str,
        dimensions: Option<i32>,
    ) -> Result<Option<EmbeddingRecord>>;

    /// 写入或更新 Embedding 记录
    async fn upsert_embedding(&self, record: &EmbeddingRecord) -> Result<()>;

    /// 以原始请求体字节为键查询 LLM 记录，未命中返回 None
    async fn get_llm(&self, raw_request: &[u8], model_name: &str) -> Result<Option<LlmRecord>>;

    /// 写入或更新 LLM 记录
    async fn upsert_llm(&self, record: &LlmRecord) -> Result<()>;
}

/// 组合 Redis 与 Postgres 的两级存储
pub struct Storage {
    redis: RedisStore,
    postgres: PostgresStore,
}

impl Storage {
    /// 依据配置初始化两级存储，任一缺失或连接失败都返回错误
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let db_config = config
            .database
            .as_ref()
            .ok_or_else(|| ProxyError::config("缺少 database 配置"))?;
        let redis_config = config
            .redis
            .as_ref()
            .ok_or_else(|| ProxyError::config("缺少 redis 配置"))?;

        let db = database::init_database(db_config)
            .await
            .map_err(|e| ProxyError::database_with_source("数据库连接失败", e))?;
        database::run_migrations(&db)
            .await
            .map_err(|e| ProxyError::database_with_source("数据库迁移失败", e))?;

        let redis = RedisStore::new(redis_config).await?;

        Ok(Self {
            redis,
            postgres: PostgresStore::new(db),
        })
    }

    /// 后台回填一级缓存，失败只记日志
    fn backfill_tier1<T>(&self, key: String, value: &T)
    where
        T: serde::Serialize + Clone + Send + Sync + 'static,
    {
        let redis = self.redis.clone();
        let value = value.clone();
        tokio::spawn(async move {
            if let Err(e) = redis.set(&key, &value).await {
                lwarn!(
                    "system",
                    LogStage::Cache,
                    LogComponent::Storage,
                    "tier1_backfill_failed",
                    &format!("一级缓存回填失败: {key}"),
                    error = %e
                );
            }
        });
    }
}

#[async_trait]
impl CacheStorage for Storage {
    async fn get_embedding(
        &self,
        input_text: &str,
        model_name: &str,
        dimensions: Option<i32>,
    ) -> Result<Option<EmbeddingRecord>> {
        let hash = fingerprint::embedding_cache_key(input_text, model_name, dimensions);
        let key = format!("embedding:{hash}");

        match self.redis.get::<EmbeddingRecord>(&key).await {
            Ok(Some(record)) => return Ok(Some(record)),
            Ok(None) => {}
            Err(e) => {
                // 一级缓存故障降级到二级，不影响读取
                lwarn!(
                    "system",
                    LogStage::Cache,
                    LogComponent::Storage,
                    "tier1_get_failed",
                    &format!("Redis 查询失败, 降级到 Postgres: {key}"),
                    model = %model_name,
                    error = %e
                );
            }
        }

        let record = self.postgres.get_embedding(&hash, model_name).await.map_err(|e| {
            lerror!(
                "system",
                LogStage::Db,
                LogComponent::Storage,
                "tier2_get_failed",
                &format!("Postgres 查询 embedding 失败: {key}"),
                model = %model_name,
                error = %e
            );
            e
        })?;

        if let Some(record) = &record {
            self.backfill_tier1(key, record);
        }
        Ok(record)
    }

    async fn upsert_embedding(&self, record: &EmbeddingRecord) -> Result<()> {
        let mut record = record.clone();
        if record.input_hash.is_empty() {
            record.input_hash = fingerprint::embedding_cache_key(
                &record.input_text,
                &record.model_name,
                record.dimensions,
            );
        }
        record.duration_ms = record.derive_duration_ms();

        self.postgres.upsert_embedding(&record).await?;

        let key = format!("embedding:{}", record.input_hash);
        if let Err(e) = self.redis.set(&key, &record).await {
            // 落库已成功，一级缓存更新失败不向上传播
            lwarn!(
                "system",
                LogStage::Cache,
                LogComponent::Storage,
                "tier1_update_failed",
                &format!("落库后更新 Redis 失败: {key}"),
                model = %record.model_name,
                error = %e
            );
        }
        Ok(())
    }

    async fn get_llm(&self, raw_request: &[u8], model_name: &str) -> Result<Option<LlmRecord>> {
        let hash = fingerprint::llm_cache_key(raw_request);
        let key = format!("llm:{hash}");

        match self.redis.get::<LlmRecord>(&key).await {
            Ok(Some(record)) => return Ok(Some(record)),
            Ok(None) => {}
            Err(e) => {
                lwarn!(
                    "system",
                    LogStage::Cache,
                    LogComponent::Storage,
                    "tier1_get_failed",
                    &format!("Redis 查询失败, 降级到 Postgres: {key}"),
                    model = %model_name,
                    error = %e
                );
            }
        }

        let record = self.postgres.get_llm(&hash).await.map_err(|e| {
            lerror!(
                "system",
                LogStage::Db,
                LogComponent::Storage,
                "tier2_get_failed",
                &format!("Postgres 查询 llm 失败: {key}"),
                model = %model_name,
                error = %e
            );
            e
        })?;

        if let Some(record) = &record {
            self.backfill_tier1(key, record);
        }
        Ok(record)
    }

    async fn upsert_llm(&self, record: &LlmRecord) -> Result<()> {
        let mut record = record.clone();
        if record.request_hash.is_empty() {
            let request_bytes = serde_json::to_vec(&record.request).unwrap_or_default();
            record.request_hash = fingerprint::llm_cache_key(&request_bytes);
        }
        record.duration_ms = record.derive_duration_ms();

        self.postgres.upsert_llm(&record).await?;

        let key = format!("llm:{}", record.request_hash);
        if let Err(e) = self.redis.set(&key, &record).await {
            lwarn!(
                "system",
                LogStage::Cache,
                LogComponent::Storage,
                "tier1_update_failed",
                &format!("落库后更新 Redis 失败: {key}"),
                model = %record.model_name,
                error = %e
            );
        }
        Ok(())
    }
}
