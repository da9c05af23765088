//! # Postgres 持久层（二级缓存）
//!
//! 两张缓存表的查询与 insert-on-conflict-update 写入

use crate::error::{ProxyError, Result};
use crate::storage::records::{EmbeddingRecord, LlmRecord};
use chrono::Utc;
use entity::{embedding_cache, llm_cache};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};

/// Postgres 存储仓库
pub struct PostgresStore {
    db: DatabaseConnection,
}

impl PostgresStore {
    #[must_use]
    pub const fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// 按指纹查询 Embedding 记录
    pub async fn get_embedding(
        &self,
        input_hash: &str,
        model_name: &str,
    ) -> Result<Option<EmbeddingRecord>> {
        let found = embedding_cache::Entity::find()
            .filter(embedding_cache::Column::InputHash.eq(input_hash))
            .filter(embedding_cache::Column::ModelName.eq(model_name))
            .one(&self.db)
            .await
            .map_err(|e| ProxyError::database_with_source("查询 embedding_cache 失败", e))?;

        Ok(found.map(EmbeddingRecord::from))
    }

    /// 写入或更新 Embedding 记录，冲突键为 `(input_hash, model_name)`
    pub async fn upsert_embedding(&self, record: &EmbeddingRecord) -> Result<()> {
        let now = Utc::now().naive_utc();
        let active = embedding_cache::ActiveModel {
            input_hash: Set(record.input_hash.clone()),
            input_text: Set(record.input_text.clone()),
            model_name: Set(record.model_name.clone()),
            embedding: Set(record.embedding.clone()),
            request_id: Set(record.request_id.clone()),
            token_count: Set(record.token_count),
            dimensions: Set(record.dimensions),
            start_time: Set(record.start_time),
            end_time: Set(record.end_time),
            duration_ms: Set(record.derive_duration_ms()),
            created_at: Set(now),
            updated_at: Set(now),
            expire_at: Set(record.expire_at),
            ..Default::default()
        };

        embedding_cache::Entity::insert(active)
            .on_conflict(
                OnConflict::columns([
                    embedding_cache::Column::InputHash,
                    embedding_cache::Column::ModelName,
                ])
                .update_columns([
                    embedding_cache::Column::Embedding,
                    embedding_cache::Column::RequestId,
                    embedding_cache::Column::TokenCount,
                    embedding_cache::Column::Dimensions,
                    embedding_cache::Column::StartTime,
                    embedding_cache::Column::EndTime,
                    embedding_cache::Column::DurationMs,
                    embedding_cache::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|e| ProxyError::database_with_source("写入 embedding_cache 失败", e))?;

        Ok(())
    }

    /// 按请求指纹查询 LLM 记录
    pub async fn get_llm(&self, request_hash: &str) -> Result<Option<LlmRecord>> {
        let found = llm_cache::Entity::find()
            .filter(llm_cache::Column::RequestHash.eq(request_hash))
            .one(&self.db)
            .await
            .map_err(|e| ProxyError::database_with_source("查询 llm_cache 失败", e))?;

        Ok(found.map(LlmRecord::from))
    }

    /// 写入或更新 LLM 记录，冲突键为 `request_hash`
    pub async fn upsert_llm(&self, record: &LlmRecord) -> Result<()> {
        let now = Utc::now().naive_utc();
        let active = llm_cache::ActiveModel {
            request_hash: Set(record.request_hash.clone()),
            request_id: Set(record.request_id.clone()),
            request: Set(record.request.clone()),
            model_name: Set(record.model_name.clone()),
            temperature: Set(record.temperature),
            max_tokens: Set(record.max_tokens),
            response: Set(record.response.clone()),
            total_tokens: Set(record.total_tokens),
            prompt_tokens: Set(record.prompt_tokens),
            completion_tokens: Set(record.completion_tokens),
            start_time: Set(record.start_time),
            end_time: Set(record.end_time),
            duration_ms: Set(record.derive_duration_ms()),
            created_at: Set(now),
            updated_at: Set(now),
            expire_at: Set(record.expire_at),
            ..Default::default()
        };

        llm_cache::Entity::insert(active)
            .on_conflict(
                OnConflict::column(llm_cache::Column::RequestHash)
                    .update_columns([
                        llm_cache::Column::Response,
                        llm_cache::Column::RequestId,
                        llm_cache::Column::TotalTokens,
                        llm_cache::Column::PromptTokens,
                        llm_cache::Column::CompletionTokens,
                        llm_cache::Column::StartTime,
                        llm_cache::Column::EndTime,
                        llm_cache::Column::DurationMs,
                        llm_cache::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|e| ProxyError::database_with_source("写入 llm_cache 失败", e))?;

        Ok(())
    }
}
