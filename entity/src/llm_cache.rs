//! # LLM 响应缓存实体定义
//!
//! 以完整请求体字节的 SHA-256 作为唯一键，精确缓存聊天补全响应

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// LLM 响应缓存实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "llm_cache")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// 请求指纹：原始请求体字节的 SHA-256 十六进制，任何字节差异都视为未命中
    #[sea_orm(column_type = "Char(Some(64))", unique)]
    pub request_hash: String,

    pub request_id: Option<String>,

    /// 原始请求 JSON
    #[sea_orm(column_type = "JsonBinary")]
    pub request: Json,

    pub model_name: String,

    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,

    /// 上游响应 JSON（若上游为 gzip，存储解压后的内容）
    #[sea_orm(column_type = "JsonBinary")]
    pub response: Json,

    // === Token 用量统计，缺失时保持 NULL ===
    pub total_tokens: Option<i32>,
    pub prompt_tokens: Option<i32>,
    pub completion_tokens: Option<i32>,

    // === 时间追踪 ===
    pub start_time: Option<DateTime>,
    pub end_time: Option<DateTime>,
    pub duration_ms: Option<i64>,

    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub expire_at: Option<DateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
