//! # Embedding 缓存实体定义
//!
//! 按 `(input_hash, model_name)` 唯一存储每条输入文本的向量结果

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Embedding 缓存实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "embedding_cache")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// 输入指纹：`sha256(input_text|model_name[|dimensions])` 的十六进制
    #[sea_orm(column_type = "Char(Some(64))")]
    pub input_hash: String,

    /// 原始输入文本，便于排查
    #[sea_orm(column_type = "Text")]
    pub input_text: String,

    pub model_name: String,

    /// 向量本体，长度不限
    pub embedding: Vec<f64>,

    // === 请求溯源信息 ===
    pub request_id: Option<String>,
    pub token_count: Option<i32>,
    pub dimensions: Option<i32>,

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
