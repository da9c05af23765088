//! # 应用配置结构定义

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 应用主配置结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP 监听端口
    pub port: u16,
    /// 出站 HTTP 代理地址（可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    /// 速率限制配置，rate 与 burst 同时大于 0 才启用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    /// 是否记录请求/响应体
    #[serde(default)]
    pub log_body: bool,
    /// 路径 → 上游基地址映射，不在表中的路径返回 404
    pub target_map: HashMap<String, String>,
    /// 模型 → 上游地址路由，支持单地址与多地址轮询
    #[serde(default)]
    pub model_routes: HashMap<String, ModelRoute>,
    /// 模型别名 → 规范名映射
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
    /// 数据库配置，与 redis 一起缺省时禁用缓存
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,
    /// Redis 配置
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
}

/// 模型路由配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelRoute {
    /// 单个上游地址
    Single(String),
    /// 多个上游地址，轮询选取
    Multi { urls: Vec<String> },
}

/// 速率限制配置
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 每秒补充令牌数
    pub rate: u32,
    /// 突发容量
    pub burst: u32,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    #[serde(default = "default_sslmode")]
    pub sslmode: String,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u32,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: u32,
    /// 连接最大生命周期（秒）
    #[serde(default = "default_conn_max_lifetime")]
    pub conn_max_lifetime: u64,
}

fn default_sslmode() -> String {
    "disable".to_string()
}

const fn default_max_open_conns() -> u32 {
    20
}

const fn default_max_idle_conns() -> u32 {
    5
}

const fn default_conn_max_lifetime() -> u64 {
    1800
}

impl DatabaseConfig {
    /// 构建数据库连接 URL
    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.dbname, self.sslmode
        )
    }
}

/// Redis 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub addr: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: u8,
}

impl RedisConfig {
    /// 构建 Redis 连接 URL
    #[must_use]
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.addr, self.db)
        }
    }
}

impl AppConfig {
    /// 获取模型的 URL 列表，单地址与多地址统一返回列表
    #[must_use]
    pub fn model_urls(&self, model: &str) -> Option<Vec<String>> {
        match self.model_routes.get(model)? {
            ModelRoute::Single(url) => Some(vec![url.clone()]),
            ModelRoute::Multi { urls } => Some(urls.clone()),
        }
    }

    /// 是否启用速率限制
    #[must_use]
    pub fn has_rate_limit(&self) -> bool {
        self.rate_limit
            .is_some_and(|rl| rl.rate > 0 && rl.burst > 0)
    }

    /// 解析模型别名，未配置别名时原样返回
    #[must_use]
    pub fn resolve_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_aliases
            .get(model)
            .map_or(model, String::as_str)
    }

    /// 数据库与 Redis 是否都已配置
    #[must_use]
    pub fn has_storage(&self) -> bool {
        self.database.is_some() && self.redis.is_some()
    }
}
