//! # Redis 缓存层（一级缓存）
//!
//! 以 JSON 形式存取记录，TTL 固定 1 小时

use crate::config::RedisConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};

/// 一级缓存条目 TTL（秒）
pub const CACHE_TTL_SECONDS: u64 = 3600;

/// Redis 缓存客户端
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
}

impl RedisStore {
    /// 建立 Redis 连接
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Cache,
            "connect_to_redis",
            &format!("正在连接 Redis 服务器: {}", config.addr)
        );

        let client = Client::open(config.url())
            .map_err(|e| ProxyError::cache_with_source("创建 Redis 客户端失败", e))?;

        let connection_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| ProxyError::cache_with_source("建立 Redis 连接失败", e))?;

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Cache,
            "redis_connected",
            "Redis 连接建立成功"
        );

        Ok(Self { connection_manager })
    }

    /// 获取缓存值，键不存在时返回 None
    pub async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let mut conn = self.connection_manager.clone();

        let result: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| ProxyError::cache_with_source(format!("Redis GET 失败: {key}"), e))?;

        match result {
            Some(json_str) => {
                let value = serde_json::from_str(&json_str)
                    .map_err(|e| ProxyError::cache_with_source("反序列化缓存值失败", e))?;
                ldebug!(
                    "system",
                    LogStage::Cache,
                    LogComponent::Cache,
                    "cache_hit",
                    &format!("一级缓存命中: {key}")
                );
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 设置缓存值，固定 1 小时 TTL
    pub async fn set<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let json_value = serde_json::to_string(value)
            .map_err(|e| ProxyError::cache_with_source("序列化缓存值失败", e))?;

        let mut conn = self.connection_manager.clone();
        conn.set_ex::<_, _, ()>(key, json_value, CACHE_TTL_SECONDS)
            .await
            .map_err(|e| ProxyError::cache_with_source(format!("Redis SETEX 失败: {key}"), e))?;

        Ok(())
    }
}
