//! # 目标 URL 拼接缓存
//!
//! 基地址与请求路径的拼接结果按 `base|path` 记忆化；
//! 键空间来自配置，进程生命周期内有界，故缓存不做淘汰

use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};
use url::Url;

static URL_CACHE: LazyLock<RwLock<HashMap<String, Url>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// 拼接基地址与路径，保留基地址上的查询串与片段
pub fn join_target_url(base_url: &str, path: &str) -> Result<Url> {
    let cache_key = format!("{base_url}|{path}");

    if let Some(cached) = URL_CACHE.read().unwrap().get(&cache_key) {
        return Ok(cached.clone());
    }

    let mut target = Url::parse(base_url)
        .map_err(|e| ProxyError::config_with_source(format!("解析目标 URL 失败: {base_url}"), e))?;

    let joined = format!(
        "{}/{}",
        target.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if joined.starts_with('/') {
        target.set_path(&joined);
    } else {
        target.set_path(&format!("/{joined}"));
    }

    URL_CACHE
        .write()
        .unwrap()
        .insert(cache_key, target.clone());
    Ok(target)
}
