//! # 负载均衡器
//!
//! 每个模型持有一份固定 URL 列表，原子计数器驱动轮询选取

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// 轮询负载均衡器
///
/// `next()` 无锁；读写锁只保护 URL 列表的整体替换（启动后不再使用）
pub struct RoundRobinLoadBalancer {
    urls: RwLock<Vec<String>>,
    counter: AtomicU64,
}

impl RoundRobinLoadBalancer {
    #[must_use]
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls: RwLock::new(urls),
            counter: AtomicU64::new(0),
        }
    }

    /// 取下一个 URL，列表为空时返回空字符串
    #[must_use]
    pub fn next(&self) -> String {
        let urls = self.urls.read().unwrap();
        if urls.is_empty() {
            return String::new();
        }

        let current = self.counter.fetch_add(1, Ordering::Relaxed);
        let index = (current % urls.len() as u64) as usize;
        urls[index].clone()
    }

    /// 当前 URL 列表快照
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.urls.read().unwrap().clone()
    }
}

/// 按模型名管理负载均衡器
pub struct LoadBalancerManager {
    balancers: RwLock<HashMap<String, RoundRobinLoadBalancer>>,
}

impl LoadBalancerManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            balancers: RwLock::new(HashMap::new()),
        }
    }

    /// 为指定键注册负载均衡器
    pub fn add(&self, key: &str, urls: Vec<String>) {
        let mut balancers = self.balancers.write().unwrap();
        balancers.insert(key.to_string(), RoundRobinLoadBalancer::new(urls));
    }

    /// 取指定键的下一个 URL，键不存在或列表为空时返回 None
    #[must_use]
    pub fn next_for(&self, key: &str) -> Option<String> {
        let balancers = self.balancers.read().unwrap();
        let url = balancers.get(key)?.next();
        (!url.is_empty()).then_some(url)
    }
}

impl Default for LoadBalancerManager {
    fn default() -> Self {
        Self::new()
    }
}
