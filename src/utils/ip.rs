//! # 地址分类与 DNS 缓存
//!
//! 判定目标主机是否落在内网地址段，并缓存解析结果 5 分钟；
//! 客户端真实 IP 按 `X-Real-IP` → `X-Forwarded-For` → 对端地址的顺序发现

use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// DNS 缓存条目有效期与清理周期
const DNS_CACHE_TTL: Duration = Duration::from_secs(300);

/// 判定 IPv4 地址是否属于内网段（RFC1918 + 回环）
///
/// 非 IPv4 地址一律视为公网
#[must_use]
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
                || octets[0] == 127
        }
        IpAddr::V6(_) => false,
    }
}

struct DnsCacheEntry {
    addresses: Vec<IpAddr>,
    captured_at: Instant,
}

/// 带过期的 DNS 解析缓存
pub struct DnsCache {
    entries: RwLock<HashMap<String, DnsCacheEntry>>,
}

impl DnsCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// 查缓存，过期条目视为未命中
    fn get_cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        let entries = self.entries.read().unwrap();
        entries.get(host).and_then(|entry| {
            (entry.captured_at.elapsed() < DNS_CACHE_TTL).then(|| entry.addresses.clone())
        })
    }

    fn store(&self, host: &str, addresses: Vec<IpAddr>) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            host.to_string(),
            DnsCacheEntry {
                addresses,
                captured_at: Instant::now(),
            },
        );
    }

    /// 带缓存的域名解析，解析失败向上传播
    pub async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        if let Some(addresses) = self.get_cached(host) {
            return Ok(addresses);
        }

        let addresses: Vec<IpAddr> = tokio::net::lookup_host((host, 0u16))
            .await?
            .map(|addr| addr.ip())
            .collect();

        self.store(host, addresses.clone());
        Ok(addresses)
    }

    /// 判定目标主机是否应走出站代理
    ///
    /// 任一解析地址落在内网段则直连；解析失败时默认走代理
    pub async fn should_use_proxy(&self, host: &str) -> bool {
        // 主机名本身就是 IP 时跳过解析
        if let Ok(ip) = host.parse::<IpAddr>() {
            return !is_private_ip(ip);
        }

        match self.lookup(host).await {
            Ok(addresses) => !addresses.iter().any(|ip| is_private_ip(*ip)),
            Err(e) => {
                lwarn!(
                    "system",
                    LogStage::Internal,
                    LogComponent::Dns,
                    "dns_lookup_failed",
                    &format!("域名解析失败, 默认走代理: {host}"),
                    error = %e
                );
                true
            }
        }
    }

    /// 清理过期条目
    pub fn cleanup_expired(&self) {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, entry| entry.captured_at.elapsed() < DNS_CACHE_TTL);
    }

    /// 启动后台清理任务，每 5 分钟扫一次
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DNS_CACHE_TTL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.cleanup_expired();
                ldebug!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::Dns,
                    "dns_cache_cleanup",
                    "DNS 缓存过期清理完成"
                );
            }
        });
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

/// 从请求头与对端地址中发现客户端 IP
///
/// 第一个非空值胜出，全部为空时回退到对端地址
#[must_use]
pub fn client_ip_from_headers(headers: &HeaderMap, peer_addr: &str) -> String {
    for name in ["x-real-ip", "x-forwarded-for"] {
        if let Some(value) = headers.get(name) {
            if let Ok(value) = value.to_str() {
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }
    }
    peer_addr.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_is_private_ip() {
        let cases = [
            ("10.0.0.1", true),
            ("10.255.255.255", true),
            ("172.16.0.1", true),
            ("172.31.255.254", true),
            ("172.32.0.1", false),
            ("172.15.0.1", false),
            ("192.168.1.1", true),
            ("127.0.0.1", true),
            ("8.8.8.8", false),
            ("100.64.0.1", false),
            ("::1", false),
        ];
        for (raw, expected) in cases {
            let ip: IpAddr = raw.parse().unwrap();
            assert_eq!(is_private_ip(ip), expected, "ip={raw}");
        }
    }

    #[test]
    fn test_client_ip_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("1.2.3.4"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("5.6.7.8"));
        assert_eq!(client_ip_from_headers(&headers, "9.9.9.9:1234"), "1.2.3.4");

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("5.6.7.8"));
        assert_eq!(client_ip_from_headers(&headers, "9.9.9.9:1234"), "5.6.7.8");

        let headers = HeaderMap::new();
        assert_eq!(
            client_ip_from_headers(&headers, "9.9.9.9:1234"),
            "9.9.9.9:1234"
        );
    }

    #[tokio::test]
    async fn test_dns_cache_stores_and_expires() {
        let cache = DnsCache::new();
        cache.store("example.test", vec!["10.0.0.1".parse().unwrap()]);
        assert_eq!(
            cache.get_cached("example.test"),
            Some(vec!["10.0.0.1".parse::<IpAddr>().unwrap()])
        );

        cache.cleanup_expired();
        assert!(cache.get_cached("example.test").is_some());
    }

    #[tokio::test]
    async fn test_should_use_proxy_for_ip_literals() {
        let cache = DnsCache::new();
        assert!(!cache.should_use_proxy("127.0.0.1").await);
        assert!(!cache.should_use_proxy("192.168.0.10").await);
        assert!(cache.should_use_proxy("8.8.8.8").await);
    }
}
