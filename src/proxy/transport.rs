//! # 上游传输选择器
//!
//! 启动时预构建直连与出站代理两套 HTTP 客户端，
//! 按目标主机解析出的地址段逐请求选择；内网目标永远直连

use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::utils::ip::DnsCache;
use crate::{linfo, lwarn};
use axum::http::{HeaderMap, HeaderValue, Method};
use bytes::Bytes;
use reqwest::{Client, ClientBuilder, Proxy};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// 上游请求整体时限，与客户端断连解耦后的唯一边界
pub const UPSTREAM_DEADLINE: Duration = Duration::from_secs(900);

/// 上游传输选择器
pub struct TransportSelector {
    direct: Client,
    proxied: Client,
    has_proxy: bool,
    dns_cache: Arc<DnsCache>,
}

impl TransportSelector {
    /// 构建两套客户端；未配置代理时两套等价
    pub fn new(proxy_url: Option<&str>, dns_cache: Arc<DnsCache>) -> Result<Self> {
        let direct = Self::base_builder()
            .no_proxy()
            .build()
            .map_err(|e| ProxyError::config_with_source("构建直连 HTTP 客户端失败", e))?;

        let (proxied, has_proxy) = match proxy_url {
            Some(proxy_url) if !proxy_url.is_empty() => {
                let proxy = Proxy::all(proxy_url).map_err(|e| {
                    ProxyError::config_with_source(format!("无效的出站代理: {proxy_url}"), e)
                })?;
                let client = Self::base_builder()
                    .proxy(proxy)
                    .build()
                    .map_err(|e| ProxyError::config_with_source("构建代理 HTTP 客户端失败", e))?;
                (client, true)
            }
            _ => {
                lwarn!(
                    "system",
                    LogStage::Startup,
                    LogComponent::Transport,
                    "proxy_url_empty",
                    "未配置出站代理, 全部直连"
                );
                (direct.clone(), false)
            }
        };

        Ok(Self {
            direct,
            proxied,
            has_proxy,
            dns_cache,
        })
    }

    /// 连接池参数对两套客户端一致
    fn base_builder() -> ClientBuilder {
        Client::builder()
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .timeout(UPSTREAM_DEADLINE)
            .redirect(reqwest::redirect::Policy::none())
    }

    /// 选择客户端：任一解析地址为内网时直连，否则在配置了代理时走代理
    async fn client_for(&self, host: &str) -> &Client {
        let use_proxy = self.has_proxy && self.dns_cache.should_use_proxy(host).await;
        if use_proxy {
            &self.proxied
        } else {
            &self.direct
        }
    }

    /// 发送上游请求
    ///
    /// 成功时把请求 ID 写回响应头；传输错误原样向上传播
    pub async fn send(
        &self,
        request_id: &str,
        method: Method,
        target_url: &Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let host = target_url.host_str().unwrap_or_default().to_string();
        let client = self.client_for(&host).await;

        let start_time = Instant::now();
        let result = client
            .request(method, target_url.as_str())
            .headers(headers)
            .body(body)
            .send()
            .await;
        let duration = start_time.elapsed();

        match result {
            Ok(mut response) => {
                linfo!(
                    request_id,
                    LogStage::UpstreamRequest,
                    LogComponent::Transport,
                    "upstream_response",
                    "收到上游响应",
                    status = response.status().as_u16(),
                    duration_ms = duration.as_millis() as u64
                );
                if let Ok(value) = HeaderValue::from_str(request_id) {
                    response.headers_mut().insert("x-request-id", value);
                }
                Ok(response)
            }
            Err(e) => {
                lwarn!(
                    request_id,
                    LogStage::UpstreamRequest,
                    LogComponent::Transport,
                    "transport_error",
                    "上游传输出错",
                    duration_ms = duration.as_millis() as u64,
                    error = %e
                );
                Err(ProxyError::bad_gateway_with_source("上游请求失败", e))
            }
        }
    }

    /// 错误是否为取消/超时一类（记警告而非错误）
    #[must_use]
    pub fn is_timeout_error(error: &ProxyError) -> bool {
        match error {
            ProxyError::BadGateway {
                source: Some(source),
                ..
            } => source
                .downcast_ref::<reqwest::Error>()
                .is_some_and(reqwest::Error::is_timeout),
            _ => false,
        }
    }
}
