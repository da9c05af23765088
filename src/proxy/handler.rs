//! # 代理处理器
//!
//! 每个请求的状态机：请求 ID 注入 → 限流 → 路径校验 →
//! 缓存协调器前置阶段 → 路由策略选上游 → 上游转发（与客户端断连解耦）→
//! 缓存协调器后置阶段 → 回包

use crate::config::AppConfig;
use crate::logging::{LogComponent, LogStage};
use crate::proxy::embedding_cache::{
    EmbeddingCacheCoordinator, EmbeddingCacheMetadata, EmbeddingPreOutcome,
    EMBEDDING_CACHE_HEADER,
};
use crate::proxy::llm_cache::{LlmCacheCoordinator, LlmCacheMetadata, LlmPreOutcome};
use crate::proxy::loadbalancer::LoadBalancerManager;
use crate::proxy::rate_limit::IpRateLimiter;
use crate::proxy::strategy::{DefaultStrategy, ModelSpecifyStrategy, RouteRequest, RouteStrategy};
use crate::proxy::transport::TransportSelector;
use crate::storage::CacheStorage;
use crate::utils::ip::{client_ip_from_headers, DnsCache};
use crate::{ldebug, lerror, linfo, lwarn};
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// 请求 ID 头
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// 代理处理器
pub struct ProxyHandler {
    config: Arc<AppConfig>,
    lb_manager: Arc<LoadBalancerManager>,
    strategies: Vec<Box<dyn RouteStrategy>>,
    transport: Arc<TransportSelector>,
    dns_cache: Arc<DnsCache>,
    rate_limiter: Option<IpRateLimiter>,
    llm_cache: Option<LlmCacheCoordinator>,
    embedding_cache: Option<EmbeddingCacheCoordinator>,
}

impl ProxyHandler {
    /// 创建代理处理器；storage 为 None 时两类缓存都被禁用
    pub fn new(
        config: Arc<AppConfig>,
        storage: Option<Arc<dyn CacheStorage>>,
    ) -> crate::error::Result<Arc<Self>> {
        let dns_cache = Arc::new(DnsCache::new());
        let transport = Arc::new(TransportSelector::new(
            config.proxy_url.as_deref(),
            Arc::clone(&dns_cache),
        )?);
        let lb_manager = Arc::new(LoadBalancerManager::new());

        let strategies: Vec<Box<dyn RouteStrategy>> = vec![
            Box::new(ModelSpecifyStrategy::new(
                Arc::clone(&lb_manager),
                Arc::clone(&config),
            )),
            Box::new(DefaultStrategy),
        ];

        let rate_limiter = IpRateLimiter::from_config(config.rate_limit);
        let llm_cache = storage.clone().map(LlmCacheCoordinator::new);
        let embedding_cache = storage.map(EmbeddingCacheCoordinator::new);

        Ok(Arc::new(Self {
            config,
            lb_manager,
            strategies,
            transport,
            dns_cache,
            rate_limiter,
            llm_cache,
            embedding_cache,
        }))
    }

    /// 依据配置注册各模型的负载均衡器
    pub fn init_load_balancers(&self) {
        for model in self.config.model_routes.keys() {
            if let Some(urls) = self.config.model_urls(model) {
                self.lb_manager.add(model, urls.clone());
                linfo!(
                    "system",
                    LogStage::Startup,
                    LogComponent::LoadBalancer,
                    "lb_initialized",
                    "已初始化模型负载均衡器",
                    model = %model,
                    urls = ?urls
                );
            }
        }
    }

    /// 启动 DNS 缓存清理等后台任务
    pub fn start_background_tasks(self: &Arc<Self>) {
        self.dns_cache.start_cleanup_task();
    }

    /// 构建 axum 路由：所有路径都落到同一个代理入口
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().fallback(proxy_entry).with_state(self)
    }

    async fn handle(self: Arc<Self>, request: Request) -> Response {
        let (mut parts, body) = request.into_parts();

        let request_id = get_or_generate_request_id(&mut parts.headers);
        let peer_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.to_string())
            .unwrap_or_default();
        let client_ip = client_ip_from_headers(&parts.headers, &peer_addr);
        let path = parts.uri.path().to_string();

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.allow(&client_ip) {
                lwarn!(
                    request_id,
                    LogStage::RequestStart,
                    LogComponent::RateLimit,
                    "rate_limit_exceeded",
                    "触发速率限制",
                    client_ip = %client_ip
                );
                return finalize(
                    plain_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests"),
                    &request_id,
                );
            }
        }

        linfo!(
            request_id,
            LogStage::RequestStart,
            LogComponent::Proxy,
            "request_received",
            "收到请求",
            client_ip = %client_ip,
            method = %parts.method,
            path = %path
        );

        let Some(base_url) = self.config.target_map.get(&path).cloned() else {
            lwarn!(
                request_id,
                LogStage::RequestStart,
                LogComponent::Proxy,
                "path_not_found",
                "路径未配置, 返回 404",
                method = %parts.method,
                path = %path
            );
            return finalize(plain_response(StatusCode::NOT_FOUND, "404 page not found"), &request_id);
        };

        // 缓存与路由都需要完整请求体，读失败时按空体继续代理
        let mut body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                lwarn!(
                    request_id,
                    LogStage::RequestStart,
                    LogComponent::Proxy,
                    "request_body_read_failed",
                    "读取请求体失败",
                    error = %e
                );
                Bytes::new()
            }
        };

        if self.config.log_body {
            linfo!(
                request_id,
                LogStage::RequestStart,
                LogComponent::Proxy,
                "request_body",
                "请求体内容",
                request_body = %String::from_utf8_lossy(&body_bytes)
            );
        }

        let mut embedding_meta: Option<Box<EmbeddingCacheMetadata>> = None;
        let mut embedding_bypass = false;
        if let Some(coordinator) = &self.embedding_cache {
            if coordinator.applies(&parts.method, &path, &parts.headers) {
                match coordinator.pre_proxy(&request_id, &body_bytes).await {
                    EmbeddingPreOutcome::Terminal(response) => {
                        return finalize(*response, &request_id);
                    }
                    EmbeddingPreOutcome::Rewritten { body, meta } => {
                        body_bytes = body;
                        embedding_meta = Some(meta);
                    }
                    EmbeddingPreOutcome::Bypass => embedding_bypass = true,
                    EmbeddingPreOutcome::Skip => {}
                }
            }
        }

        let mut llm_meta: Option<LlmCacheMetadata> = None;
        if let Some(coordinator) = &self.llm_cache {
            if coordinator.applies(&parts.method, &path, &parts.headers) {
                match coordinator.pre_proxy(&request_id, &body_bytes).await {
                    LlmPreOutcome::Terminal(response) => {
                        return finalize(*response, &request_id);
                    }
                    LlmPreOutcome::Cacheable(meta) => llm_meta = Some(meta),
                    LlmPreOutcome::Skip => {}
                }
            }
        }

        // 上游转发与缓存落库和客户端断连解耦：
        // 客户端中途离开也要把上游响应读完并写入缓存
        let handler = Arc::clone(&self);
        let upstream_task = tokio::spawn(async move {
            handler
                .dispatch_upstream(DispatchContext {
                    parts,
                    body_bytes,
                    path,
                    base_url,
                    request_id: request_id.clone(),
                    llm_meta,
                    embedding_meta,
                    embedding_bypass,
                })
                .await
        });

        match upstream_task.await {
            Ok(response) => response,
            Err(e) => {
                lerror!(
                    "system",
                    LogStage::ResponseFailure,
                    LogComponent::Proxy,
                    "upstream_task_failed",
                    "上游转发任务异常退出",
                    error = %e
                );
                plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    async fn dispatch_upstream(self: Arc<Self>, ctx: DispatchContext) -> Response {
        let DispatchContext {
            parts,
            mut body_bytes,
            path,
            base_url,
            request_id,
            llm_meta,
            embedding_meta,
            embedding_bypass,
        } = ctx;

        let target_url = {
            let mut route_request = RouteRequest {
                request_id: &request_id,
                method: &parts.method,
                path: &path,
                body: &mut body_bytes,
            };
            let strategy = self
                .strategies
                .iter()
                .find(|strategy| strategy.applies(&path));
            match strategy {
                Some(strategy) => match strategy.target_url(&mut route_request, &base_url) {
                    Ok(url) => url,
                    Err(e) => {
                        lerror!(
                            request_id,
                            LogStage::RequestModify,
                            LogComponent::Strategy,
                            "strategy_failed",
                            "路由策略产出上游 URL 失败",
                            path = %path,
                            error = %e
                        );
                        return finalize(
                            plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway"),
                            &request_id,
                        );
                    }
                },
                None => {
                    return finalize(
                        plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway"),
                        &request_id,
                    );
                }
            }
        };

        ldebug!(
            request_id,
            LogStage::UpstreamRequest,
            LogComponent::Proxy,
            "upstream_dispatch",
            "转发到上游",
            target = %target_url
        );

        let upstream_headers = filter_request_headers(&parts.headers);
        let result = self
            .transport
            .send(
                &request_id,
                parts.method.clone(),
                &target_url,
                upstream_headers,
                body_bytes,
            )
            .await;

        let upstream = match result {
            Ok(upstream) => upstream,
            Err(e) => {
                // 取消/超时是常见情况，记警告即可
                if TransportSelector::is_timeout_error(&e) {
                    lwarn!(
                        request_id,
                        LogStage::ResponseFailure,
                        LogComponent::Proxy,
                        "upstream_timeout",
                        "上游请求超时或被取消",
                        error = %e
                    );
                } else {
                    lerror!(
                        request_id,
                        LogStage::ResponseFailure,
                        LogComponent::Proxy,
                        "upstream_error",
                        "上游请求失败",
                        error = %e
                    );
                }
                return finalize(
                    plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway"),
                    &request_id,
                );
            }
        };

        let status = upstream.status();
        let mut response_headers = filter_response_headers(upstream.headers());

        // 协调器后置阶段或请求体日志需要完整响应体；其余情况流式透传
        let needs_buffering =
            llm_meta.is_some() || embedding_meta.is_some() || self.config.log_body;
        if !needs_buffering {
            if embedding_bypass {
                response_headers
                    .insert(EMBEDDING_CACHE_HEADER, HeaderValue::from_static("BYPASS"));
            }
            let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
            *response.status_mut() = status;
            *response.headers_mut() = response_headers;
            return finalize(response, &request_id);
        }

        let upstream_body = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                lwarn!(
                    request_id,
                    LogStage::ResponseFailure,
                    LogComponent::Proxy,
                    "response_body_read_failed",
                    "读取上游响应体失败",
                    error = %e
                );
                return finalize(
                    plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway"),
                    &request_id,
                );
            }
        };

        let client_body = match (embedding_meta.as_deref(), self.embedding_cache.as_ref()) {
            (Some(meta), Some(coordinator)) => {
                coordinator
                    .post_proxy(meta, status, &mut response_headers, upstream_body)
                    .await
            }
            _ => {
                if let (Some(meta), Some(coordinator)) = (llm_meta.as_ref(), self.llm_cache.as_ref())
                {
                    coordinator
                        .post_proxy(meta, status, &mut response_headers, &upstream_body)
                        .await;
                }
                upstream_body
            }
        };

        if embedding_bypass {
            response_headers.insert(EMBEDDING_CACHE_HEADER, HeaderValue::from_static("BYPASS"));
        }

        if self.config.log_body {
            linfo!(
                request_id,
                LogStage::Response,
                LogComponent::Proxy,
                "response_body",
                "响应体内容",
                content_type = ?response_headers.get(header::CONTENT_TYPE),
                content_encoding = ?response_headers.get(header::CONTENT_ENCODING),
                response_body = %String::from_utf8_lossy(&client_body)
            );
        }

        let mut response = Response::new(Body::from(client_body));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        finalize(response, &request_id)
    }
}

/// 上游转发任务的入参，独立于客户端连接存活
struct DispatchContext {
    parts: Parts,
    body_bytes: Bytes,
    path: String,
    base_url: String,
    request_id: String,
    llm_meta: Option<LlmCacheMetadata>,
    embedding_meta: Option<Box<EmbeddingCacheMetadata>>,
    embedding_bypass: bool,
}

/// axum 入口函数
async fn proxy_entry(State(handler): State<Arc<ProxyHandler>>, request: Request) -> Response {
    handler.handle(request).await
}

/// 读取或生成请求 ID；生成时写回请求头
fn get_or_generate_request_id(headers: &mut HeaderMap) -> String {
    let existing = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if !existing.is_empty() {
        return existing.to_string();
    }

    let request_id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    request_id
}

/// 终结响应前统一回写请求 ID
fn finalize(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// 纯文本错误响应
fn plain_response(status: StatusCode, message: &str) -> Response {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// 过滤不应转发到上游的请求头
fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = headers.clone();
    for name in [
        header::HOST,
        header::CONTENT_LENGTH,
        header::CONNECTION,
        header::TRANSFER_ENCODING,
    ] {
        filtered.remove(&name);
    }
    filtered.remove("proxy-connection");
    filtered
}

/// 过滤逐跳响应头
fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = headers.clone();
    for name in [
        header::CONNECTION,
        header::TRANSFER_ENCODING,
        header::TRAILER,
        header::UPGRADE,
    ] {
        filtered.remove(&name);
    }
    filtered.remove("keep-alive");
    filtered.remove("proxy-authenticate");
    filtered
}
