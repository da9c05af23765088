//! # URL 路由策略
//!
//! 有序策略链，第一个 `applies` 命中的策略为请求产出具体上游 URL

use crate::config::AppConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::proxy::loadbalancer::LoadBalancerManager;
use crate::utils::target_url::join_target_url;
use crate::{linfo, lwarn};
use axum::http::Method;
use bytes::Bytes;
use std::sync::Arc;
use url::Url;

/// 路由策略输入：请求元信息与可重写的请求体
pub struct RouteRequest<'a> {
    pub request_id: &'a str,
    pub method: &'a Method,
    pub path: &'a str,
    pub body: &'a mut Bytes,
}

/// URL 路由策略接口
pub trait RouteStrategy: Send + Sync {
    /// 该路径是否适用此策略
    fn applies(&self, path: &str) -> bool;

    /// 为请求产出具体上游 URL
    fn target_url(&self, request: &mut RouteRequest<'_>, base_url: &str) -> Result<Url>;
}

/// 按请求体中的模型名改写上游地址的策略
///
/// 适用于聊天补全与 Embedding 路径
pub struct ModelSpecifyStrategy {
    lb_manager: Arc<LoadBalancerManager>,
    config: Arc<AppConfig>,
}

impl ModelSpecifyStrategy {
    #[must_use]
    pub const fn new(lb_manager: Arc<LoadBalancerManager>, config: Arc<AppConfig>) -> Self {
        Self { lb_manager, config }
    }

    /// 从请求体提取模型名并解析别名
    ///
    /// 别名解析改变模型名时同步改写请求体，保证上游收到规范名
    fn extract_model(&self, request: &mut RouteRequest<'_>) -> Result<String> {
        // 预检类请求没有请求体
        if request.method == Method::OPTIONS {
            return Err(ProxyError::internal("OPTIONS 请求没有可提取的模型"));
        }

        if request.body.is_empty() {
            return Err(ProxyError::internal("请求体为空"));
        }

        let payload: serde_json::Value = serde_json::from_slice(request.body)
            .map_err(|e| ProxyError::serialization_with_source("解析请求体失败", e))?;

        let model = payload
            .get("model")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if model.is_empty() {
            return Err(ProxyError::internal("model 字段缺失或为空"));
        }

        let resolved = self.config.resolve_model(model).to_string();
        if resolved != model {
            // 别名命中，改写请求体中的 model 字段
            let mut payload = payload;
            if let Some(object) = payload.as_object_mut() {
                object.insert(
                    "model".to_string(),
                    serde_json::Value::String(resolved.clone()),
                );
                if let Ok(new_body) = serde_json::to_vec(&payload) {
                    *request.body = Bytes::from(new_body);
                }
            }
        }

        Ok(resolved)
    }

    /// 查负载均衡器，未注册的模型回退到配置基地址
    fn load_balanced_url(&self, model: &str, fallback_url: &str, request_id: &str) -> String {
        if let Some(target) = self.lb_manager.next_for(model) {
            linfo!(
                request_id,
                LogStage::RequestModify,
                LogComponent::Strategy,
                "model_route_selected",
                "使用模型路由的负载均衡地址",
                model = %model,
                target = %target
            );
            return target;
        }
        lwarn!(
            request_id,
            LogStage::RequestModify,
            LogComponent::Strategy,
            "model_route_fallback",
            "模型未配置负载均衡器, 回退到默认地址",
            model = %model,
            fallback = %fallback_url
        );
        fallback_url.to_string()
    }
}

impl RouteStrategy for ModelSpecifyStrategy {
    fn applies(&self, path: &str) -> bool {
        path == "/chat/completions" || path.contains("embeddings")
    }

    fn target_url(&self, request: &mut RouteRequest<'_>, base_url: &str) -> Result<Url> {
        match self.extract_model(request) {
            Ok(model) => {
                let target_base = self.load_balanced_url(&model, base_url, request.request_id);
                join_target_url(&target_base, request.path)
            }
            Err(e) => {
                lwarn!(
                    request.request_id,
                    LogStage::RequestModify,
                    LogComponent::Strategy,
                    "model_extract_failed",
                    "提取模型失败, 使用默认地址",
                    error = %e
                );
                join_target_url(base_url, request.path)
            }
        }
    }
}

/// 默认路由策略：基地址直接拼接请求路径
pub struct DefaultStrategy;

impl RouteStrategy for DefaultStrategy {
    fn applies(&self, _path: &str) -> bool {
        true
    }

    fn target_url(&self, request: &mut RouteRequest<'_>, base_url: &str) -> Result<Url> {
        join_target_url(base_url, request.path)
    }
}
