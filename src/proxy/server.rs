//! # 代理服务器装配与启动

use crate::config::AppConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::proxy::handler::ProxyHandler;
use crate::storage::{CacheStorage, Storage};
use crate::{linfo, lwarn};
use std::net::SocketAddr;
use std::sync::Arc;

/// 代理服务器
pub struct ProxyServer {
    handler: Arc<ProxyHandler>,
    port: u16,
}

impl ProxyServer {
    /// 装配全部组件
    ///
    /// 存储初始化失败只降级禁用缓存，不阻止启动
    pub async fn build(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);

        let storage: Option<Arc<dyn CacheStorage>> = if config.has_storage() {
            match Storage::new(&config).await {
                Ok(storage) => Some(Arc::new(storage)),
                Err(e) => {
                    lwarn!(
                        "system",
                        LogStage::Startup,
                        LogComponent::Storage,
                        "storage_init_failed",
                        "存储初始化失败, 响应缓存已禁用",
                        error = %e
                    );
                    None
                }
            }
        } else {
            lwarn!(
                "system",
                LogStage::Startup,
                LogComponent::Storage,
                "storage_not_configured",
                "未配置 database/redis, 响应缓存已禁用"
            );
            None
        };

        let port = config.port;
        let handler = ProxyHandler::new(config, storage)?;
        handler.init_load_balancers();
        handler.start_background_tasks();

        Ok(Self { handler, port })
    }

    /// 绑定端口并运行
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::internal_with_source(format!("绑定端口失败: {addr}"), e))?;

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Main,
            "server_starting",
            &format!("服务启动, 监听端口 {}", self.port)
        );

        let app = self.handler.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| ProxyError::internal_with_source("服务器运行失败", e))
    }
}
