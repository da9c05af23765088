//! # 统一日志工具模块
//!
//! 提供结构化业务日志宏与日志系统初始化：
//! 每条业务日志都携带 `request_id` / `stage` / `component` / `operation` 字段

use std::env;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 日志阶段枚举
#[derive(Debug, Clone, Copy)]
pub enum LogStage {
    RequestStart,
    RequestModify,
    UpstreamRequest,
    Response,
    ResponseFailure,
    Cache,
    Db,
    Startup,
    BackgroundTask,
    Internal,
}

impl LogStage {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RequestStart => "request_start",
            Self::RequestModify => "request_modify",
            Self::UpstreamRequest => "upstream_request",
            Self::Response => "response",
            Self::ResponseFailure => "response_failure",
            Self::Cache => "cache",
            Self::Db => "db",
            Self::Startup => "startup",
            Self::BackgroundTask => "background_task",
            Self::Internal => "internal",
        }
    }
}

/// 组件枚举
#[derive(Debug, Clone, Copy)]
pub enum LogComponent {
    Main,
    Config,
    Database,
    Cache,
    Storage,
    Proxy,
    Strategy,
    LoadBalancer,
    Transport,
    RateLimit,
    EmbeddingCache,
    LlmCache,
    Dns,
}

impl LogComponent {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Config => "config",
            Self::Database => "database",
            Self::Cache => "cache",
            Self::Storage => "storage",
            Self::Proxy => "proxy",
            Self::Strategy => "strategy",
            Self::LoadBalancer => "load_balancer",
            Self::Transport => "transport",
            Self::RateLimit => "rate_limit",
            Self::EmbeddingCache => "embedding_cache",
            Self::LlmCache => "llm_cache",
            Self::Dns => "dns",
        }
    }
}

/// 标准日志宏 - 信息级别
#[macro_export]
macro_rules! linfo {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr, $($rest:tt)*) => {
        tracing::info!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
            $($rest)*
        )
    };
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr) => {
        tracing::info!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
        )
    };
}

/// 标准日志宏 - 调试级别
#[macro_export]
macro_rules! ldebug {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr, $($rest:tt)*) => {
        tracing::debug!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
            $($rest)*
        )
    };
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr) => {
        tracing::debug!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
        )
    };
}

/// 标准日志宏 - 警告级别
#[macro_export]
macro_rules! lwarn {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr, $($rest:tt)*) => {
        tracing::warn!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
            $($rest)*
        )
    };
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr) => {
        tracing::warn!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
        )
    };
}

/// 标准日志宏 - 错误级别
#[macro_export]
macro_rules! lerror {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr, $($rest:tt)*) => {
        tracing::error!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
            $($rest)*
        )
    };
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr) => {
        tracing::error!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            operation = $operation,
            component = $component.as_str(),
            message = %$description,
        )
    };
}

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// 默认日志级别
    pub default_level: String,
    /// 应用程序日志级别
    pub app_level: String,
    /// Sea ORM 查询日志级别
    pub sea_orm_level: String,
    /// `SQLx` 通用日志级别
    pub sqlx_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            app_level: "info".to_string(),
            sea_orm_level: "warn".to_string(),
            sqlx_level: "warn".to_string(),
        }
    }
}

impl LoggingConfig {
    /// 创建开发环境配置
    #[must_use]
    pub fn development() -> Self {
        Self {
            default_level: "debug".to_string(),
            app_level: "debug".to_string(),
            sea_orm_level: "debug".to_string(),
            sqlx_level: "debug".to_string(),
        }
    }

    /// 从环境变量创建配置
    ///
    /// `LOG_MODE=development` 时启用详细日志，其余情况使用生产配置
    #[must_use]
    pub fn from_env() -> Self {
        match env::var("LOG_MODE").ok().as_deref() {
            Some("development") => Self::development(),
            _ => Self::default(),
        }
    }

    /// 构建日志过滤器字符串
    #[must_use]
    pub fn build_filter(&self) -> String {
        format!(
            "{},llm_proxy={},sea_orm::query={},sqlx={}",
            self.default_level, self.app_level, self.sea_orm_level, self.sqlx_level
        )
    }
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先于 `LOG_MODE` 推导出的过滤器
pub fn init_logging() {
    let config = LoggingConfig::from_env();
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| config.build_filter());

    let env_filter = EnvFilter::try_new(&log_filter).unwrap_or_else(|_| EnvFilter::default());

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(tracing_subscriber::filter::FilterFn::new(|metadata| {
            // 过滤掉一些噪音日志
            !metadata.target().starts_with("hyper::")
                && !metadata.target().starts_with("h2::")
                && !metadata.target().starts_with("tokio::runtime")
        }));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "log_init",
        &format!("日志系统已启动, 过滤器: {log_filter}")
    );
}
