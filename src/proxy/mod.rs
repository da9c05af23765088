//! # 代理服务模块
//!
//! 请求拦截、路由与缓存协调引擎

pub mod embedding_cache;
pub mod handler;
pub mod llm_cache;
pub mod loadbalancer;
pub mod rate_limit;
pub mod server;
pub mod strategy;
pub mod transport;

pub use embedding_cache::{
    EmbeddingCacheCoordinator, EmbeddingPreOutcome, EMBEDDING_CACHE_BYPASS_HEADER,
    EMBEDDING_CACHE_HEADER,
};
pub use handler::{ProxyHandler, REQUEST_ID_HEADER};
pub use llm_cache::{
    LlmCacheCoordinator, LlmPreOutcome, LLM_CACHE_BYPASS_HEADER, LLM_CACHE_HEADER,
};
pub use loadbalancer::{LoadBalancerManager, RoundRobinLoadBalancer};
pub use rate_limit::IpRateLimiter;
pub use server::ProxyServer;
pub use strategy::{DefaultStrategy, ModelSpecifyStrategy, RouteStrategy};
pub use transport::{TransportSelector, UPSTREAM_DEADLINE};
