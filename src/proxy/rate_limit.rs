//! # 按客户端 IP 的令牌桶限流
//!
//! 首次观察到某个 IP 时惰性建桶，进程生命周期内不淘汰

use crate::config::RateLimitConfig;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// 按 IP 维度的限流器
///
/// rate 为每秒补充令牌数，burst 为突发容量；两者任一为 0 时禁用
pub struct IpRateLimiter {
    limiter: KeyedLimiter,
}

impl IpRateLimiter {
    /// 依据配置创建，配置无效时返回 None（禁用限流）
    #[must_use]
    pub fn from_config(config: Option<RateLimitConfig>) -> Option<Self> {
        let config = config?;
        let rate = NonZeroU32::new(config.rate)?;
        let burst = NonZeroU32::new(config.burst)?;

        let quota = Quota::per_second(rate).allow_burst(burst);
        Some(Self {
            limiter: RateLimiter::keyed(quota),
        })
    }

    /// 消费一枚令牌，桶空时返回 false
    #[must_use]
    pub fn allow(&self, client_ip: &str) -> bool {
        self.limiter.check_key(&client_ip.to_string()).is_ok()
    }
}
