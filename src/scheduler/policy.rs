//! 预留策略：安全系数、最小 token 下限与等待退避间隔。

use crate::error::SchedulerError;
use std::time::Duration;

pub const DEFAULT_SAFETY_FACTOR: f64 = 1.2;
pub const DEFAULT_MIN_TOKENS: u64 = 1500;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// 浮点乘法误差容忍：1.2 * 2000 之类的结果不应被 ceil 抬高 1。
const CEIL_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionPolicy {
    pub safety_factor: f64,
    pub min_tokens: u64,
    pub retry_backoff: Duration,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            safety_factor: DEFAULT_SAFETY_FACTOR,
            min_tokens: DEFAULT_MIN_TOKENS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl AdmissionPolicy {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if !(self.safety_factor.is_finite() && self.safety_factor > 0.0) {
            return Err(SchedulerError::config(format!(
                "safety_factor 必须为正数，当前为 {}",
                self.safety_factor
            )));
        }
        if self.retry_backoff.is_zero() {
            return Err(SchedulerError::config("retry_backoff 不能为 0"));
        }
        Ok(())
    }

    /// 实际预留量：max(min_tokens, ceil(safety_factor * estimated_tokens))。
    pub fn tokens_needed(&self, estimated_tokens: u64) -> u64 {
        let scaled = self.safety_factor * estimated_tokens as f64;
        let rounded = scaled.round();
        let ceiled = if (scaled - rounded).abs() < CEIL_EPSILON {
            rounded
        } else {
            scaled.ceil()
        };
        // f64 -> u64 的 as 转换在溢出时饱和。
        (ceiled as u64).max(self.min_tokens)
    }
}
