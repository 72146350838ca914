//! 限流与并发限制策略。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::id::{PolicyId, PolicyIdentified, Supplement, fill, fill_str, fill_vec};
use crate::error::PolicyError;

/// 单个滑动窗口：`time_window_ms` 内最多 `threshold` 次调用。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlidingWindow {
    pub threshold: u64,
    pub time_window_ms: u64,
}

impl SlidingWindow {
    pub const fn new(threshold: u64, time_window_ms: u64) -> Self {
        Self {
            threshold,
            time_window_ms,
        }
    }

    pub fn span(&self) -> Duration {
        Duration::from_millis(self.time_window_ms)
    }
}

/// 限流策略：多个窗口之间为“与”关系，任一窗口耗尽即拒绝。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    #[serde(flatten)]
    pub policy_id: PolicyId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sliding_windows: Vec<SlidingWindow>,
}

impl RateLimitPolicy {
    pub fn new(policy_id: PolicyId, name: impl Into<String>) -> Self {
        Self {
            policy_id,
            name: name.into(),
            sliding_windows: Vec::new(),
        }
    }

    pub fn with_window(mut self, window: SlidingWindow) -> Self {
        self.sliding_windows.push(window);
        self
    }

    /// 零长度窗口无法划分周期，视为畸形策略；`threshold == 0` 合法，表示全部拒绝。
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.sliding_windows.iter().any(|w| w.time_window_ms == 0) {
            return Err(PolicyError::invalid(
                self.policy_id.id,
                "time_window_ms",
                "must be > 0",
            ));
        }
        Ok(())
    }
}

impl PolicyIdentified for RateLimitPolicy {
    fn policy_id(&self) -> PolicyId {
        self.policy_id
    }
}

impl Supplement for RateLimitPolicy {
    fn supplement(&mut self, source: &Self) {
        fill_str(&mut self.name, &source.name);
        fill_vec(&mut self.sliding_windows, &source.sliding_windows);
    }
}

/// 并发限制（隔离舱）策略。
///
/// 未设置 `max_wait_ms` 时不排队，满载立即拒绝。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimitPolicy {
    #[serde(flatten)]
    pub policy_id: PolicyId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub max_concurrency: Option<u32>,
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
}

impl ConcurrencyLimitPolicy {
    pub fn new(policy_id: PolicyId, name: impl Into<String>, max_concurrency: u32) -> Self {
        Self {
            policy_id,
            name: name.into(),
            max_concurrency: Some(max_concurrency),
            max_wait_ms: None,
        }
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait_ms = Some(wait.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms.unwrap_or(0))
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        match self.max_concurrency {
            Some(0) | None => Err(PolicyError::invalid(
                self.policy_id.id,
                "max_concurrency",
                "must be set and > 0",
            )),
            Some(_) => Ok(()),
        }
    }
}

impl PolicyIdentified for ConcurrencyLimitPolicy {
    fn policy_id(&self) -> PolicyId {
        self.policy_id
    }
}

impl Supplement for ConcurrencyLimitPolicy {
    fn supplement(&mut self, source: &Self) {
        fill_str(&mut self.name, &source.name);
        fill(&mut self.max_concurrency, &source.max_concurrency);
        fill(&mut self.max_wait_ms, &source.max_wait_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_window_is_malformed() {
        let policy = RateLimitPolicy::new(PolicyId::new(1, 1), "rl").with_window(SlidingWindow::new(10, 0));
        assert!(policy.validate().is_err());
        let blocking = RateLimitPolicy::new(PolicyId::new(2, 1), "rl").with_window(SlidingWindow::new(0, 1000));
        assert!(blocking.validate().is_ok(), "零阈值是合法的全拒绝配置");
    }

    #[test]
    fn concurrency_supplement_inherits_wait() {
        let mut method = ConcurrencyLimitPolicy::new(PolicyId::new(3, 1), "bulkhead", 4);
        let service = ConcurrencyLimitPolicy::new(PolicyId::new(3, 1), "bulkhead", 16)
            .with_max_wait(Duration::from_millis(200));
        method.supplement(&service);
        assert_eq!(method.max_concurrency, Some(4));
        assert_eq!(method.max_wait(), Duration::from_millis(200));
    }
}
