//! 失败重试（failover）策略。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::id::{PolicyId, PolicyIdentified, Supplement, fill, fill_str, fill_vec};

/// 退避形态。
///
/// - `Fixed`：每次等待 `timeout_ms`；
/// - `Exponential`：第 n 次重试等待 `timeout_ms * multiplier^(n-1)`，上限 `max_delay_ms`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential { multiplier: f64, max_delay_ms: u64 },
}

/// 重试策略。
///
/// # 教案式说明
/// - **契约 (What)**：`retry_attempts` 为总尝试次数（含首次），未设置视为 1（不重试）；
///   `retryable_error_codes` 与 `retryable_statuses` 同时为空时，任意上游失败都具备重试资格；
/// - **幂等约束**：`require_idempotent` 为真时，只有调用方明确声明幂等的调用才会重试；
///   无论该开关如何，调用方声明“非幂等”的调用永不重试。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FailoverPolicy {
    #[serde(flatten)]
    pub policy_id: PolicyId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub backoff: Option<Backoff>,
    #[serde(default)]
    pub retryable_error_codes: Vec<String>,
    #[serde(default)]
    pub retryable_statuses: Vec<u16>,
    #[serde(default)]
    pub require_idempotent: Option<bool>,
}

impl FailoverPolicy {
    pub fn new(policy_id: PolicyId, retry_attempts: u32) -> Self {
        Self {
            policy_id,
            retry_attempts: Some(retry_attempts),
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.timeout_ms = Some(interval.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.retry_attempts.unwrap_or(1).max(1)
    }

    pub fn requires_idempotent(&self) -> bool {
        self.require_idempotent.unwrap_or(false)
    }

    /// 第 `retry` 次重试（从 1 开始）之前的等待时长。
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.timeout_ms.unwrap_or(0);
        match self.backoff.unwrap_or_default() {
            Backoff::Fixed => Duration::from_millis(base),
            Backoff::Exponential {
                multiplier,
                max_delay_ms,
            } => {
                let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
                let scaled = base as f64 * multiplier.max(1.0).powi(exponent);
                let capped = if scaled.is_finite() {
                    scaled.min(max_delay_ms as f64)
                } else {
                    max_delay_ms as f64
                };
                Duration::from_millis(capped as u64)
            }
        }
    }

    /// 上游错误码/状态码是否在重试名单内。
    pub fn is_retryable(&self, code: Option<&str>, status: Option<u16>) -> bool {
        if self.retryable_error_codes.is_empty() && self.retryable_statuses.is_empty() {
            return true;
        }
        let code_hit = code.is_some_and(|code| self.retryable_error_codes.iter().any(|c| c == code));
        let status_hit = status.is_some_and(|status| self.retryable_statuses.contains(&status));
        code_hit || status_hit
    }
}

impl PolicyIdentified for FailoverPolicy {
    fn policy_id(&self) -> PolicyId {
        self.policy_id
    }
}

impl Supplement for FailoverPolicy {
    fn supplement(&mut self, source: &Self) {
        fill_str(&mut self.name, &source.name);
        fill(&mut self.retry_attempts, &source.retry_attempts);
        fill(&mut self.timeout_ms, &source.timeout_ms);
        fill(&mut self.backoff, &source.backoff);
        fill_vec(&mut self.retryable_error_codes, &source.retryable_error_codes);
        fill_vec(&mut self.retryable_statuses, &source.retryable_statuses);
        fill(&mut self.require_idempotent, &source.require_idempotent);
    }
}
