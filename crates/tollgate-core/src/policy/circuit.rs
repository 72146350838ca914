//! 熔断策略。

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::id::{PolicyId, PolicyIdentified, Supplement, fill, fill_str, fill_vec};
use crate::error::PolicyError;

/// 熔断粒度。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakLevel {
    #[default]
    Service,
    Api,
    Instance,
}

/// 滑动窗口类型：按调用次数或按时间（秒）。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlidingWindowType {
    #[default]
    CountBased,
    TimeBased,
}

/// 熔断拒绝时的降级响应描述，由适配层据此生成兜底响应。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradeConfig {
    #[serde(default = "DegradeConfig::default_response_code")]
    pub response_code: u16,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl DegradeConfig {
    fn default_response_code() -> u16 {
        503
    }
}

/// 熔断策略。
///
/// # 教案式说明
/// - **契约 (What)**：阈值字段以 `Option` 表示“未设置”，未设置的字段可由更不具体的策略补全，
///   补全后仍未设置的字段在 `effective_*` 访问器中取默认值；
/// - **默认值 (How)**：窗口 100 次、最少 10 次调用、失败率 50%、慢调用率 100%、
///   慢调用阈值 10 秒、打开态等待 5 秒、半开试探 10 次；
/// - **错误码过滤**：`error_codes` 非空时，只有列表内的错误码计为失败，其余计为成功。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakPolicy {
    #[serde(flatten)]
    pub policy_id: PolicyId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub level: CircuitBreakLevel,
    #[serde(default)]
    pub sliding_window_type: Option<SlidingWindowType>,
    #[serde(default)]
    pub sliding_window_size: Option<u32>,
    #[serde(default)]
    pub min_calls_threshold: Option<u32>,
    #[serde(default)]
    pub error_codes: Vec<String>,
    #[serde(default)]
    pub failure_rate_threshold: Option<f32>,
    #[serde(default)]
    pub slow_call_rate_threshold: Option<f32>,
    #[serde(default)]
    pub slow_call_duration_threshold_ms: Option<u64>,
    #[serde(default)]
    pub wait_duration_in_open_state_ms: Option<u64>,
    #[serde(default)]
    pub permitted_calls_in_half_open_state: Option<u32>,
    #[serde(default)]
    pub degrade_config: Option<DegradeConfig>,
}

impl CircuitBreakPolicy {
    pub fn new(policy_id: PolicyId, name: impl Into<String>) -> Self {
        Self {
            policy_id,
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn window_type(&self) -> SlidingWindowType {
        self.sliding_window_type.unwrap_or_default()
    }

    pub fn window_size(&self) -> u32 {
        self.sliding_window_size.unwrap_or(100)
    }

    pub fn min_calls(&self) -> u32 {
        self.min_calls_threshold.unwrap_or(10)
    }

    /// 迁移到 `Open` 前窗口内必须累计的调用数。
    ///
    /// 计数窗口最多容纳 `window_size` 个结果，因此门槛取两者较小值。
    pub fn effective_min_calls(&self) -> u32 {
        match self.window_type() {
            SlidingWindowType::CountBased => self.min_calls().min(self.window_size()),
            SlidingWindowType::TimeBased => self.min_calls(),
        }
    }

    pub fn failure_rate(&self) -> f32 {
        self.failure_rate_threshold.unwrap_or(50.0)
    }

    pub fn slow_call_rate(&self) -> f32 {
        self.slow_call_rate_threshold.unwrap_or(100.0)
    }

    pub fn slow_call_duration(&self) -> Duration {
        Duration::from_millis(self.slow_call_duration_threshold_ms.unwrap_or(10_000))
    }

    pub fn wait_in_open(&self) -> Duration {
        Duration::from_millis(self.wait_duration_in_open_state_ms.unwrap_or(5_000))
    }

    pub fn permitted_in_half_open(&self) -> u32 {
        self.permitted_calls_in_half_open_state.unwrap_or(10)
    }

    /// 给定错误码是否计为失败。
    pub fn counts_as_failure(&self, code: Option<&str>) -> bool {
        if self.error_codes.is_empty() {
            return true;
        }
        code.is_some_and(|code| self.error_codes.iter().any(|c| c == code))
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        let id = self.policy_id.id;
        if self.window_size() == 0 {
            return Err(PolicyError::invalid(id, "sliding_window_size", "must be > 0"));
        }
        if self.permitted_in_half_open() == 0 {
            return Err(PolicyError::invalid(
                id,
                "permitted_calls_in_half_open_state",
                "must be > 0",
            ));
        }
        for (field, rate) in [
            ("failure_rate_threshold", self.failure_rate()),
            ("slow_call_rate_threshold", self.slow_call_rate()),
        ] {
            if !(rate > 0.0 && rate <= 100.0) {
                return Err(PolicyError::invalid(id, field, format!("{rate} is not within (0, 100]")));
            }
        }
        Ok(())
    }
}

impl PolicyIdentified for CircuitBreakPolicy {
    fn policy_id(&self) -> PolicyId {
        self.policy_id
    }
}

impl Supplement for CircuitBreakPolicy {
    fn supplement(&mut self, source: &Self) {
        fill_str(&mut self.name, &source.name);
        fill(&mut self.sliding_window_type, &source.sliding_window_type);
        fill(&mut self.sliding_window_size, &source.sliding_window_size);
        fill(&mut self.min_calls_threshold, &source.min_calls_threshold);
        fill_vec(&mut self.error_codes, &source.error_codes);
        fill(&mut self.failure_rate_threshold, &source.failure_rate_threshold);
        fill(&mut self.slow_call_rate_threshold, &source.slow_call_rate_threshold);
        fill(
            &mut self.slow_call_duration_threshold_ms,
            &source.slow_call_duration_threshold_ms,
        );
        fill(
            &mut self.wait_duration_in_open_state_ms,
            &source.wait_duration_in_open_state_ms,
        );
        fill(
            &mut self.permitted_calls_in_half_open_state,
            &source.permitted_calls_in_half_open_state,
        );
        fill(&mut self.degrade_config, &source.degrade_config);
    }
}
