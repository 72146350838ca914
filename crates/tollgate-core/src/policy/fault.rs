//! 故障注入策略。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::id::{PolicyId, PolicyIdentified, Supplement, fill, fill_str, fill_vec};
use super::route::{RelationType, TagCondition};
use crate::error::PolicyError;

/// 注入的故障形态。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FaultKind {
    /// 在调用前挂起指定时长。
    Delay { delay_time_ms: u64 },
    /// 直接以给定错误码与描述失败，不执行底层调用。
    Error { error_code: i32, error_msg: String },
}

impl FaultKind {
    pub fn delay(duration: Duration) -> Self {
        FaultKind::Delay {
            delay_time_ms: duration.as_millis().try_into().unwrap_or(u64::MAX),
        }
    }

    pub fn error(error_code: i32, error_msg: impl Into<String>) -> Self {
        FaultKind::Error {
            error_code,
            error_msg: error_msg.into(),
        }
    }
}

/// 故障注入策略。
///
/// # 契约说明（What）
/// - `conditions` 按 `relation` 组合，空集合表示对所有请求生效；
/// - `percent` 取值语义：`<= 0` 从不注入，`>= 100` 总是注入，其余按 `[0, 100)` 均匀抽样
///   小于 `percent` 时注入；未设置视为 100。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultInjectionPolicy {
    #[serde(flatten)]
    pub policy_id: PolicyId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<TagCondition>,
    #[serde(default)]
    pub relation: RelationType,
    #[serde(default)]
    pub percent: Option<i32>,
    pub kind: FaultKind,
}

impl FaultInjectionPolicy {
    pub fn new(policy_id: PolicyId, kind: FaultKind) -> Self {
        Self {
            policy_id,
            name: String::new(),
            conditions: Vec::new(),
            relation: RelationType::And,
            percent: None,
            kind,
        }
    }

    pub fn with_percent(mut self, percent: i32) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn with_condition(mut self, condition: TagCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_relation(mut self, relation: RelationType) -> Self {
        self.relation = relation;
        self
    }

    pub fn effective_percent(&self) -> i32 {
        self.percent.unwrap_or(100)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        self.conditions.iter().try_for_each(TagCondition::validate)
    }
}

impl PolicyIdentified for FaultInjectionPolicy {
    fn policy_id(&self) -> PolicyId {
        self.policy_id
    }
}

impl Supplement for FaultInjectionPolicy {
    fn supplement(&mut self, source: &Self) {
        fill_str(&mut self.name, &source.name);
        fill(&mut self.percent, &source.percent);
        fill_vec(&mut self.conditions, &source.conditions);
    }
}
