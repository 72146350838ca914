//! 标签路由策略：条件、规则与路由目标。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::id::{PolicyId, PolicyIdentified, Supplement, fill_str, fill_vec};
use crate::error::PolicyError;
use crate::observability::targets;

/// 条件取值来源。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    #[default]
    Header,
    Cookie,
    Query,
    Attachment,
}

/// 条件运算符。
///
/// `NotEqual` 与 `NotIn` 为否定运算符：请求中缺失该标签时视为满足。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagOperator {
    #[default]
    Equal,
    NotEqual,
    In,
    NotIn,
    Prefix,
    Contains,
    Regex,
}

impl TagOperator {
    pub fn is_negative(self) -> bool {
        matches!(self, TagOperator::NotEqual | TagOperator::NotIn)
    }
}

/// 条件间的组合关系。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    #[default]
    And,
    Or,
}

/// 单个标签条件。
///
/// # 教案式说明
/// - **契约 (What)**：`key` 指向请求中某类标签（由 `kind` 决定来源），`operator` 施加于
///   `values`；一次提取可能得到多个取值（HTTP 头可重复），任一取值满足即条件成立；
/// - **实现 (How)**：`Regex` 运算符的模式在首次使用时编译并缓存；非法模式记录告警后忽略，
///   条件因此不成立（放行而非拒绝）。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TagCondition {
    pub key: String,
    #[serde(default, rename = "type")]
    pub kind: TagKind,
    #[serde(default, rename = "opType")]
    pub operator: TagOperator,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(skip)]
    patterns: OnceLock<Vec<Regex>>,
}

impl TagCondition {
    pub fn new<I, V>(kind: TagKind, key: impl Into<String>, operator: TagOperator, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self {
            key: key.into(),
            kind,
            operator,
            values: values.into_iter().map(Into::into).collect(),
            patterns: OnceLock::new(),
        }
    }

    /// 校验正则模式，快照构建期调用。
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.operator != TagOperator::Regex {
            return Ok(());
        }
        for pattern in &self.values {
            Regex::new(pattern).map_err(|err| PolicyError::InvalidPattern {
                key: self.key.clone(),
                reason: err.to_string(),
            })?;
        }
        Ok(())
    }

    /// 对单个取值应用运算符。
    pub fn matches_value(&self, value: &str) -> bool {
        match self.operator {
            TagOperator::Equal | TagOperator::In => self.values.iter().any(|v| v == value),
            TagOperator::NotEqual | TagOperator::NotIn => !self.values.iter().any(|v| v == value),
            TagOperator::Prefix => self.values.iter().any(|v| value.starts_with(v.as_str())),
            TagOperator::Contains => self.values.iter().any(|v| value.contains(v.as_str())),
            TagOperator::Regex => self.patterns().iter().any(|p| p.is_match(value)),
        }
    }

    /// 对提取出的全部取值应用运算符，首个满足即返回。
    pub fn matches_any(&self, values: &[&str]) -> bool {
        if values.is_empty() {
            return self.operator.is_negative();
        }
        values.iter().any(|value| self.matches_value(value))
    }

    fn patterns(&self) -> &[Regex] {
        self.patterns.get_or_init(|| {
            self.values
                .iter()
                .filter_map(|pattern| match Regex::new(pattern) {
                    Ok(regex) => Some(regex),
                    Err(err) => {
                        tracing::warn!(
                            target: targets::POLICY,
                            key = %self.key,
                            pattern = %pattern,
                            error = %err,
                            "ignoring invalid tag condition pattern"
                        );
                        None
                    }
                })
                .collect()
        })
    }
}

/// 编译缓存不参与比较。
impl PartialEq for TagCondition {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.kind == other.kind
            && self.operator == other.operator
            && self.values == other.values
    }
}

impl Eq for TagCondition {}

/// 规则命中后的路由目标。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub lane: Option<String>,
    #[serde(default)]
    pub cell: Option<String>,
}

impl RouteTarget {
    pub fn unit(unit: impl Into<String>) -> Self {
        Self {
            unit: Some(unit.into()),
            ..Self::default()
        }
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }

    pub fn with_cell(mut self, cell: impl Into<String>) -> Self {
        self.cell = Some(cell.into());
        self
    }
}

/// 标签规则：按 `relation` 组合的条件集合，命中后路由到 `target`。
///
/// 空条件集合的规则总是命中，常用作兜底规则。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TagRule {
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub conditions: Vec<TagCondition>,
    #[serde(default)]
    pub relation: RelationType,
    #[serde(default)]
    pub target: RouteTarget,
}

impl TagRule {
    pub fn new(order: i32, relation: RelationType, target: RouteTarget) -> Self {
        Self {
            order,
            conditions: Vec::new(),
            relation,
            target,
        }
    }

    pub fn with_condition(mut self, condition: TagCondition) -> Self {
        self.conditions.push(condition);
        self
    }
}

/// 路由策略。
///
/// # 契约说明（What）
/// - 规则按 `order` 升序求值，首个完全命中的规则胜出；`order` 相同时保持声明顺序；
/// - 排序结果以下标形式缓存，只计算一次，策略在快照内只读。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoutePolicy {
    #[serde(flatten)]
    pub policy_id: PolicyId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub tag_rules: Vec<TagRule>,
    #[serde(skip)]
    sorted: OnceLock<Vec<usize>>,
}

impl RoutePolicy {
    pub fn new(policy_id: PolicyId, name: impl Into<String>) -> Self {
        Self {
            policy_id,
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_rule(mut self, rule: TagRule) -> Self {
        self.tag_rules.push(rule);
        self.sorted = OnceLock::new();
        self
    }

    /// 按 `order` 升序遍历规则。
    pub fn sorted_rules(&self) -> impl Iterator<Item = &TagRule> {
        let indices = self.sorted.get_or_init(|| {
            let mut indices: Vec<usize> = (0..self.tag_rules.len()).collect();
            indices.sort_by_key(|&index| self.tag_rules[index].order);
            indices
        });
        indices.iter().filter_map(|&index| self.tag_rules.get(index))
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        self.tag_rules
            .iter()
            .flat_map(|rule| rule.conditions.iter())
            .try_for_each(TagCondition::validate)
    }
}

impl PolicyIdentified for RoutePolicy {
    fn policy_id(&self) -> PolicyId {
        self.policy_id
    }
}

impl Supplement for RoutePolicy {
    fn supplement(&mut self, source: &Self) {
        fill_str(&mut self.name, &source.name);
        if self.tag_rules.is_empty() {
            fill_vec(&mut self.tag_rules, &source.tag_rules);
            self.sorted = OnceLock::new();
        }
    }
}
