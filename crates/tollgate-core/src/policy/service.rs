//! 服务治理策略与服务层级（服务 → 分组 → 路径 → 方法）。

use serde::{Deserialize, Serialize};

use super::circuit::CircuitBreakPolicy;
use super::failover::FailoverPolicy;
use super::fault::FaultInjectionPolicy;
use super::id::{PolicyIdentified, Supplement};
use super::limit::{ConcurrencyLimitPolicy, RateLimitPolicy};
use super::route::RoutePolicy;
use super::{Named, NameIndex};
use crate::error::PolicyError;
use crate::observability::targets;

/// 某一层级上生效的治理策略集合。
///
/// # 教案式说明
/// - **意图 (Why)**：同一组策略可以挂在服务、分组、路径或方法任一层级，决策时取最具体的一层；
/// - **契约 (What)**：列表字段为 `None` 表示“本层未声明，沿用上层”，`Some(vec![])` 表示
///   “本层显式声明为空”；补全时 `None` 整体继承上层，`Some` 内按策略 id 逐项补全字段；
/// - **风险 (Trade-offs)**：逐项补全以线性查找匹配 id，策略数量通常为个位数，构建期一次性开销可接受。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServicePolicy {
    #[serde(default)]
    pub route_policies: Option<Vec<RoutePolicy>>,
    #[serde(default)]
    pub circuit_break_policies: Option<Vec<CircuitBreakPolicy>>,
    #[serde(default)]
    pub rate_limit_policies: Option<Vec<RateLimitPolicy>>,
    #[serde(default)]
    pub concurrency_limit_policies: Option<Vec<ConcurrencyLimitPolicy>>,
    #[serde(default)]
    pub fault_injection_policies: Option<Vec<FaultInjectionPolicy>>,
    #[serde(default)]
    pub failover_policy: Option<FailoverPolicy>,
}

impl ServicePolicy {
    pub fn route_policies(&self) -> &[RoutePolicy] {
        self.route_policies.as_deref().unwrap_or_default()
    }

    pub fn circuit_break_policies(&self) -> &[CircuitBreakPolicy] {
        self.circuit_break_policies.as_deref().unwrap_or_default()
    }

    pub fn rate_limit_policies(&self) -> &[RateLimitPolicy] {
        self.rate_limit_policies.as_deref().unwrap_or_default()
    }

    pub fn concurrency_limit_policies(&self) -> &[ConcurrencyLimitPolicy] {
        self.concurrency_limit_policies.as_deref().unwrap_or_default()
    }

    pub fn fault_injection_policies(&self) -> &[FaultInjectionPolicy] {
        self.fault_injection_policies.as_deref().unwrap_or_default()
    }

    pub fn failover_policy(&self) -> Option<&FailoverPolicy> {
        self.failover_policy.as_ref()
    }

    pub fn with_route_policy(mut self, policy: RoutePolicy) -> Self {
        self.route_policies.get_or_insert_with(Vec::new).push(policy);
        self
    }

    pub fn with_circuit_break_policy(mut self, policy: CircuitBreakPolicy) -> Self {
        self.circuit_break_policies.get_or_insert_with(Vec::new).push(policy);
        self
    }

    pub fn with_rate_limit_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit_policies.get_or_insert_with(Vec::new).push(policy);
        self
    }

    pub fn with_concurrency_limit_policy(mut self, policy: ConcurrencyLimitPolicy) -> Self {
        self.concurrency_limit_policies.get_or_insert_with(Vec::new).push(policy);
        self
    }

    pub fn with_fault_injection_policy(mut self, policy: FaultInjectionPolicy) -> Self {
        self.fault_injection_policies.get_or_insert_with(Vec::new).push(policy);
        self
    }

    pub fn with_failover_policy(mut self, policy: FailoverPolicy) -> Self {
        self.failover_policy = Some(policy);
        self
    }

    /// 剔除校验失败的策略并记录告警；被剔除后为空的列表回退为 `None`，以便补全时沿用上层。
    pub(crate) fn sanitize(&mut self) {
        retain_valid(&mut self.route_policies, RoutePolicy::validate);
        retain_valid(&mut self.circuit_break_policies, CircuitBreakPolicy::validate);
        retain_valid(&mut self.rate_limit_policies, RateLimitPolicy::validate);
        retain_valid(&mut self.concurrency_limit_policies, ConcurrencyLimitPolicy::validate);
        retain_valid(&mut self.fault_injection_policies, FaultInjectionPolicy::validate);
    }

    /// 收集所有策略 id，用于执行器缓存清理。
    pub(crate) fn collect_ids(&self, ids: &mut Vec<i64>) {
        ids.extend(self.circuit_break_policies().iter().map(|p| p.policy_id.id));
        ids.extend(self.rate_limit_policies().iter().map(|p| p.policy_id.id));
        ids.extend(self.concurrency_limit_policies().iter().map(|p| p.policy_id.id));
        ids.extend(self.failover_policy().map(|p| p.policy_id.id));
    }
}

fn retain_valid<T: PolicyIdentified>(
    list: &mut Option<Vec<T>>,
    validate: impl Fn(&T) -> Result<(), PolicyError>,
) {
    let Some(items) = list.as_mut() else {
        return;
    };
    let before = items.len();
    items.retain(|item| match validate(item) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(
                target: targets::POLICY,
                policy_id = item.policy_id().id,
                error = %err,
                "dropping invalid policy, falling back to the less specific level"
            );
            false
        }
    });
    if items.is_empty() && before > 0 {
        *list = None;
    }
}

fn supplement_list<T>(target: &mut Option<Vec<T>>, source: &Option<Vec<T>>)
where
    T: Supplement + PolicyIdentified + Clone,
{
    let Some(source) = source else {
        return;
    };
    match target {
        None => *target = Some(source.clone()),
        Some(items) => {
            for item in items.iter_mut() {
                let id = item.policy_id().id;
                if let Some(parent) = source.iter().find(|s| s.policy_id().id == id) {
                    item.supplement(parent);
                }
            }
        }
    }
}

impl Supplement for ServicePolicy {
    fn supplement(&mut self, source: &Self) {
        supplement_list(&mut self.route_policies, &source.route_policies);
        supplement_list(&mut self.circuit_break_policies, &source.circuit_break_policies);
        supplement_list(&mut self.rate_limit_policies, &source.rate_limit_policies);
        supplement_list(
            &mut self.concurrency_limit_policies,
            &source.concurrency_limit_policies,
        );
        supplement_list(&mut self.fault_injection_policies, &source.fault_injection_policies);
        if let Some(parent) = &source.failover_policy {
            match self.failover_policy.as_mut() {
                Some(own) => own.supplement(parent),
                None => self.failover_policy = Some(parent.clone()),
            }
        }
    }
}

fn inherit(target: &mut Option<ServicePolicy>, parent: Option<&ServicePolicy>) {
    if let (Some(own), Some(parent)) = (target.as_mut(), parent) {
        own.supplement(parent);
    }
}

/// 方法级节点。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceMethod {
    pub name: String,
    #[serde(default)]
    pub service_policy: Option<ServicePolicy>,
}

impl Named for ServiceMethod {
    fn name(&self) -> &str {
        &self.name
    }
}

/// 路径级节点（HTTP 路径或 RPC 接口名）。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServicePath {
    pub path: String,
    #[serde(default)]
    pub service_policy: Option<ServicePolicy>,
    #[serde(default)]
    pub methods: Vec<ServiceMethod>,
    #[serde(skip)]
    method_index: NameIndex,
}

impl ServicePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: ServicePolicy) -> Self {
        self.service_policy = Some(policy);
        self
    }

    pub fn with_method(mut self, name: impl Into<String>, policy: Option<ServicePolicy>) -> Self {
        self.methods.push(ServiceMethod {
            name: name.into(),
            service_policy: policy,
        });
        self.method_index = NameIndex::default();
        self
    }

    pub fn method(&self, name: &str) -> Option<&ServiceMethod> {
        self.method_index.find(&self.methods, name)
    }
}

impl Named for ServicePath {
    fn name(&self) -> &str {
        &self.path
    }
}

/// 分组级节点。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub name: String,
    #[serde(default)]
    pub default_group: bool,
    #[serde(default)]
    pub service_policy: Option<ServicePolicy>,
    #[serde(default)]
    pub paths: Vec<ServicePath>,
    #[serde(skip)]
    path_index: NameIndex,
}

impl ServiceGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn as_default(mut self) -> Self {
        self.default_group = true;
        self
    }

    pub fn with_policy(mut self, policy: ServicePolicy) -> Self {
        self.service_policy = Some(policy);
        self
    }

    pub fn with_path(mut self, path: ServicePath) -> Self {
        self.paths.push(path);
        self.path_index = NameIndex::default();
        self
    }

    pub fn path(&self, path: &str) -> Option<&ServicePath> {
        self.path_index.find(&self.paths, path)
    }
}

impl Named for ServiceGroup {
    fn name(&self) -> &str {
        &self.name
    }
}

/// 服务节点。
///
/// # 契约说明（What）
/// - 分组、路径、方法的查找均大小写不敏感，索引在首次查找时构建并缓存；
/// - [`Service::resolve_policy`] 自方法级向上回退，返回最具体的已声明策略。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub service_policy: Option<ServicePolicy>,
    #[serde(default)]
    pub groups: Vec<ServiceGroup>,
    #[serde(skip)]
    group_index: NameIndex,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: ServicePolicy) -> Self {
        self.service_policy = Some(policy);
        self
    }

    pub fn with_group(mut self, group: ServiceGroup) -> Self {
        self.groups.push(group);
        self.group_index = NameIndex::default();
        self
    }

    /// 按名称查找分组；未指定或为空串时返回默认分组。
    pub fn group(&self, name: Option<&str>) -> Option<&ServiceGroup> {
        match name.filter(|name| !name.is_empty()) {
            Some(name) => self.group_index.find(&self.groups, name),
            None => self.groups.iter().find(|group| group.default_group),
        }
    }

    /// 自最具体层级向上回退，返回生效的策略集合。
    pub fn resolve_policy(
        &self,
        group: Option<&str>,
        path: Option<&str>,
        method: Option<&str>,
    ) -> Option<&ServicePolicy> {
        let service_level = self.service_policy.as_ref();
        let Some(group) = self.group(group) else {
            return service_level;
        };
        let group_level = group.service_policy.as_ref().or(service_level);
        let Some(path) = path.and_then(|path| group.path(path)) else {
            return group_level;
        };
        let path_level = path.service_policy.as_ref().or(group_level);
        method
            .and_then(|method| path.method(method))
            .and_then(|method| method.service_policy.as_ref())
            .or(path_level)
    }

    /// 剔除非法策略并沿层级链补全：方法 ← 路径 ← 分组 ← 服务 ← 全局默认值。
    pub(crate) fn prepare(&mut self, defaults: Option<&ServicePolicy>) {
        if let Some(policy) = self.service_policy.as_mut() {
            policy.sanitize();
        }
        inherit(&mut self.service_policy, defaults);
        let service_level = self.service_policy.as_ref().or(defaults);
        for group in self.groups.iter_mut() {
            if let Some(policy) = group.service_policy.as_mut() {
                policy.sanitize();
            }
            inherit(&mut group.service_policy, service_level);
            let group_level = group.service_policy.as_ref().or(service_level);
            for path in group.paths.iter_mut() {
                if let Some(policy) = path.service_policy.as_mut() {
                    policy.sanitize();
                }
                inherit(&mut path.service_policy, group_level);
                let path_level = path.service_policy.as_ref().or(group_level);
                for method in path.methods.iter_mut() {
                    if let Some(policy) = method.service_policy.as_mut() {
                        policy.sanitize();
                    }
                    inherit(&mut method.service_policy, path_level);
                }
            }
        }
    }

    /// 预热全部查找索引，使发布后的快照在读路径上不再构建缓存。
    pub(crate) fn warm(&self) {
        self.group_index.warm(&self.groups);
        for group in &self.groups {
            group.path_index.warm(&group.paths);
            for path in &group.paths {
                path.method_index.warm(&path.methods);
            }
        }
    }

    pub(crate) fn collect_ids(&self, ids: &mut Vec<i64>) {
        let mut visit = |policy: Option<&ServicePolicy>| {
            if let Some(policy) = policy {
                policy.collect_ids(ids);
            }
        };
        visit(self.service_policy.as_ref());
        for group in &self.groups {
            visit(group.service_policy.as_ref());
            for path in &group.paths {
                visit(path.service_policy.as_ref());
                for method in &path.methods {
                    visit(method.service_policy.as_ref());
                }
            }
        }
    }
}

impl Named for Service {
    fn name(&self) -> &str {
        &self.name
    }
}
