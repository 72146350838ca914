//! 治理快照。

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::service::{Service, ServicePolicy};
use super::space::{DatabaseCluster, LaneSpace, LiveSpace};
use super::NameIndex;
#[cfg(any(feature = "json", feature = "toml-config"))]
use crate::error::ConfigError;

/// 一次完整下发的治理快照。
///
/// # 教案式说明
/// - **意图 (Why)**：决策路径只读共享同一份快照，替换通过一次原子指针交换完成，
///   读者永远看到某个完整版本，不会看到半更新状态；
/// - **契约 (What)**：
///   - 反序列化得到的是“原始”快照，必须经 [`GovernancePolicy::build`] 剔除非法策略、
///     沿层级补全并预热索引后才可发布；
///   - 发布后的快照不可变，查找大小写不敏感；
///   - `defaults` 是全局默认策略，位于补全链最末端；
/// - **风险 (Trade-offs)**：补全会把上层策略字段复制到下层，换取决策期零回溯。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GovernancePolicy {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub live_spaces: Vec<LiveSpace>,
    #[serde(default)]
    pub lane_spaces: Vec<LaneSpace>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub database_clusters: Vec<DatabaseCluster>,
    #[serde(default)]
    pub defaults: Option<ServicePolicy>,
    #[serde(skip)]
    indexes: SnapshotIndexes,
}

#[derive(Clone, Debug, Default)]
struct SnapshotIndexes {
    services: NameIndex,
    live_spaces: NameIndex,
    lane_spaces: NameIndex,
    database_clusters: NameIndex,
}

impl GovernancePolicy {
    pub fn new(version: i64) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.services.push(service);
        self.indexes.services = NameIndex::default();
        self
    }

    pub fn with_live_space(mut self, space: LiveSpace) -> Self {
        self.live_spaces.push(space);
        self.indexes.live_spaces = NameIndex::default();
        self
    }

    pub fn with_lane_space(mut self, space: LaneSpace) -> Self {
        self.lane_spaces.push(space);
        self.indexes.lane_spaces = NameIndex::default();
        self
    }

    pub fn with_database_cluster(mut self, cluster: DatabaseCluster) -> Self {
        self.database_clusters.push(cluster);
        self.indexes.database_clusters = NameIndex::default();
        self
    }

    pub fn with_defaults(mut self, defaults: ServicePolicy) -> Self {
        self.defaults = Some(defaults);
        self
    }

    /// 从 JSON 文档解析原始快照。
    #[cfg(feature = "json")]
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(document).map_err(|err| ConfigError::Parse {
            format: "json",
            detail: err.to_string(),
        })
    }

    /// 从 TOML 文档解析原始快照。
    #[cfg(feature = "toml-config")]
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        toml::from_str(document).map_err(|err| ConfigError::Parse {
            format: "toml",
            detail: err.to_string(),
        })
    }

    /// 剔除非法策略、沿层级补全并预热全部索引，得到可发布的共享快照。
    pub fn build(mut self) -> Arc<Self> {
        if let Some(defaults) = self.defaults.as_mut() {
            defaults.sanitize();
        }
        let defaults = self.defaults.as_ref();
        for service in self.services.iter_mut() {
            service.prepare(defaults);
        }
        self.warm();
        Arc::new(self)
    }

    fn warm(&self) {
        self.indexes.services.warm(&self.services);
        self.indexes.live_spaces.warm(&self.live_spaces);
        self.indexes.lane_spaces.warm(&self.lane_spaces);
        self.indexes.database_clusters.warm(&self.database_clusters);
        self.services.iter().for_each(Service::warm);
        self.live_spaces.iter().for_each(LiveSpace::warm);
        self.lane_spaces.iter().for_each(LaneSpace::warm);
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.indexes.services.find(&self.services, name)
    }

    pub fn live_space(&self, id: &str) -> Option<&LiveSpace> {
        self.indexes.live_spaces.find(&self.live_spaces, id)
    }

    pub fn lane_space(&self, id: &str) -> Option<&LaneSpace> {
        self.indexes.lane_spaces.find(&self.lane_spaces, id)
    }

    pub fn database_cluster(&self, name: &str) -> Option<&DatabaseCluster> {
        self.indexes.database_clusters.find(&self.database_clusters, name)
    }

    /// 解析某次调用生效的策略集合：最具体层级优先，未知服务回落到全局默认值。
    pub fn resolve(
        &self,
        service: &str,
        group: Option<&str>,
        path: Option<&str>,
        method: Option<&str>,
    ) -> Option<&ServicePolicy> {
        self.service(service)
            .and_then(|service| service.resolve_policy(group, path, method))
            .or(self.defaults.as_ref())
    }

    /// 快照中出现的全部有状态策略 id（熔断、限流、并发、重试）。
    pub fn policy_ids(&self) -> HashSet<i64> {
        let mut ids = Vec::new();
        if let Some(defaults) = &self.defaults {
            defaults.collect_ids(&mut ids);
        }
        for service in &self.services {
            service.collect_ids(&mut ids);
        }
        ids.into_iter().collect()
    }
}
