//! 多活空间、泳道空间与数据库集群。

use serde::{Deserialize, Serialize};

use super::{Named, NameIndex};

/// 单元内的分区（cell）。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub code: String,
    #[serde(default)]
    pub name: String,
}

impl Named for Cell {
    fn name(&self) -> &str {
        &self.code
    }
}

/// 多活单元。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Unit {
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cells: Vec<Cell>,
    #[serde(skip)]
    cell_index: NameIndex,
}

impl Unit {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    pub fn with_cell(mut self, code: impl Into<String>) -> Self {
        self.cells.push(Cell {
            code: code.into(),
            name: String::new(),
        });
        self.cell_index = NameIndex::default();
        self
    }

    pub fn cell(&self, code: &str) -> Option<&Cell> {
        self.cell_index.find(&self.cells, code)
    }
}

impl Named for Unit {
    fn name(&self) -> &str {
        &self.code
    }
}

/// 多活空间：一组可承接流量的单元。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LiveSpace {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub units: Vec<Unit>,
    #[serde(skip)]
    unit_index: NameIndex,
}

impl LiveSpace {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.units.push(unit);
        self.unit_index = NameIndex::default();
        self
    }

    pub fn unit(&self, code: &str) -> Option<&Unit> {
        self.unit_index.find(&self.units, code)
    }

    pub(crate) fn warm(&self) {
        self.unit_index.warm(&self.units);
        for unit in &self.units {
            unit.cell_index.warm(&unit.cells);
        }
    }
}

impl Named for LiveSpace {
    fn name(&self) -> &str {
        &self.id
    }
}

/// 泳道。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lane {
    pub code: String,
    #[serde(default)]
    pub name: String,
}

impl Named for Lane {
    fn name(&self) -> &str {
        &self.code
    }
}

/// 泳道空间。
///
/// 请求指定的泳道不存在时回落到 `default_lane`，两者都缺失则不打泳道标记。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LaneSpace {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub default_lane: Option<String>,
    #[serde(default)]
    pub lanes: Vec<Lane>,
    #[serde(skip)]
    lane_index: NameIndex,
}

impl LaneSpace {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_lane(mut self, code: impl Into<String>) -> Self {
        self.lanes.push(Lane {
            code: code.into(),
            name: String::new(),
        });
        self.lane_index = NameIndex::default();
        self
    }

    pub fn with_default_lane(mut self, code: impl Into<String>) -> Self {
        self.default_lane = Some(code.into());
        self
    }

    pub fn lane(&self, code: &str) -> Option<&Lane> {
        self.lane_index.find(&self.lanes, code)
    }

    /// 解析生效泳道。
    pub fn resolve_lane(&self, requested: Option<&str>) -> Option<&Lane> {
        requested
            .and_then(|code| self.lane(code))
            .or_else(|| self.default_lane.as_deref().and_then(|code| self.lane(code)))
    }

    pub(crate) fn warm(&self) {
        self.lane_index.warm(&self.lanes);
    }
}

impl Named for LaneSpace {
    fn name(&self) -> &str {
        &self.id
    }
}

/// 数据库访问模式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

/// 数据库集群描述，数据库适配层据此选择单元内的访问地址。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseCluster {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub access_mode: AccessMode,
}

impl Named for DatabaseCluster {
    fn name(&self) -> &str {
        &self.name
    }
}
