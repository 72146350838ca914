//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 引擎自身的运行参数：需要捕获的透传键、出站写回时的头部前缀、各治理能力的开关，
//!   以及重试对“幂等未声明”调用的默认态度；
//! - 与策略快照分离：快照由控制面下发、按版本替换；配置由宿主装载，可在运行期整体替换。
//!
//! ## 契约（What）
//! - [`GovernanceConfig`] 全部字段都有默认值，空文档即得到“全部开启、不捕获任何键”的配置；
//! - [`RuntimeGovernanceConfig`] 读无锁、写常数时间，`config_epoch` 在每次成功替换后加一；
//!   校验失败的更新不会生效，纪元保持不变。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::carrier::CargoRequire;
use crate::error::ConfigError;
use crate::observability::targets;

/// 透传载体相关配置。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarrierConfig {
    /// 入站时需要捕获的键。
    pub require: CargoRequire,
    /// 出站写回时补全的前缀；为空则按原键写回。
    pub transmit_prefix: String,
}

/// 治理能力开关。
///
/// 关闭某项能力只影响新进入的调用；已持有的许可照常归还。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSwitches {
    pub fault_injection: bool,
    pub routing: bool,
    pub circuit_break: bool,
    pub rate_limit: bool,
    pub concurrency_limit: bool,
    pub retry: bool,
}

impl Default for FeatureSwitches {
    fn default() -> Self {
        Self {
            fault_injection: true,
            routing: true,
            circuit_break: true,
            rate_limit: true,
            concurrency_limit: true,
            retry: true,
        }
    }
}

/// 重试默认值。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryDefaults {
    /// 策略未显式声明 `require_idempotent` 时采用的取值。
    pub require_idempotent: bool,
}

/// 引擎配置。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 所有段落可缺省；
///   - `carrier.transmit_prefix` 若非空，只能包含 ASCII 字母、数字与 `-`、`_`，
///     否则写回的头部名称不合法；
/// - **使用 (How)**：宿主可直接构造，或经 [`GovernanceConfig::from_toml_str`] 从文件装载。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub carrier: CarrierConfig,
    pub switches: FeatureSwitches,
    pub retry: RetryDefaults,
}

impl GovernanceConfig {
    /// 解析并校验 TOML 文档。
    #[cfg(feature = "toml-config")]
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(document).map_err(|err| ConfigError::Parse {
            format: "toml",
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.carrier.transmit_prefix;
        if !prefix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ConfigError::Invalid {
                field: "carrier.transmit_prefix".into(),
                reason: format!("`{prefix}` is not a valid header name prefix"),
            });
        }
        let require = &self.carrier.require;
        if let Some(empty) = require
            .names
            .iter()
            .chain(require.prefixes.iter())
            .find(|entry| entry.trim().is_empty())
        {
            return Err(ConfigError::Invalid {
                field: "carrier.require".into(),
                reason: format!("blank entry `{empty}`"),
            });
        }
        Ok(())
    }
}

/// 热更新友好的引擎配置容器。
pub struct RuntimeGovernanceConfig {
    current: ArcSwap<GovernanceConfig>,
    epoch: AtomicU64,
}

impl RuntimeGovernanceConfig {
    pub fn new(initial: GovernanceConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            epoch: AtomicU64::new(0),
        }
    }

    /// 当前配置快照；调用方可在一次调用内持有，不受并发替换影响。
    pub fn snapshot(&self) -> Arc<GovernanceConfig> {
        self.current.load_full()
    }

    /// 配置纪元，从 0 开始。
    pub fn config_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// 校验后替换。
    pub fn replace(&self, config: GovernanceConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.current.store(Arc::new(config));
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(target: targets::POLICY, epoch, "governance config replaced");
        Ok(())
    }

    /// 解析 TOML 文档并替换。
    #[cfg(feature = "toml-config")]
    pub fn update_from_toml(&self, document: &str) -> Result<(), ConfigError> {
        let config = GovernanceConfig::from_toml_str(document)?;
        self.replace(config)
    }
}

impl Default for RuntimeGovernanceConfig {
    fn default() -> Self {
        Self::new(GovernanceConfig::default())
    }
}

impl std::fmt::Debug for RuntimeGovernanceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeGovernanceConfig")
            .field("epoch", &self.config_epoch())
            .field("current", &self.current.load())
            .finish()
    }
}
