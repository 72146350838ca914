//! # tollgate-core
//!
//! ## 定位与职责（Why）
//! - 多地域、多单元部署下服务间调用的运行时治理引擎：在调用进入时依据控制面下发的策略快照
//!   做出放行、路由、拒绝或注入故障的决策；
//! - 宿主（HTTP/RPC 拦截层）只负责把调用交给引擎，治理语义全部集中在本 crate。
//!
//! ## 架构概览（Where）
//! - `policy`：策略模型、层级补全与版本单调的快照发布；
//! - `matcher`：按请求头、Cookie、查询参数与 RPC 附件求值标签条件；
//! - `executor`：以策略 id 为键、版本只增不减的执行器缓存；
//! - `resilience`：熔断、滑动窗口限流、并发隔离舱、故障注入与重试；
//! - `carrier`：随调用链透传的标签载体；
//! - `lifecycle`：调用阶段与拦截器链，退出钩子恰好执行一次；
//! - `engine`：把以上部件装配为入站/出站两个入口；
//! - `config`、`observability`、`time`、`contract`、`error`：运行参数、日志约定与计数、
//!   可注入时钟、取消与截止、错误码。
//!
//! ## Feature 策略（Trade-offs）
//! - `json`：快照可从 JSON 解析；
//! - `toml-config`：引擎配置与快照可从 TOML 解析。
//!   两者均默认开启，关闭后仍可通过构造器直接组装策略。

pub mod carrier;
pub mod config;
pub mod contract;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod matcher;
pub mod observability;
pub mod policy;
pub mod request;
pub mod resilience;
pub mod time;

pub use carrier::{Cargo, CargoRequire, Carrier, CarrierSlot};
pub use config::{GovernanceConfig, RuntimeGovernanceConfig};
pub use contract::{CallContext, Cancellation, Deadline, Idempotency};
pub use engine::{Admission, ExecutorCaches, GovernanceEngine, GovernanceEngineBuilder};
pub use error::{ConfigError, GovernanceError, PolicyError, UpstreamError};
pub use executor::{VersionedExecutor, VersionedExecutorFactory};
pub use lifecycle::{
    Decision, Direction, Interceptor, InvocationContext, InvocationGuard, InvocationPhase, Lifecycle,
};
pub use matcher::TagMatcherRegistry;
pub use observability::{DecisionStats, DecisionStatsSnapshot};
pub use policy::{GovernancePolicy, PolicySupervisor};
pub use request::{HeaderWriter, HttpRequest, Request, RpcRequest};
pub use time::{Clock, MockClock, SystemClock};
