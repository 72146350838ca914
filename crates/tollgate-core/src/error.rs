//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为治理引擎对外暴露的错误语义提供集中定义：拒绝类（熔断、限流、并发、故障注入）、
//!   调用方取消/截止、上游失败、重试耗尽与内部异常；
//! - 每个变体都映射到 [`codes`] 中的稳定错误码，传输适配层据此生成协议相关的响应。
//!
//! ## 设计要求（What）
//! - 拒绝类错误是“预期内的结构化结果”，不应作为引擎故障记录 `error` 日志；
//! - 内部错误不得穿透生命周期钩子，调用点需捕获并按放行处理（fail-open）；
//! - 重试耗尽时原样保留最后一次上游错误，仅附加尝试次数。

use thiserror::Error;

use crate::lifecycle::Decision;
use crate::policy::DegradeConfig;

/// 稳定错误码集合，遵循 `<域>.<语义>` 命名。
pub mod codes {
    /// 熔断器处于打开态或半开态试探名额已满。
    pub const CIRCUIT_OPEN: &str = "governance.circuit_open";
    /// 任一滑动窗口额度耗尽。
    pub const RATE_LIMITED: &str = "governance.rate_limited";
    /// 并发隔离舱无空闲槽位且等待超时。
    pub const CONCURRENCY_LIMITED: &str = "governance.concurrency_limited";
    /// 故障注入策略命中错误分支。
    pub const FAULT_INJECTED: &str = "governance.fault_injected";
    /// 调用方主动取消。
    pub const CANCELLED: &str = "governance.cancelled";
    /// 调用方截止时间先于治理等待到期。
    pub const DEADLINE_EXCEEDED: &str = "governance.deadline_exceeded";
    /// 被治理的底层调用失败。
    pub const UPSTREAM: &str = "governance.upstream";
    /// 重试次数耗尽。
    pub const RETRY_EXHAUSTED: &str = "governance.retry_exhausted";
    /// 引擎内部异常，调用路径应按放行处理。
    pub const INTERNAL: &str = "governance.internal";
    /// 策略字段非法。
    pub const POLICY_INVALID: &str = "policy.invalid";
    /// 配置或快照文档解析失败。
    pub const CONFIG_INVALID: &str = "config.invalid";
}

/// 被治理调用的底层失败描述。
///
/// # 教案式说明
/// - **意图 (Why)**：拦截层与传输适配层各有自己的异常体系，引擎只关心“错误码 / 状态码 / 描述”
///   三元组，用以驱动熔断统计与重试判定；
/// - **契约 (What)**：`code` 对应策略中的 `error_codes` / `retryable_error_codes`；`status` 对应
///   HTTP 等协议状态码；二者均可缺省；
/// - **风险 (Trade-offs)**：以 `String` 承载描述，换取跨协议的可读性，热路径上仅在失败时分配。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("upstream call failed: {message}")]
pub struct UpstreamError {
    code: Option<String>,
    status: Option<u16>,
    message: String,
}

impl UpstreamError {
    /// 以描述构造上游错误。
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            status: None,
            message: message.into(),
        }
    }

    /// 附加业务/异常错误码。
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// 附加协议状态码。
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 治理引擎错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合决策路径上的全部失败结果，为适配层统一转换为协议响应做准备；
/// - **契约 (What)**：
///   - 所有变体 `Send + Sync + 'static`，可跨线程传播；
///   - [`GovernanceError::code`] 返回稳定错误码；
///   - [`GovernanceError::is_rejection`] 区分“治理拒绝”与“上游/内部失败”；
/// - **设计权衡 (Trade-offs)**：熔断拒绝携带降级配置的克隆，便于适配层直接生成兜底响应，
///   代价是一次小对象拷贝，仅发生在拒绝路径。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum GovernanceError {
    #[error("circuit breaker `{policy_id}` rejected the call")]
    CircuitBreakerOpen {
        policy_id: i64,
        degrade: Option<DegradeConfig>,
    },

    #[error("rate limit `{policy_id}` exceeded: {threshold} requests per {window_ms}ms")]
    RateLimited {
        policy_id: i64,
        threshold: u64,
        window_ms: u64,
    },

    #[error("concurrency limit `{policy_id}` reached (max {max_concurrency} in flight)")]
    ConcurrencyLimited { policy_id: i64, max_concurrency: u32 },

    #[error("fault injected by policy `{policy_id}`: [{code}] {message}")]
    FaultInjected {
        policy_id: i64,
        code: i32,
        message: String,
    },

    #[error("call cancelled while {stage}")]
    Cancelled { stage: &'static str },

    #[error("deadline exceeded while {stage}")]
    DeadlineExceeded { stage: &'static str },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("retry exhausted after {attempts} attempts")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: UpstreamError,
    },

    #[error("internal governance failure: {detail}")]
    Internal { detail: String },
}

impl GovernanceError {
    /// 构造内部错误。
    pub fn internal(detail: impl Into<String>) -> Self {
        GovernanceError::Internal {
            detail: detail.into(),
        }
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            GovernanceError::CircuitBreakerOpen { .. } => codes::CIRCUIT_OPEN,
            GovernanceError::RateLimited { .. } => codes::RATE_LIMITED,
            GovernanceError::ConcurrencyLimited { .. } => codes::CONCURRENCY_LIMITED,
            GovernanceError::FaultInjected { .. } => codes::FAULT_INJECTED,
            GovernanceError::Cancelled { .. } => codes::CANCELLED,
            GovernanceError::DeadlineExceeded { .. } => codes::DEADLINE_EXCEEDED,
            GovernanceError::Upstream(_) => codes::UPSTREAM,
            GovernanceError::RetryExhausted { .. } => codes::RETRY_EXHAUSTED,
            GovernanceError::Internal { .. } => codes::INTERNAL,
        }
    }

    /// 是否为治理主动拒绝（未执行底层调用）。
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            GovernanceError::CircuitBreakerOpen { .. }
                | GovernanceError::RateLimited { .. }
                | GovernanceError::ConcurrencyLimited { .. }
                | GovernanceError::FaultInjected { .. }
        )
    }

    /// 是否具备重试资格：只有上游失败可以重试，治理拒绝、取消与截止一律不重试。
    ///
    /// 具体错误码/状态码是否在重试名单内，由 [`crate::policy::FailoverPolicy::is_retryable`] 判定。
    pub fn is_retryable(&self) -> bool {
        matches!(self, GovernanceError::Upstream(_))
    }

    /// 未执行即终止的错误对应的决策分类：治理拒绝，或取消与截止；其他返回 `None`。
    pub fn decision(&self) -> Option<Decision> {
        match self {
            GovernanceError::CircuitBreakerOpen { .. } => Some(Decision::RejectCircuitBreak),
            GovernanceError::RateLimited { .. } => Some(Decision::RejectRateLimit),
            GovernanceError::ConcurrencyLimited { .. } => Some(Decision::RejectConcurrency),
            GovernanceError::FaultInjected { .. } => Some(Decision::FaultInjected),
            GovernanceError::Cancelled { .. } | GovernanceError::DeadlineExceeded { .. } => {
                Some(Decision::Aborted)
            }
            _ => None,
        }
    }

    /// 若为上游失败，返回底层错误。
    pub fn upstream(&self) -> Option<&UpstreamError> {
        match self {
            GovernanceError::Upstream(err) => Some(err),
            GovernanceError::RetryExhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}

/// 策略内容不合法时的错误，只在构造执行器或校验快照时出现。
///
/// 调用路径必须把它视为内部错误：记录告警后放行，而不是拒绝调用。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("policy `{policy_id}` field `{field}` is invalid: {reason}")]
    InvalidField {
        policy_id: i64,
        field: &'static str,
        reason: String,
    },

    #[error("tag condition `{key}` carries an invalid pattern: {reason}")]
    InvalidPattern { key: String, reason: String },
}

impl PolicyError {
    pub(crate) fn invalid(policy_id: i64, field: &'static str, reason: impl Into<String>) -> Self {
        PolicyError::InvalidField {
            policy_id,
            field,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        codes::POLICY_INVALID
    }
}

impl From<PolicyError> for GovernanceError {
    fn from(value: PolicyError) -> Self {
        GovernanceError::Internal {
            detail: value.to_string(),
        }
    }
}

/// 配置与快照文档装载错误。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to parse {format} document: {detail}")]
    Parse { format: &'static str, detail: String },

    #[error("invalid configuration `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        codes::CONFIG_INVALID
    }
}
