//! # matcher 模块说明
//!
//! ## 角色定位（Why）
//! - 路由与故障注入都以“请求标签是否满足条件”为前提；把取值提取与运算符判定拆开，
//!   四类标签来源（头部、Cookie、查询参数、附件）共享同一套判定逻辑；
//!
//! ## 契约（What）
//! - [`TagExtractor`] 只负责按键提取取值，允许返回多个；
//! - [`ExtractingMatcher`] 组合提取器与 [`TagCondition::matches_any`]；
//! - [`TagMatcherRegistry`] 按条件类型分派，并提供规则级（与/或）与策略级（按序首个命中）求值；
//!
//! ## 风险（Trade-offs）
//! - 提取结果以 `Vec<&str>` 返回，单值场景多一次小分配，换取 HTTP 多值头与 RPC 单值附件的统一处理。

use crate::policy::{RelationType, RoutePolicy, TagCondition, TagKind, TagRule};
use crate::request::Request;

/// 按键从请求中提取标签取值。
pub trait TagExtractor: Send + Sync {
    fn extract<'r>(&self, request: &'r dyn Request, key: &str) -> Vec<&'r str>;
}

/// 判定单个条件是否成立。
pub trait TagMatcher: Send + Sync {
    fn matches(&self, condition: &TagCondition, request: &dyn Request) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderExtractor;

impl TagExtractor for HeaderExtractor {
    fn extract<'r>(&self, request: &'r dyn Request, key: &str) -> Vec<&'r str> {
        request.headers(key)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CookieExtractor;

impl TagExtractor for CookieExtractor {
    fn extract<'r>(&self, request: &'r dyn Request, key: &str) -> Vec<&'r str> {
        request.cookie(key).into_iter().collect()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QueryExtractor;

impl TagExtractor for QueryExtractor {
    fn extract<'r>(&self, request: &'r dyn Request, key: &str) -> Vec<&'r str> {
        request.query(key)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AttachmentExtractor;

impl TagExtractor for AttachmentExtractor {
    fn extract<'r>(&self, request: &'r dyn Request, key: &str) -> Vec<&'r str> {
        request.attachment(key).into_iter().collect()
    }
}

/// 以提取器为策略的通用匹配器。
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtractingMatcher<E> {
    extractor: E,
}

impl<E> ExtractingMatcher<E> {
    pub const fn new(extractor: E) -> Self {
        Self { extractor }
    }
}

impl<E: TagExtractor> TagMatcher for ExtractingMatcher<E> {
    fn matches(&self, condition: &TagCondition, request: &dyn Request) -> bool {
        let values = self.extractor.extract(request, &condition.key);
        condition.matches_any(&values)
    }
}

pub type HeaderMatcher = ExtractingMatcher<HeaderExtractor>;
pub type CookieMatcher = ExtractingMatcher<CookieExtractor>;
pub type QueryMatcher = ExtractingMatcher<QueryExtractor>;
pub type AttachmentMatcher = ExtractingMatcher<AttachmentExtractor>;

/// 按条件类型分派的匹配器注册表。
///
/// # 教案式说明
/// - **契约 (What)**：默认注册四类内置匹配器；宿主可用 [`TagMatcherRegistry::with_matcher`]
///   替换任一类型，例如从网关上下文而非原始头部取值；
/// - **求值 (How)**：
///   - 规则：`And` 要求全部条件成立，`Or` 要求任一成立，空条件总是成立；
///   - 策略：按规则 `order` 升序，首个完全命中的规则胜出；
///   - 多个路由策略：按策略 `order` 升序，依次求值，首个产生命中的策略胜出。
pub struct TagMatcherRegistry {
    header: Box<dyn TagMatcher>,
    cookie: Box<dyn TagMatcher>,
    query: Box<dyn TagMatcher>,
    attachment: Box<dyn TagMatcher>,
}

impl Default for TagMatcherRegistry {
    fn default() -> Self {
        Self {
            header: Box::new(HeaderMatcher::default()),
            cookie: Box::new(CookieMatcher::default()),
            query: Box::new(QueryMatcher::default()),
            attachment: Box::new(AttachmentMatcher::default()),
        }
    }
}

impl std::fmt::Debug for TagMatcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagMatcherRegistry").finish_non_exhaustive()
    }
}

impl TagMatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_matcher(mut self, kind: TagKind, matcher: impl TagMatcher + 'static) -> Self {
        let slot = match kind {
            TagKind::Header => &mut self.header,
            TagKind::Cookie => &mut self.cookie,
            TagKind::Query => &mut self.query,
            TagKind::Attachment => &mut self.attachment,
        };
        let boxed: Box<dyn TagMatcher> = Box::new(matcher);
        *slot = boxed;
        self
    }

    fn matcher(&self, kind: TagKind) -> &dyn TagMatcher {
        match kind {
            TagKind::Header => self.header.as_ref(),
            TagKind::Cookie => self.cookie.as_ref(),
            TagKind::Query => self.query.as_ref(),
            TagKind::Attachment => self.attachment.as_ref(),
        }
    }

    pub fn matches(&self, condition: &TagCondition, request: &dyn Request) -> bool {
        self.matcher(condition.kind).matches(condition, request)
    }

    /// 按组合关系求值一组条件。
    pub fn matches_all(
        &self,
        conditions: &[TagCondition],
        relation: RelationType,
        request: &dyn Request,
    ) -> bool {
        if conditions.is_empty() {
            return true;
        }
        match relation {
            RelationType::And => conditions.iter().all(|c| self.matches(c, request)),
            RelationType::Or => conditions.iter().any(|c| self.matches(c, request)),
        }
    }

    pub fn rule_matches(&self, rule: &TagRule, request: &dyn Request) -> bool {
        self.matches_all(&rule.conditions, rule.relation, request)
    }

    /// 返回策略内首个命中的规则；无命中返回 `None`（走默认路由）。
    pub fn select_rule<'p>(&self, policy: &'p RoutePolicy, request: &dyn Request) -> Option<&'p TagRule> {
        policy
            .sorted_rules()
            .find(|rule| self.rule_matches(rule, request))
    }

    /// 在多个路由策略中按 `order` 升序查找首个命中。
    pub fn select_route<'p>(
        &self,
        policies: &'p [RoutePolicy],
        request: &dyn Request,
    ) -> Option<(&'p RoutePolicy, &'p TagRule)> {
        let mut ordered: Vec<&RoutePolicy> = policies.iter().collect();
        ordered.sort_by_key(|policy| policy.order);
        ordered
            .into_iter()
            .find_map(|policy| self.select_rule(policy, request).map(|rule| (policy, rule)))
    }
}
