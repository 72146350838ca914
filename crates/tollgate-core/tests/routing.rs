//! 标签路由：条件组合、规则顺序与引擎决策。

use std::collections::HashSet;
use std::sync::Arc;

use futures::FutureExt;
use proptest::prelude::*;
use tollgate_core::policy::{
    PolicyId, RelationType, RoutePolicy, RouteTarget, Service, ServicePolicy, TagCondition, TagKind,
    TagOperator, TagRule,
};
use tollgate_core::resilience::FixedRandom;
use tollgate_core::{
    CallContext, Decision, GovernanceEngine, GovernanceError, GovernancePolicy, HttpRequest, MockClock,
    RpcRequest, TagMatcherRegistry,
};
use tracing_test::traced_test;

fn engine() -> GovernanceEngine {
    GovernanceEngine::builder()
        .clock(Arc::new(MockClock::new()))
        .random(Arc::new(FixedRandom::new(0)))
        .build()
        .expect("default config")
}

fn prod_v2_rule(order: i32, unit: &str) -> TagRule {
    TagRule::new(order, RelationType::And, RouteTarget::unit(unit).with_lane("gray").with_cell("cell-7"))
        .with_condition(TagCondition::new(TagKind::Header, "x-env", TagOperator::Equal, ["prod"]))
        .with_condition(TagCondition::new(TagKind::Query, "v", TagOperator::Equal, ["2"]))
}

fn publish_routes(engine: &GovernanceEngine, routes: Vec<RoutePolicy>) {
    let policy = routes
        .into_iter()
        .fold(ServicePolicy::default(), ServicePolicy::with_route_policy);
    let outcome = engine.publish(GovernancePolicy::new(1).with_service(Service::new("catalog").with_policy(policy)));
    assert!(outcome.is_applied());
}

fn admitted(engine: &GovernanceEngine, request: &HttpRequest) -> tollgate_core::Admission {
    engine
        .invoke_inbound(request, CallContext::default(), |admission| async move {
            Ok::<_, GovernanceError>(admission)
        })
        .now_or_never()
        .expect("routing never suspends")
        .expect("routing never rejects")
}

#[test]
#[traced_test]
fn and_rule_routes_when_header_and_query_both_match() {
    let engine = engine();
    publish_routes(
        &engine,
        vec![RoutePolicy::new(PolicyId::new(61, 1), "prod-v2").with_rule(prod_v2_rule(1, "unit-b"))],
    );

    let request = HttpRequest::new("catalog")
        .with_header("X-Env", "prod")
        .with_query_string("v=2&debug=false");
    let admission = admitted(&engine, &request);
    assert_eq!(
        admission.decision,
        Decision::Routed {
            unit: Some("unit-b".into()),
            lane: Some("gray".into())
        }
    );
    assert_eq!(admission.route.and_then(|target| target.cell).as_deref(), Some("cell-7"));
    assert_eq!(engine.stats().routed, 1);
    assert!(logs_contain("route rule matched"));
}

#[test]
fn and_rule_falls_through_when_either_condition_is_missing() {
    let engine = engine();
    publish_routes(
        &engine,
        vec![RoutePolicy::new(PolicyId::new(61, 1), "prod-v2").with_rule(prod_v2_rule(1, "unit-b"))],
    );

    let header_only = HttpRequest::new("catalog").with_header("x-env", "prod");
    let query_only = HttpRequest::new("catalog").with_query("v", "2");
    let wrong_value = HttpRequest::new("catalog").with_header("x-env", "pre").with_query("v", "2");
    for request in [&header_only, &query_only, &wrong_value] {
        let admission = admitted(&engine, request);
        assert_eq!(admission.decision, Decision::Pass, "未命中规则时走默认路由");
        assert!(admission.route.is_none());
    }
    assert_eq!(engine.stats().pass, 3);
}

#[test]
fn lower_rule_order_wins_regardless_of_declaration() {
    let engine = engine();
    let catch_all = TagRule::new(2, RelationType::And, RouteTarget::unit("unit-fallback"));
    publish_routes(
        &engine,
        vec![RoutePolicy::new(PolicyId::new(62, 1), "ordered")
            .with_rule(catch_all)
            .with_rule(prod_v2_rule(1, "unit-b"))],
    );

    let matching = HttpRequest::new("catalog").with_header("x-env", "prod").with_query("v", "2");
    let other = HttpRequest::new("catalog");
    assert!(matches!(
        admitted(&engine, &matching).decision,
        Decision::Routed { unit: Some(unit), .. } if unit == "unit-b"
    ));
    assert!(matches!(
        admitted(&engine, &other).decision,
        Decision::Routed { unit: Some(unit), .. } if unit == "unit-fallback"
    ));
}

#[test]
fn negative_operator_matches_absent_tags() {
    let registry = TagMatcherRegistry::new();
    let condition = TagCondition::new(TagKind::Cookie, "tenant", TagOperator::NotIn, ["internal", "qa"]);
    assert!(registry.matches(&condition, &HttpRequest::new("catalog")), "缺失标签满足否定条件");
    assert!(registry.matches(&condition, &HttpRequest::new("catalog").with_cookie("tenant", "acme")));
    assert!(!registry.matches(&condition, &HttpRequest::new("catalog").with_cookie("tenant", "qa")));
}

#[test]
fn regex_operator_matches_attachments() {
    let registry = TagMatcherRegistry::new();
    let condition = TagCondition::new(TagKind::Attachment, "x-user", TagOperator::Regex, [r"^vip-\d+$"]);
    assert!(registry.matches(&condition, &RpcRequest::new("catalog").with_attachment("x-user", "vip-42")));
    assert!(!registry.matches(&condition, &RpcRequest::new("catalog").with_attachment("x-user", "vip-x")));
}

#[test]
fn snapshot_build_drops_route_policies_with_invalid_patterns() {
    let engine = engine();
    let broken = RoutePolicy::new(PolicyId::new(63, 1), "broken").with_rule(
        TagRule::new(1, RelationType::And, RouteTarget::unit("unit-x"))
            .with_condition(TagCondition::new(TagKind::Header, "x-env", TagOperator::Regex, ["("])),
    );
    publish_routes(&engine, vec![broken]);
    let admission = admitted(&engine, &HttpRequest::new("catalog").with_header("x-env", "("));
    assert_eq!(admission.decision, Decision::Pass);
}

#[test]
fn routing_switch_disables_route_selection() {
    let engine = engine();
    publish_routes(
        &engine,
        vec![RoutePolicy::new(PolicyId::new(64, 1), "all")
            .with_rule(TagRule::new(1, RelationType::And, RouteTarget::unit("unit-a")))],
    );
    engine
        .config()
        .update_from_toml("[switches]\nrouting = false")
        .expect("valid config");
    assert_eq!(admitted(&engine, &HttpRequest::new("catalog")).decision, Decision::Pass);
}

proptest! {
    /// 任意声明顺序下，命中的总是 order 最小的规则。
    #[test]
    fn first_match_is_the_lowest_order(orders in proptest::collection::hash_set(-50i32..50, 1..12)) {
        let registry = TagMatcherRegistry::new();
        let orders: Vec<i32> = orders.into_iter().collect();
        let policy = orders.iter().fold(RoutePolicy::new(PolicyId::new(65, 1), "shuffled"), |policy, order| {
            policy.with_rule(TagRule::new(*order, RelationType::And, RouteTarget::unit(order.to_string())))
        });
        let expected = orders.iter().min().copied();
        let selected = registry.select_rule(&policy, &HttpRequest::new("catalog")).map(|rule| rule.order);
        prop_assert_eq!(selected, expected);
        let distinct: HashSet<i32> = policy.sorted_rules().map(|rule| rule.order).collect();
        prop_assert_eq!(distinct.len(), orders.len());
    }
}
