//! # carrier 模块说明
//!
//! ## 角色定位（Why）
//! - 多活与泳道路由依赖一组“随调用链透传”的标签（如用户所属单元、泳道标记）；
//!   入站时从请求头、Cookie 与 RPC 附件捕获，出站时写回下游请求，调用链上的每一跳都能读到同一份标签；
//!
//! ## 契约（What）
//! - [`Carrier`] 以小写键保存 [`Cargo`]，一个键可对应多个取值；
//! - [`CargoRequire`] 以“精确名称 + 前缀”描述需要捕获的键，比较大小写不敏感；
//! - [`CarrierSlot`] 是绑定到单次逻辑调用的显式句柄：进入时挂载、退出时卸载；
//!   跨异步边界需要显式克隆句柄，而不是依赖线程本地状态；
//! - 扇出（一次入站触发多个并发出站）时使用 [`Carrier::fork`] 复制，各分支互不影响。

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

use crate::request::{HeaderWriter, Request};

/// 一个透传键及其全部取值。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cargo {
    pub key: String,
    pub values: Vec<String>,
}

impl Cargo {
    pub fn new(key: impl AsRef<str>, value: impl Into<String>) -> Self {
        Self {
            key: key.as_ref().to_ascii_lowercase(),
            values: vec![value.into()],
        }
    }

    /// 首个取值。
    pub fn value(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }
}

/// 需要捕获的透传键集合。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CargoRequire {
    pub names: Vec<String>,
    pub prefixes: Vec<String>,
}

impl CargoRequire {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl AsRef<str>) -> Self {
        self.names.push(name.as_ref().to_ascii_lowercase());
        self
    }

    pub fn with_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        self.prefixes.push(prefix.as_ref().to_ascii_lowercase());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.prefixes.is_empty()
    }

    pub fn matches(&self, key: &str) -> bool {
        self.names.iter().any(|name| name.eq_ignore_ascii_case(key))
            || self.prefixes.iter().any(|prefix| {
                key.len() >= prefix.len()
                    && key.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
            })
    }

    /// 合并另一组要求，去重。
    pub fn merge(&mut self, other: &CargoRequire) {
        for name in &other.names {
            if !self.names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                self.names.push(name.to_ascii_lowercase());
            }
        }
        for prefix in &other.prefixes {
            if !self.prefixes.iter().any(|p| p.eq_ignore_ascii_case(prefix)) {
                self.prefixes.push(prefix.to_ascii_lowercase());
            }
        }
    }
}

/// 透传标签容器。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Carrier {
    cargos: BTreeMap<String, Cargo>,
}

impl Carrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加取值；同一取值不会重复记录。
    pub fn add_cargo(&mut self, key: &str, value: &str) {
        let key = key.to_ascii_lowercase();
        let cargo = self.cargos.entry(key.clone()).or_insert_with(|| Cargo {
            key,
            values: Vec::new(),
        });
        if !cargo.values.iter().any(|existing| existing == value) {
            cargo.values.push(value.to_owned());
        }
    }

    /// 覆盖写入。
    pub fn set_cargo(&mut self, cargo: Cargo) {
        let key = cargo.key.to_ascii_lowercase();
        self.cargos.insert(
            key.clone(),
            Cargo {
                key,
                values: cargo.values,
            },
        );
    }

    pub fn remove_cargo(&mut self, key: &str) -> Option<Cargo> {
        self.cargos.remove(&key.to_ascii_lowercase())
    }

    pub fn cargo(&self, key: &str) -> Option<&Cargo> {
        self.cargos.get(&key.to_ascii_lowercase())
    }

    pub fn cargos(&self) -> impl Iterator<Item = &Cargo> {
        self.cargos.values()
    }

    pub fn len(&self) -> usize {
        self.cargos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cargos.is_empty()
    }

    /// 从入站请求中捕获满足要求的头部（RPC 请求即附件）与 Cookie。
    pub fn capture(&mut self, require: &CargoRequire, request: &dyn Request) -> usize {
        if require.is_empty() {
            return 0;
        }
        let mut captured = 0;
        let headers = request.header_entries();
        let cookies = request.cookie_entries();
        for (key, value) in headers.into_iter().chain(cookies) {
            if require.matches(key) {
                self.add_cargo(key, value);
                captured += 1;
            }
        }
        captured
    }

    /// 把全部标签写入出站请求：每个键先覆盖写入首个取值，其余取值追加。
    pub fn transmit(&self, writer: &mut dyn HeaderWriter) {
        self.transmit_prefixed(writer, "");
    }

    /// 同 [`Carrier::transmit`]，但为尚未带有 `prefix` 的键补上前缀。
    pub fn transmit_prefixed(&self, writer: &mut dyn HeaderWriter, prefix: &str) {
        for cargo in self.cargos.values() {
            let prefixed;
            let key = if prefix.is_empty() || cargo.key.starts_with(&prefix.to_ascii_lowercase()) {
                cargo.key.as_str()
            } else {
                prefixed = format!("{prefix}{}", cargo.key);
                prefixed.as_str()
            };
            let mut values = cargo.values.iter();
            if let Some(first) = values.next() {
                writer.set_header(key, first);
            }
            for value in values {
                writer.add_header(key, value);
            }
        }
    }

    /// 扇出复制。
    pub fn fork(&self) -> Self {
        self.clone()
    }
}

/// 绑定到单次逻辑调用的载体句柄。
///
/// 克隆共享同一挂载点：在一处卸载后，所有克隆都读不到载体。
#[derive(Clone, Debug, Default)]
pub struct CarrierSlot {
    current: Arc<ArcSwapOption<Carrier>>,
}

impl CarrierSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 挂载载体，返回被替换的旧载体。
    pub fn attach(&self, carrier: Carrier) -> Option<Arc<Carrier>> {
        self.current.swap(Some(Arc::new(carrier)))
    }

    pub fn detach(&self) -> Option<Arc<Carrier>> {
        self.current.swap(None)
    }

    pub fn current(&self) -> Option<Arc<Carrier>> {
        self.current.load_full()
    }

    pub fn is_attached(&self) -> bool {
        self.current.load().is_some()
    }

    /// 以写时复制方式修改当前载体；未挂载时不做任何事。
    pub fn update(&self, mut apply: impl FnMut(&mut Carrier)) {
        self.current.rcu(|current| {
            current.as_ref().map(|carrier| {
                let mut next = Carrier::clone(carrier);
                apply(&mut next);
                Arc::new(next)
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{HttpRequest, RpcRequest};

    fn require() -> CargoRequire {
        CargoRequire::new().with_name("x-live-uid").with_prefix("x-lane-")
    }

    #[test]
    fn captures_named_and_prefixed_headers() {
        let request = HttpRequest::new("svc")
            .with_header("X-Live-Uid", "42")
            .with_header("X-Lane-Code", "gray")
            .with_header("accept", "*/*");
        let mut carrier = Carrier::new();
        assert_eq!(carrier.capture(&require(), &request), 2);
        assert_eq!(carrier.cargo("x-live-uid").and_then(Cargo::value), Some("42"));
        assert!(carrier.cargo("accept").is_none());
    }

    #[test]
    fn captures_cookies_by_name_and_prefix() {
        let request = HttpRequest::new("svc")
            .with_cookie("x-live-uid", "42")
            .with_header("Cookie", "x-lane-code=gray; session=abc");
        let mut carrier = Carrier::new();
        assert_eq!(carrier.capture(&require(), &request), 2);
        assert_eq!(carrier.cargo("x-live-uid").and_then(Cargo::value), Some("42"));
        assert_eq!(carrier.cargo("x-lane-code").and_then(Cargo::value), Some("gray"));
        assert!(carrier.cargo("session").is_none(), "未声明的 Cookie 不应捕获");
    }

    #[test]
    fn transmit_sets_then_appends() {
        let mut carrier = Carrier::new();
        carrier.add_cargo("x-lane-code", "gray");
        carrier.add_cargo("x-lane-code", "blue");
        let mut outbound = HttpRequest::new("down").with_header("x-lane-code", "stale");
        carrier.transmit(&mut outbound);
        assert_eq!(outbound.headers("x-lane-code"), ["gray", "blue"]);
    }

    #[test]
    fn prefixed_transmit_skips_already_prefixed_keys() {
        let mut carrier = Carrier::new();
        carrier.add_cargo("uid", "7");
        carrier.add_cargo("x-tg-unit", "u1");
        let mut outbound = RpcRequest::new("down");
        carrier.transmit_prefixed(&mut outbound, "x-tg-");
        assert_eq!(outbound.attachment("x-tg-uid"), Some("7"));
        assert_eq!(outbound.attachment("x-tg-unit"), Some("u1"));
    }

    #[test]
    fn slot_clones_share_attachment() {
        let slot = CarrierSlot::new();
        let handle = slot.clone();
        slot.attach(Carrier::new());
        handle.update(|carrier| carrier.add_cargo("k", "v"));
        assert_eq!(
            slot.current().and_then(|c| c.cargo("k").cloned()),
            Some(Cargo::new("k", "v"))
        );
        slot.detach();
        assert!(!handle.is_attached());
    }

    #[test]
    fn fork_is_independent() {
        let mut parent = Carrier::new();
        parent.add_cargo("k", "v");
        let mut child = parent.fork();
        child.add_cargo("k", "w");
        assert_eq!(parent.cargo("k").map(|c| c.values.len()), Some(1));
        assert_eq!(child.cargo("k").map(|c| c.values.len()), Some(2));
    }
}
