//! # request 模块说明
//!
//! ## 角色定位（Why）
//! - 匹配器、载体与策略解析只需要“读请求标签”这一种能力；把它抽象为 [`Request`]，
//!   HTTP、RPC 与数据库适配层各自实现，引擎无需感知协议；
//! - [`HeaderWriter`] 是出站方向的写入端，载体通过它把透传字段写回下游请求。
//!
//! ## 契约（What）
//! - HTTP 头可重复，[`Request::headers`] 返回全部取值且保持顺序；键查找大小写不敏感；
//! - RPC 附件是扁平映射，对 `headers` 的查询按单值返回，匹配器无需区分两者。

use std::collections::BTreeMap;

/// 被治理调用的只读请求视图。
pub trait Request: Send + Sync {
    /// 目标服务名。
    fn service(&self) -> &str;

    /// 服务分组，未指定时使用默认分组。
    fn group(&self) -> Option<&str> {
        None
    }

    /// HTTP 路径或 RPC 接口名。
    fn path(&self) -> Option<&str> {
        None
    }

    /// HTTP 动词或 RPC 方法名。
    fn method(&self) -> Option<&str> {
        None
    }

    /// 指定头部的全部取值。
    fn headers(&self, key: &str) -> Vec<&str>;

    /// 全部头部键值对，供载体按前缀捕获。
    fn header_entries(&self) -> Vec<(&str, &str)>;

    fn cookie(&self, _key: &str) -> Option<&str> {
        None
    }

    /// 全部 Cookie 键值对，供载体按前缀捕获；不携带 Cookie 的协议返回空。
    fn cookie_entries(&self) -> Vec<(&str, &str)> {
        Vec::new()
    }

    fn query(&self, _key: &str) -> Vec<&str> {
        Vec::new()
    }

    fn attachment(&self, _key: &str) -> Option<&str> {
        None
    }
}

/// 出站请求的头部写入端。
pub trait HeaderWriter {
    /// 覆盖写入（移除同名旧值）。
    fn set_header(&mut self, key: &str, value: &str);

    /// 追加写入，保留同名旧值。
    fn add_header(&mut self, key: &str, value: &str) {
        self.set_header(key, value);
    }
}

/// 自有数据的 HTTP 请求。
///
/// Cookie 既可以显式设置，也会从 `cookie` 头部解析；显式设置优先。
#[derive(Clone, Debug, Default)]
pub struct HttpRequest {
    service: String,
    group: Option<String>,
    path: Option<String>,
    method: Option<String>,
    headers: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    query: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_cookie(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((key.into(), value.into()));
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// 解析 `a=1&b=2` 形式的查询串；不做百分号解码。
    pub fn with_query_string(mut self, query: &str) -> Self {
        for pair in query.trim_start_matches('?').split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            self.query.push((key.to_owned(), value.to_owned()));
        }
        self
    }
}

impl HttpRequest {
    fn header_cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("cookie"))
            .flat_map(|(_, line)| line.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
    }
}

impl Request for HttpRequest {
    fn service(&self) -> &str {
        &self.service
    }

    fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    fn headers(&self, key: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    fn header_entries(&self) -> Vec<(&str, &str)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    fn cookie(&self, key: &str) -> Option<&str> {
        if let Some((_, value)) = self.cookies.iter().find(|(k, _)| k == key) {
            return Some(value.as_str());
        }
        self.header_cookies()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value)
    }

    fn cookie_entries(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .cookies
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for (name, value) in self.header_cookies() {
            if !self.cookies.iter().any(|(k, _)| k == name) {
                entries.push((name, value));
            }
        }
        entries
    }

    fn query(&self, key: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

impl HeaderWriter for HttpRequest {
    fn set_header(&mut self, key: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.headers.push((key.to_owned(), value.to_owned()));
    }

    fn add_header(&mut self, key: &str, value: &str) {
        self.headers.push((key.to_owned(), value.to_owned()));
    }
}

/// 自有数据的 RPC 请求：附件为扁平映射，键按小写存储。
#[derive(Clone, Debug, Default)]
pub struct RpcRequest {
    service: String,
    group: Option<String>,
    interface: Option<String>,
    method: Option<String>,
    attachments: BTreeMap<String, String>,
}

impl RpcRequest {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_attachment(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.attachments
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn attachments(&self) -> &BTreeMap<String, String> {
        &self.attachments
    }
}

impl Request for RpcRequest {
    fn service(&self) -> &str {
        &self.service
    }

    fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    fn path(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    fn headers(&self, key: &str) -> Vec<&str> {
        self.attachment(key).into_iter().collect()
    }

    fn header_entries(&self) -> Vec<(&str, &str)> {
        self.attachments
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}

impl HeaderWriter for RpcRequest {
    fn set_header(&mut self, key: &str, value: &str) {
        self.attachments
            .insert(key.to_ascii_lowercase(), value.to_owned());
    }
}
