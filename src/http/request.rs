//! §3 `Request`/`Response` data model and the coercion rules in §4.5.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde_json::Value;

/// A normalized inbound HTTP request. Headers and query keys are folded to
/// lowercase on construction; `method` is upper-cased; `path` always starts
/// with `/`.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Option<Body>,
    pub peer_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub enum Body {
    Json(Value),
    Form(HashMap<String, String>),
    Text(String),
    Bytes(Vec<u8>),
}

impl Request {
    pub fn builder(method: &str, path: &str) -> RequestBuilder {
        RequestBuilder {
            method: method.to_ascii_uppercase(),
            path: normalize_path(path),
            host: None,
            query: HashMap::new(),
            headers: HashMap::new(),
            body: None,
            peer_addr: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

pub struct RequestBuilder {
    method: String,
    path: String,
    host: Option<String>,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Option<Body>,
    peer_addr: Option<SocketAddr>,
}

impl RequestBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        // first-occurrence wins, per spec §3
        self.query
            .entry(key.to_ascii_lowercase())
            .or_insert_with(|| value.into());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn build(self) -> Request {
        Request {
            method: self.method,
            path: self.path,
            host: self.host,
            query: self.query,
            headers: self.headers,
            body: self.body,
            peer_addr: self.peer_addr,
        }
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// A handler's result. `None` means "no match, continue dispatch" (§3/§4.5).
#[derive(Debug, Clone)]
pub enum Response {
    Status(u16),
    Text(String),
    Bytes(Vec<u8>),
    File(PathBuf),
    Json(Value),
    None,
}

impl Response {
    pub fn json(value: impl serde::Serialize) -> Self {
        Self::Json(serde_json::to_value(value).unwrap_or(Value::Null))
    }
}

impl From<u16> for Response {
    fn from(status: u16) -> Self {
        Response::Status(status)
    }
}

impl From<String> for Response {
    fn from(text: String) -> Self {
        Response::Text(text)
    }
}

impl From<Vec<u8>> for Response {
    fn from(bytes: Vec<u8>) -> Self {
        Response::Bytes(bytes)
    }
}

impl From<Value> for Response {
    fn from(value: Value) -> Self {
        Response::Json(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_keeps_first_occurrence() {
        let req = Request::builder("get", "/x")
            .query("a", "first")
            .query("a", "second")
            .build();
        assert_eq!(req.query.get("a").map(String::as_str), Some("first"));
    }

    #[test]
    fn path_without_leading_slash_is_normalized() {
        let req = Request::builder("GET", "d.json").build();
        assert_eq!(req.path, "/d.json");
    }

    #[test]
    fn method_is_upper_cased() {
        let req = Request::builder("post", "/d.json").build();
        assert_eq!(req.method, "POST");
    }
}
