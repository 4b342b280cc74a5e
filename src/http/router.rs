//! Pattern-matched route dispatch, spec §4.5.
//!
//! Routes are tried in registration order; the first whose method/path/host
//! patterns match and whose required query/header subsets are satisfied
//! wins. `Response::None` means "keep looking"; if every route declines,
//! the caller replies 404.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;

use super::request::{Request, Response};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Response> + Send>>;
pub type HandlerFn = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

pub struct Route {
    pub label: &'static str,
    method: Regex,
    path: Regex,
    host: Option<Regex>,
    required_query: HashMap<String, Regex>,
    required_headers: HashMap<String, Regex>,
    handler: HandlerFn,
}

pub struct RouteBuilder {
    label: &'static str,
    method: String,
    path: String,
    host: Option<String>,
    required_query: HashMap<String, String>,
    required_headers: HashMap<String, String>,
}

impl RouteBuilder {
    pub fn new(label: &'static str, method: &str, path: &str) -> Self {
        Self {
            label,
            method: method.to_string(),
            path: path.to_string(),
            host: None,
            required_query: HashMap::new(),
            required_headers: HashMap::new(),
        }
    }

    pub fn host(mut self, pattern: &str) -> Self {
        self.host = Some(pattern.to_string());
        self
    }

    pub fn query(mut self, key: &str, value_pattern: &str) -> Self {
        self.required_query
            .insert(key.to_ascii_lowercase(), value_pattern.to_string());
        self
    }

    pub fn header(mut self, key: &str, value_pattern: &str) -> Self {
        self.required_headers
            .insert(key.to_ascii_lowercase(), value_pattern.to_string());
        self
    }

    pub fn build<F, Fut>(self, handler: F) -> anyhow::Result<Route>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let required_query = self
            .required_query
            .into_iter()
            .map(|(k, v)| anyhow::Ok((k, Regex::new(&v)?)))
            .collect::<anyhow::Result<_>>()?;
        let required_headers = self
            .required_headers
            .into_iter()
            .map(|(k, v)| anyhow::Ok((k, Regex::new(&v)?)))
            .collect::<anyhow::Result<_>>()?;

        Ok(Route {
            label: self.label,
            method: Regex::new(&format!("^(?i:{})$", self.method))?,
            path: Regex::new(&self.path)?,
            host: self.host.map(|h| Regex::new(&h)).transpose()?,
            required_query,
            required_headers,
            handler: Arc::new(move |req| Box::pin(handler(req))),
        })
    }
}

impl Route {
    fn matches(&self, req: &Request) -> bool {
        if !self.method.is_match(&req.method) {
            return false;
        }
        if !self.path.is_match(&req.path) {
            return false;
        }
        if let Some(host_re) = &self.host {
            match &req.host {
                Some(host) if host_re.is_match(host) => {}
                _ => return false,
            }
        }
        for (key, pattern) in &self.required_query {
            match req.query.get(key) {
                Some(value) if pattern.is_match(value) => {}
                _ => return false,
            }
        }
        for (key, pattern) in &self.required_headers {
            match req.headers.get(key) {
                Some(value) if pattern.is_match(value) => {}
                _ => return false,
            }
        }
        true
    }
}

/// An ordered registry of routes, mutated only from the Orchestrator thread
/// during configuration (spec §5) and otherwise read-only.
#[derive(Default, Clone)]
pub struct Router {
    routes: Arc<parking_lot::RwLock<Vec<Route>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, route: Route) {
        self.routes.write().push(route);
    }

    pub fn clear(&self) {
        self.routes.write().clear();
    }

    /// Dispatches `req` against every route in registration order. Returns
    /// the first non-`None` result, or `Response::Status(404)` if every
    /// route declines.
    pub async fn dispatch(&self, req: Request) -> Response {
        let candidates: Vec<HandlerFn> = {
            let routes = self.routes.read();
            routes
                .iter()
                .filter(|route| route.matches(&req))
                .map(|route| Arc::clone(&route.handler))
                .collect()
        };

        for handler in candidates {
            match handler(req.clone()).await {
                Response::None => continue,
                other => return other,
            }
        }
        Response::Status(404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_registration_order_match_wins() {
        let router = Router::new();
        router.register(
            RouteBuilder::new("active", "POST", "^/d.json$")
                .query("a", "^tuya.device.active$")
                .build(|_req| async { Response::Text("active".into()) })
                .unwrap(),
        );
        router.register(
            RouteBuilder::new("default", "POST", "^/d.json$")
                .build(|_req| async { Response::Text("default".into()) })
                .unwrap(),
        );

        let active_req = Request::builder("POST", "/d.json")
            .query("a", "tuya.device.active")
            .build();
        let timer_req = Request::builder("POST", "/d.json")
            .query("a", "tuya.device.timer.count")
            .build();

        match router.dispatch(active_req).await {
            Response::Text(t) => assert_eq!(t, "active"),
            other => panic!("unexpected {other:?}"),
        }
        match router.dispatch(timer_req).await {
            Response::Text(t) => assert_eq!(t, "default"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_match_is_404() {
        let router = Router::new();
        router.register(
            RouteBuilder::new("never", "GET", "^/nope$")
                .build(|_req| async { Response::Status(200) })
                .unwrap(),
        );
        let req = Request::builder("GET", "/elsewhere").build();
        assert!(matches!(router.dispatch(req).await, Response::Status(404)));
    }
}
