//! HTTP server: spec §4.5. Two listeners share one `Router` and one
//! `TlsConfig`: plaintext on `:80`, TLS (SNI certs + PSK) on `:443`.

pub mod request;
pub mod router;
pub mod tls;

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request as HyperRequest, Response as HyperResponse};
use hyper_util::rt::TokioIo;
use openssl::ssl::SslAcceptor;
use tokio::net::TcpListener;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::event_bus::EventBus;
use request::{Body, Request, Response};
use router::Router;
use tls::TlsConfig;

pub struct HttpServer {
    pub router: Router,
    plain_addr: SocketAddr,
    tls_addr: SocketAddr,
    tls_config: Arc<TlsConfig>,
    events: EventBus,
}

impl HttpServer {
    pub fn new(
        plain_addr: SocketAddr,
        tls_addr: SocketAddr,
        tls_config: TlsConfig,
        events: EventBus,
    ) -> Self {
        Self {
            router: Router::new(),
            plain_addr,
            tls_addr,
            tls_config: Arc::new(tls_config),
            events,
        }
    }

    /// Starts both listeners; returns once both have bound, spawning their
    /// accept loops onto the runtime. Each accept loop stops when
    /// `cancel.cancelled()` resolves (spec §5 cancellation contract).
    pub async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let plain_listener = TcpListener::bind(self.plain_addr).await?;
        info!(addr = %self.plain_addr, "HTTP listener bound");
        let router = self.router.clone();
        let plain_cancel = cancel.clone();
        tokio::spawn(async move {
            run_plain_accept_loop(plain_listener, router, plain_cancel).await;
        });

        let acceptor = Arc::clone(&self.tls_config).build_acceptor()?;
        let tls_listener = TcpListener::bind(self.tls_addr).await?;
        info!(addr = %self.tls_addr, "HTTPS listener bound");
        let router = self.router.clone();
        let tls_cancel = cancel;
        tokio::spawn(async move {
            run_tls_accept_loop(tls_listener, acceptor, router, tls_cancel).await;
        });

        Ok(())
    }
}

async fn run_plain_accept_loop(listener: TcpListener, router: Router, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("HTTP listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                let router = router.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let router = router.clone();
                        async move { Ok::<_, Infallible>(handle(router, req, Some(peer)).await) }
                    });
                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        warn!(error = %err, "HTTP connection error");
                    }
                });
            }
        }
    }
}

async fn run_tls_accept_loop(
    listener: TcpListener,
    acceptor: SslAcceptor,
    router: Router,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("HTTPS listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                let acceptor = acceptor.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    let ssl = match openssl::ssl::Ssl::new(acceptor.context()) {
                        Ok(ssl) => ssl,
                        Err(err) => {
                            error!(error = %err, "failed to create TLS session");
                            return;
                        }
                    };
                    let mut tls_stream = match SslStream::new(ssl, stream) {
                        Ok(s) => s,
                        Err(err) => {
                            error!(error = %err, "failed to wrap TLS stream");
                            return;
                        }
                    };
                    if let Err(err) = std::pin::Pin::new(&mut tls_stream).accept().await {
                        warn!(error = %err, "TLS handshake failed");
                        return;
                    }
                    let io = TokioIo::new(tls_stream);
                    let service = service_fn(move |req| {
                        let router = router.clone();
                        async move { Ok::<_, Infallible>(handle(router, req, Some(peer)).await) }
                    });
                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        warn!(error = %err, "HTTPS connection error");
                    }
                });
            }
        }
    }
}

#[instrument(skip(router, hyper_req))]
async fn handle(
    router: Router,
    hyper_req: HyperRequest<Incoming>,
    peer: Option<SocketAddr>,
) -> HyperResponse<Full<Bytes>> {
    let start = std::time::Instant::now();
    let path = hyper_req.uri().path().to_string();
    let req = match to_internal_request(hyper_req, peer).await {
        Ok(req) => req,
        Err(err) => {
            warn!(error = %err, "failed to decode request body");
            let resp = text_response(400, "bad request");
            crate::metrics::record_http_request(&path, resp.status().as_u16(), start.elapsed());
            return resp;
        }
    };
    let response = router.dispatch(req).await;
    let resp = coerce(response).await;
    crate::metrics::record_http_request(&path, resp.status().as_u16(), start.elapsed());
    resp
}

async fn to_internal_request(
    hyper_req: HyperRequest<Incoming>,
    peer: Option<SocketAddr>,
) -> anyhow::Result<Request> {
    let (parts, body) = hyper_req.into_parts();

    let mut query = HashMap::new();
    if let Some(q) = parts.uri.query() {
        for pair in q.split('&').filter(|s| !s.is_empty()) {
            let mut split = pair.splitn(2, '=');
            let key = split.next().unwrap_or_default();
            let value = split.next().unwrap_or_default();
            let key = urlencoding_decode(key).to_ascii_lowercase();
            let value = urlencoding_decode(value);
            query.entry(key).or_insert(value);
        }
    }

    let mut headers = HashMap::new();
    for (name, value) in &parts.headers {
        headers.insert(
            name.as_str().to_ascii_lowercase(),
            value.to_str().unwrap_or_default().to_string(),
        );
    }

    let host = parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(':').next().unwrap_or(s).to_string());

    let body_bytes = body.collect().await?.to_bytes();
    let body = decode_body(&headers, &body_bytes);

    let mut builder = Request::builder(parts.method.as_str(), parts.uri.path());
    if let Some(host) = host {
        builder = builder.host(host);
    }
    for (k, v) in query {
        builder = builder.query(&k, v);
    }
    for (k, v) in headers {
        builder = builder.header(&k, v);
    }
    if let Some(addr) = peer {
        builder = builder.peer_addr(addr);
    }
    if let Some(body) = body {
        builder = builder.body(body);
    }
    Ok(builder.build())
}

/// Body decoding on request, per `Content-Type` (spec §4.5).
fn decode_body(headers: &HashMap<String, String>, bytes: &Bytes) -> Option<Body> {
    if bytes.is_empty() {
        return None;
    }
    let content_type = headers.get("content-type").map(String::as_str).unwrap_or("");
    if content_type.starts_with("application/json") {
        return serde_json::from_slice(bytes)
            .ok()
            .map(Body::Json)
            .or_else(|| Some(Body::Bytes(bytes.to_vec())));
    }
    if content_type.starts_with("application/x-www-form-urlencoded") {
        let text = String::from_utf8_lossy(bytes);
        let mut map = HashMap::new();
        for pair in text.split('&').filter(|s| !s.is_empty()) {
            let mut split = pair.splitn(2, '=');
            let key = urlencoding_decode(split.next().unwrap_or_default()).to_ascii_lowercase();
            let value = urlencoding_decode(split.next().unwrap_or_default());
            map.insert(key, value);
        }
        return Some(Body::Form(map));
    }
    if content_type.starts_with("text/plain") {
        return Some(Body::Text(String::from_utf8_lossy(bytes).into_owned()));
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Some(Body::Text(text.to_string())),
        Err(_) => Some(Body::Bytes(bytes.to_vec())),
    }
}

fn urlencoding_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut bytes = s.bytes().peekable();
    while let Some(b) = bytes.next() {
        match b {
            b'+' => out.push(' '),
            b'%' => {
                let hi = bytes.next();
                let lo = bytes.next();
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    if let Ok(byte) =
                        u8::from_str_radix(&format!("{}{}", hi as char, lo as char), 16)
                    {
                        out.push(byte as char);
                        continue;
                    }
                }
                out.push('%');
            }
            other => out.push(other as char),
        }
    }
    out
}

/// Response coercion (§4.5): every branch of `Response` maps to a valid
/// HTTP response; this function is total. File reads happen here, at
/// response-construction time, and are treated as bounded per spec §5.
async fn coerce(response: Response) -> HyperResponse<Full<Bytes>> {
    match response {
        Response::Status(code) => empty_response(code),
        Response::Text(text) => content_response(200, "text/plain", text.into_bytes()),
        Response::Bytes(bytes) => content_response(200, "application/octet-stream", bytes),
        Response::File(path) => match tokio::fs::read(&path).await {
            Ok(bytes) => content_response(200, "application/octet-stream", bytes),
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to read file response");
                text_response(500, "failed to read file")
            }
        },
        Response::Json(value) => match serde_json::to_vec(&value) {
            Ok(bytes) => content_response(200, "application/json", bytes),
            Err(_) => text_response(500, "failed to serialize response"),
        },
        Response::None => empty_response(404),
    }
}

fn empty_response(status: u16) -> HyperResponse<Full<Bytes>> {
    HyperResponse::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| HyperResponse::new(Full::new(Bytes::new())))
}

fn content_response(status: u16, content_type: &str, bytes: Vec<u8>) -> HyperResponse<Full<Bytes>> {
    HyperResponse::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .body(Full::new(Bytes::from(bytes)))
        .unwrap_or_else(|_| HyperResponse::new(Full::new(Bytes::new())))
}

fn text_response(status: u16, text: &str) -> HyperResponse<Full<Bytes>> {
    content_response(status, "text/plain", text.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coercion_is_total() {
        assert_eq!(coerce(Response::Status(204)).await.status(), 204);
        assert_eq!(coerce(Response::Text("x".into())).await.status(), 200);
        assert_eq!(coerce(Response::Bytes(vec![1, 2])).await.status(), 200);
        assert_eq!(
            coerce(Response::Json(serde_json::json!({"a":1}))).await.status(),
            200
        );
        assert_eq!(coerce(Response::None).await.status(), 404);
        assert_eq!(
            coerce(Response::File("/nonexistent/path".into())).await.status(),
            500
        );
    }
}
