//! Request handling: client API plus interaction capture.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_TYPE, HOST,
};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use ricochet_common::{AuthToken, CorrelationId, InteractionRecord, Protocol, ProtocolDetails};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::AuthGate;
use crate::capture::CaptureSink;
use crate::metrics::ServerMetrics;
use crate::store::{Store, StoreError};
use crate::zone::ZoneMatcher;

/// Largest request body read
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Request body for `/register` and `/deregister`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RegistrationRequest {
    correlation_id: String,
    #[serde(default)]
    secret_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct PollResponse {
    data: Vec<InteractionRecord>,
    extra: Vec<InteractionRecord>,
    #[serde(rename = "tld-data")]
    tld_data: Vec<InteractionRecord>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// Shared by every HTTP and HTTPS connection
pub struct HttpHandler {
    sink: CaptureSink,
    zone: ZoneMatcher,
    gate: AuthGate,
    origin: Option<HeaderValue>,
    metrics: Option<ServerMetrics>,
}

impl HttpHandler {
    pub fn new(sink: CaptureSink, zone: ZoneMatcher, gate: AuthGate, origin_url: &str) -> Self {
        let origin = HeaderValue::from_str(origin_url).ok();
        if origin.is_none() {
            warn!(origin_url = %origin_url, "Origin URL is not a valid header value, omitting CORS header");
        }
        Self {
            sink,
            zone,
            gate,
            origin,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ServerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn store(&self) -> &Arc<Store> {
        self.sink.store()
    }

    pub async fn handle<B>(&self, request: Request<B>, peer: SocketAddr) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = request.into_parts();
        let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(peer = %peer, error = %e, "Failed to read request body");
                Bytes::new()
            }
        };
        let request = Request::from_parts(parts, body);

        let host = request
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| request.uri().host())
            .map(str::to_string);

        let host_has_id = host
            .as_deref()
            .and_then(|h| self.zone.http_id(Some(h), "/"))
            .is_some_and(|id| id != self.zone.domain_id());

        if !host_has_id {
            if let Some(response) = self.api(&request).await {
                return response;
            }
        }

        self.capture(&request, host.as_deref(), peer)
    }

    /// Client API; `None` if the request is not an API call
    async fn api(&self, request: &Request<Bytes>) -> Option<Response<Full<Bytes>>> {
        let path = request.uri().path();
        let method = request.method();

        let response = match (method, path) {
            (&Method::OPTIONS, "/register" | "/deregister" | "/poll" | "/metrics") => {
                self.with_cors(empty(StatusCode::NO_CONTENT))
            }
            (&Method::POST, "/register") => self.register(request),
            (&Method::POST, "/deregister") => self.deregister(request),
            (&Method::GET, "/poll") => self.poll(request),
            (&Method::GET, "/metrics") => self.metrics(request),
            _ => return None,
        };
        Some(response)
    }

    fn register(&self, request: &Request<Bytes>) -> Response<Full<Bytes>> {
        if self.gate.verify(header_token(request)).is_err() {
            return self.error(StatusCode::UNAUTHORIZED, "unauthorized");
        }
        let body: RegistrationRequest = match serde_json::from_slice(request.body()) {
            Ok(body) => body,
            Err(_) => return self.error(StatusCode::BAD_REQUEST, "invalid registration body"),
        };
        let Ok(id) = CorrelationId::parse(&body.correlation_id) else {
            return self.error(StatusCode::BAD_REQUEST, "invalid correlation id");
        };

        let secret = body.secret_key.and_then(AuthToken::new);
        match self.store().register_id(&id, secret) {
            Ok(()) => {
                debug!(correlation_id = %id, "Client registered");
                self.json(StatusCode::OK, &Message { message: "registration successful" })
            }
            Err(StoreError::AlreadyRegistered(_)) => {
                self.error(StatusCode::CONFLICT, "correlation id already registered")
            }
            Err(e) => self.error(StatusCode::BAD_REQUEST, &e.to_string()),
        }
    }

    fn deregister(&self, request: &Request<Bytes>) -> Response<Full<Bytes>> {
        let body: RegistrationRequest = match serde_json::from_slice(request.body()) {
            Ok(body) => body,
            Err(_) => return self.error(StatusCode::BAD_REQUEST, "invalid deregistration body"),
        };
        let Ok(id) = CorrelationId::parse(&body.correlation_id) else {
            return self.error(StatusCode::BAD_REQUEST, "invalid correlation id");
        };

        let token = header_token(request).or(body.secret_key.as_deref());
        match self.store().remove(&id, token) {
            Ok(_) => {
                debug!(correlation_id = %id, "Client deregistered");
                self.json(StatusCode::OK, &Message { message: "deregistration successful" })
            }
            Err(StoreError::Unauthorized) => self.error(StatusCode::UNAUTHORIZED, "unauthorized"),
            Err(e) => self.error(StatusCode::BAD_REQUEST, &e.to_string()),
        }
    }

    fn poll(&self, request: &Request<Bytes>) -> Response<Full<Bytes>> {
        let params = query_params(request);
        let Some(Ok(id)) = param(&params, "id").map(CorrelationId::parse) else {
            return self.error(StatusCode::BAD_REQUEST, "invalid correlation id");
        };
        let token = header_token(request).or(param(&params, "secret"));

        let data = match self.store().get(&id, token) {
            Ok(records) => records,
            Err(StoreError::Unauthorized) => {
                return self.error(StatusCode::UNAUTHORIZED, "unauthorized")
            }
            Err(e) => return self.error(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        let extra = self
            .gate
            .token_bucket()
            .and_then(|bucket| self.store().get(&bucket, token).ok())
            .unwrap_or_default();
        let tld_data = if self.zone.root_tld() {
            self.store()
                .get(&self.zone.domain_id(), token)
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        debug!(
            correlation_id = %id,
            data = data.len(),
            extra = extra.len(),
            tld_data = tld_data.len(),
            "Poll served"
        );
        self.json(StatusCode::OK, &PollResponse { data, extra, tld_data })
    }

    fn metrics(&self, request: &Request<Bytes>) -> Response<Full<Bytes>> {
        let params = query_params(request);
        let token = header_token(request).or(param(&params, "secret"));
        if self.gate.verify(token).is_err() {
            return self.error(StatusCode::UNAUTHORIZED, "unauthorized");
        }
        let Some(metrics) = &self.metrics else {
            return self.error(StatusCode::NOT_FOUND, "metrics disabled");
        };
        metrics.observe_store(self.store().stats());
        match metrics.render() {
            Ok(text) => {
                let mut response = text_response(StatusCode::OK, text);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => self.error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        }
    }

    /// Record the request if it names a correlation id and answer 200
    fn capture(
        &self,
        request: &Request<Bytes>,
        host: Option<&str>,
        peer: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let id = self.zone.http_id(host, request.uri().path());
        let reflection = id
            .as_ref()
            .map(|id| id.as_str().chars().rev().collect::<String>())
            .unwrap_or_default();

        let mut response = if request.uri().path() == "/robots.txt" {
            text_response(
                StatusCode::OK,
                format!("User-agent: *\nDisallow: / # {}", reflection),
            )
        } else {
            let mut response = text_response(
                StatusCode::OK,
                format!("<html><head></head><body>{}</body></html>", reflection),
            );
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
            response
        };
        response
            .headers_mut()
            .insert("server", HeaderValue::from_static("ricochet"));

        match id {
            Some(id) => {
                let record = InteractionRecord::new(Protocol::Http, id.clone(), peer)
                    .with_full_id(host.unwrap_or(id.as_str()).to_string())
                    .with_raw_request(describe_request(request))
                    .with_raw_response(describe_response(&response))
                    .with_details(ProtocolDetails::Http {
                        method: request.method().to_string(),
                        path: request.uri().path().to_string(),
                    });
                self.sink.capture(Some(id), record);
            }
            None => self.sink.dropped(Protocol::Http),
        }
        response
    }

    fn json<T: Serialize>(&self, status: StatusCode, value: &T) -> Response<Full<Bytes>> {
        let body = match serde_json::to_vec(value) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to serialize response");
                return self.with_cors(empty(StatusCode::INTERNAL_SERVER_ERROR));
            }
        };
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.with_cors(response)
    }

    fn error(&self, status: StatusCode, message: &str) -> Response<Full<Bytes>> {
        self.json(status, &ErrorBody { error: message })
    }

    fn with_cors(&self, mut response: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
        let headers = response.headers_mut();
        if let Some(origin) = &self.origin {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        }
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Authorization, Content-Type"),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        response
    }
}

impl std::fmt::Debug for HttpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHandler")
            .field("zone", &self.zone.domain())
            .field("auth_required", &self.gate.required())
            .finish()
    }
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

/// `Authorization` header, with an optional `Bearer ` prefix removed
fn header_token<B>(request: &Request<B>) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
        .filter(|v| !v.is_empty())
}

fn query_params<B>(request: &Request<B>) -> Vec<(String, String)> {
    request
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}

/// HTTP/1.1 text form of a request
fn describe_request(request: &Request<Bytes>) -> String {
    let mut out = format!(
        "{} {} {:?}\r\n",
        request.method(),
        request
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str()),
        request.version()
    );
    for (name, value) in request.headers() {
        let _ = write!(out, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
    }
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(request.body()));
    out
}

fn describe_response(response: &Response<Full<Bytes>>) -> String {
    let mut out = format!("HTTP/1.1 {}\r\n", response.status());
    for (name, value) in response.headers() {
        let _ = write!(out, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
    }
    out.push_str("\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ricochet_config::ServerConfig;
    use ricochet_config::SecurityPolicy;
    use std::time::Duration;

    const ORIGIN: &str = "https://interact.example.org";

    fn peer() -> SocketAddr {
        "198.51.100.20:40000".parse().unwrap()
    }

    fn handler(gate: AuthGate, root_tld: bool) -> HttpHandler {
        let store = Arc::new(
            Store::builder(Duration::from_secs(60))
                .global_token(gate.token().cloned())
                .build(),
        );
        gate.install(&store).unwrap();
        let zone = ZoneMatcher::new("example.com", root_tld);
        if root_tld {
            store.register_persistent(&zone.domain_id(), None).unwrap();
        }
        let metrics = ServerMetrics::new().unwrap();
        let sink = CaptureSink::new(store)
            .with_fallback(gate.token_bucket())
            .with_metrics(metrics.clone());
        HttpHandler::new(sink, zone, gate, ORIGIN).with_metrics(metrics)
    }

    fn request(method: Method, host: &str, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, host)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_register_capture_poll() {
        let handler = handler(AuthGate::open(), false);

        let response = handler
            .handle(
                request(
                    Method::POST,
                    "example.com",
                    "/register",
                    r#"{"correlation-id":"abc123"}"#,
                ),
                peer(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            ORIGIN
        );

        let captured = handler
            .handle(request(Method::GET, "example.com", "/abc123", ""), peer())
            .await;
        assert_eq!(captured.status(), StatusCode::OK);
        assert!(body_text(captured).await.contains("321cba"));

        let poll = handler
            .handle(request(Method::GET, "example.com", "/poll?id=abc123", ""), peer())
            .await;
        assert_eq!(poll.status(), StatusCode::OK);
        let json = body_json(poll).await;
        let data = json["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["protocol"], "http");
        assert_eq!(data[0]["details"]["method"], "GET");
        assert_eq!(data[0]["details"]["path"], "/abc123");
    }

    #[tokio::test]
    async fn test_subdomain_api_path_is_captured() {
        let handler = handler(AuthGate::open(), false);

        let response = handler
            .handle(request(Method::GET, "abc.example.com", "/poll?id=x", ""), peer())
            .await;
        assert!(body_text(response).await.contains("cba"));

        let id = CorrelationId::parse("abc").unwrap();
        assert_eq!(handler.store().get(&id, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_requires_token_when_auth_enabled() {
        let mut config = ServerConfig::for_domain("example.com");
        config.token = Some("sekrit".to_string());
        let gate = AuthGate::from_policy(&SecurityPolicy::from_config(&config)).unwrap();
        let handler = handler(gate, false);

        let denied = handler
            .handle(request(Method::GET, "example.com", "/poll?id=nope", ""), peer())
            .await;
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let mut allowed = request(Method::GET, "example.com", "/poll?id=nope", "");
        allowed
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("sekrit"));
        let allowed = handler.handle(allowed, peer()).await;
        assert_eq!(allowed.status(), StatusCode::OK);

        let via_query = handler
            .handle(
                request(Method::GET, "example.com", "/poll?id=nope&secret=sekrit", ""),
                peer(),
            )
            .await;
        assert_eq!(via_query.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_per_id_secret() {
        let handler = handler(AuthGate::open(), false);
        handler
            .handle(
                request(
                    Method::POST,
                    "example.com",
                    "/register",
                    r#"{"correlation-id":"mine","secret-key":"s1"}"#,
                ),
                peer(),
            )
            .await;

        let denied = handler
            .handle(request(Method::GET, "example.com", "/poll?id=mine", ""), peer())
            .await;
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = handler
            .handle(
                request(Method::GET, "example.com", "/poll?id=mine&secret=s1", ""),
                peer(),
            )
            .await;
        assert_eq!(allowed.status(), StatusCode::OK);

        let conflict = handler
            .handle(
                request(
                    Method::POST,
                    "example.com",
                    "/register",
                    r#"{"correlation-id":"mine","secret-key":"s2"}"#,
                ),
                peer(),
            )
            .await;
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_deregister() {
        let handler = handler(AuthGate::open(), false);
        handler
            .handle(request(Method::GET, "abc.example.com", "/", ""), peer())
            .await;

        let response = handler
            .handle(
                request(
                    Method::POST,
                    "example.com",
                    "/deregister",
                    r#"{"correlation-id":"abc"}"#,
                ),
                peer(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!handler
            .store()
            .contains(&CorrelationId::parse("abc").unwrap()));
    }

    #[tokio::test]
    async fn test_root_tld_data_in_poll() {
        let mut config = ServerConfig::for_domain("example.com");
        config.root_tld = true;
        let gate = AuthGate::from_policy(&SecurityPolicy::from_config(&config)).unwrap();
        let token = gate.token().unwrap().expose().to_string();
        let handler = handler(gate, true);

        handler
            .handle(request(Method::GET, "example.com", "/", ""), peer())
            .await;

        let poll = handler
            .handle(
                request(
                    Method::GET,
                    "example.com",
                    &format!("/poll?id=other&secret={}", token),
                    "",
                ),
                peer(),
            )
            .await;
        let json = body_json(poll).await;
        assert!(json["data"].as_array().unwrap().is_empty());
        assert_eq!(json["tld-data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_id_not_captured() {
        let handler = handler(AuthGate::open(), false);
        let response = handler
            .handle(request(Method::GET, "example.com", "/", ""), peer())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(handler.store().stats().buckets, 0);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let handler = handler(AuthGate::open(), false);
        handler
            .handle(request(Method::GET, "abc.example.com", "/", ""), peer())
            .await;

        let response = handler
            .handle(request(Method::GET, "example.com", "/metrics", ""), peer())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response)
            .await
            .contains("ricochet_interactions_captured_total"));
    }
}
