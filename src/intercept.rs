//! HTTP client that serves requests for the configured API from in-process
//! handlers and sends everything else to a real [`Transport`].
//!
//! Order of resolution for a request aimed at the API:
//! 1. the first registered route matching method and path,
//! 2. an approved capture in the mock response catalog,
//! 3. the real network.
//!
//! Requests for any other origin, requests carrying [`BYPASS_HEADER`], and
//! all requests while `use_mock_data` is off go straight to the network.

use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    header::{self, HeaderMap, HeaderValue},
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::Instrument as _;
use url::form_urlencoded;

use crate::{
    catalog::{
        CapturedRequest, CapturedResponse, MockResponseEntry, body_to_value, key_for_route,
        mock_key,
    },
    error::StoreError,
    handlers,
    network_log::Exchange,
    routing::{PathParams, RouteTable},
    services::MockServices,
    transport::Transport,
};

/// Request header that forces a passthrough to the real network.
pub const BYPASS_HEADER: &str = "x-mock-bypass";
/// Response header naming what produced a fabricated response.
pub const SOURCE_HEADER: &str = "x-mock-source";

pub type HandlerResult = Result<Response<Bytes>, HandlerError>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
pub type Handler = Arc<dyn Fn(HandlerContext) -> HandlerFuture + Send + Sync>;

/// Wraps an async function as a route [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

pub struct HandlerContext {
    pub services: MockServices,
    pub params: PathParams,
    pub request: Request<Bytes>,
}

impl HandlerContext {
    pub fn param(&self, name: &str) -> Result<&str, HandlerError> {
        self.params
            .get(name)
            .ok_or_else(|| HandlerError::BadRequest(format!("missing path parameter `{name}`")))
    }

    /// First value of the query parameter `name`, percent-decoded.
    pub fn query(&self, name: &str) -> Option<String> {
        query_value(self.request.uri(), name)
    }

    /// Request body as JSON, `None` when empty.
    pub fn json_body(&self) -> Result<Option<Value>, HandlerError> {
        let body = self.request.body();
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(body)
            .map(Some)
            .map_err(|err| HandlerError::BadRequest(format!("request body is not valid JSON: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    BadRequest(String),
    Store(StoreError),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(message) => f.write_str(message),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<StoreError> for HandlerError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl HandlerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Store(err) => match err {
                StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                StoreError::DuplicateId { .. } => StatusCode::CONFLICT,
                StoreError::Path(_)
                | StoreError::InvalidRecord(_)
                | StoreError::UnknownCollection(_) => StatusCode::BAD_REQUEST,
                StoreError::ConnectionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

pub fn json_response(status: StatusCode, body: &impl Serialize) -> HandlerResult {
    let bytes = serde_json::to_vec(body).map_err(StoreError::from)?;
    let mut response = Response::new(Bytes::from(bytes));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn error_response(status: StatusCode, message: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(json!({ "error": message }).to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

struct RouteEntry {
    handler: Handler,
    /// Whether exchanges on this route reach the network log.
    observed: bool,
}

impl std::fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteEntry")
            .field("observed", &self.observed)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct MockClient<T> {
    services: MockServices,
    routes: RouteTable<RouteEntry>,
    transport: T,
}

impl<T: Transport> MockClient<T> {
    /// A client with the built-in CRUD and `/_mock` admin routes.
    pub fn new(services: MockServices, transport: T) -> Self {
        let mut client = Self::without_routes(services, transport);
        handlers::register_defaults(&mut client);
        client
    }

    pub fn without_routes(services: MockServices, transport: T) -> Self {
        Self {
            services,
            routes: RouteTable::default(),
            transport,
        }
    }

    /// Registers a route whose exchanges are logged and captured.
    pub fn route(&mut self, method: Method, template: &str, handler: Handler) -> &mut Self {
        self.routes.add(
            method,
            template,
            RouteEntry {
                handler,
                observed: true,
            },
        );
        self
    }

    /// Registers a route that is never logged or captured.
    pub fn admin_route(&mut self, method: Method, template: &str, handler: Handler) -> &mut Self {
        self.routes.add(
            method,
            template,
            RouteEntry {
                handler,
                observed: false,
            },
        );
        self
    }

    pub fn services(&self) -> &MockServices {
        &self.services
    }

    pub async fn send(&self, mut request: Request<Bytes>) -> anyhow::Result<Response<Bytes>> {
        let flags = self.services.network_flags();
        let bypass = request.headers_mut().remove(BYPASS_HEADER).is_some();
        let api_path = api_relative_path(&flags.api_base_url, request.uri());

        let Some(api_path) = api_path else {
            return self.transport.send(request).await;
        };
        if bypass || !flags.use_mock_data {
            tracing::debug!(uri = %request.uri(), bypass, "passing API request to network");
            let key = mock_key(request.method().as_str(), request.uri().path(), None);
            return self.forward(request, key).await;
        }

        let span = tracing::info_span!(
            "mock_request",
            method = %request.method(),
            path = %api_path
        );
        self.intercept(request, api_path).instrument(span).await
    }

    async fn intercept(
        &self,
        request: Request<Bytes>,
        api_path: String,
    ) -> anyhow::Result<Response<Bytes>> {
        if let Some((route, params)) = self.routes.find(request.method(), &api_path) {
            let key = key_for_route(
                request.method().as_str(),
                route.pattern.template(),
                &params,
            );
            let captured = capture_request(&request);
            let entry = &route.handler;
            let mut response = self.run_handler(&entry.handler, params, request).await;
            response
                .headers_mut()
                .insert(SOURCE_HEADER, HeaderValue::from_static("route"));
            if entry.observed {
                self.observe(Exchange {
                    key,
                    request: captured,
                    response: Ok(capture_response(&response)),
                    capturable: true,
                })
                .await;
            }
            return Ok(response);
        }

        let key = mock_key(request.method().as_str(), request.uri().path(), None);
        if let Some(entry) = self.approved_capture(&key).await {
            tracing::debug!(key = %key, "replaying approved capture");
            let response = replay_response(&entry)?;
            self.observe(Exchange {
                key,
                request: capture_request(&request),
                response: Ok(capture_response(&response)),
                capturable: false,
            })
            .await;
            return Ok(response);
        }

        tracing::debug!("no mock route matched, passing to network");
        self.forward(request, key).await
    }

    async fn run_handler(
        &self,
        handler: &Handler,
        params: PathParams,
        request: Request<Bytes>,
    ) -> Response<Bytes> {
        if let Err(err) = self.services.connections().ensure_connection().await {
            tracing::warn!("store not ready for mock request: {err}");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string());
        }

        let ctx = HandlerContext {
            services: self.services.clone(),
            params,
            request,
        };
        match handler(ctx).await {
            Ok(response) => response,
            Err(err) => {
                let status = err.status();
                if status.is_server_error() {
                    tracing::warn!(%status, "mock handler failed: {err}");
                } else {
                    tracing::debug!(%status, "mock handler rejected request: {err}");
                }
                error_response(status, &err.to_string())
            }
        }
    }

    async fn approved_capture(&self, key: &str) -> Option<MockResponseEntry> {
        match self.services.catalog.approved(key).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(key, "mock response catalog lookup failed: {err}");
                None
            }
        }
    }

    async fn forward(&self, request: Request<Bytes>, key: String) -> anyhow::Result<Response<Bytes>> {
        let captured = capture_request(&request);
        match self.transport.send(request).await {
            Ok(response) => {
                self.observe(Exchange {
                    key,
                    request: captured,
                    response: Ok(capture_response(&response)),
                    capturable: true,
                })
                .await;
                Ok(response)
            }
            Err(err) => {
                self.observe(Exchange {
                    key,
                    request: captured,
                    response: Err(format!("{err:#}")),
                    capturable: false,
                })
                .await;
                Err(err)
            }
        }
    }

    /// Logging never fails the request it describes.
    async fn observe(&self, exchange: Exchange) {
        if let Err(err) = self.services.recorder.observe(&exchange).await {
            tracing::warn!(key = %exchange.key, "failed to record network exchange: {err}");
        }
    }
}

/// Path of `uri` below the API base URL, or `None` if `uri` targets
/// another origin or lies outside the base path.
pub fn api_relative_path(api_base_url: &str, uri: &Uri) -> Option<String> {
    let base: Uri = match api_base_url.parse() {
        Ok(base) => base,
        Err(err) => {
            tracing::warn!(api_base_url, "invalid api base url: {err}");
            return None;
        }
    };

    let same_scheme = base.scheme_str().is_some() && base.scheme_str() == uri.scheme_str();
    let same_authority = match (base.authority(), uri.authority()) {
        (Some(base), Some(target)) => base.as_str().eq_ignore_ascii_case(target.as_str()),
        _ => false,
    };
    if !same_scheme || !same_authority {
        return None;
    }

    let prefix = base.path().trim_end_matches('/');
    let rest = uri.path().strip_prefix(prefix)?;
    if rest.is_empty() {
        return Some("/".to_owned());
    }
    rest.starts_with('/').then(|| rest.to_owned())
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_owned(), value.to_owned()))
        })
        .collect()
}

fn capture_request(request: &Request<Bytes>) -> CapturedRequest {
    CapturedRequest {
        method: request.method().as_str().to_owned(),
        url: request.uri().to_string(),
        headers: header_map(request.headers()),
        body: body_to_value(request.body()),
    }
}

fn capture_response(response: &Response<Bytes>) -> CapturedResponse {
    CapturedResponse {
        status: response.status().as_u16(),
        headers: header_map(response.headers()),
        body: body_to_value(response.body()),
    }
}

fn replay_response(entry: &MockResponseEntry) -> anyhow::Result<Response<Bytes>> {
    let body = match &entry.response.body {
        Value::Null => Bytes::new(),
        Value::String(text) => Bytes::from(text.clone()),
        other => Bytes::from(serde_json::to_vec(other)?),
    };

    let mut builder = Response::builder().status(entry.response.status);
    for (name, value) in &entry.response.headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder.header(SOURCE_HEADER, "catalog");
    builder
        .body(body)
        .map_err(|err| anyhow::anyhow!("build replayed response for `{}`: {err}", entry.key))
}

fn query_value(uri: &Uri, name: &str) -> Option<String> {
    form_urlencoded::parse(uri.query()?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use hyper::{StatusCode, Uri};

    use super::{HandlerError, api_relative_path, query_value};
    use crate::{error::StoreError, path::PathError, schema::Collection};

    fn uri(raw: &str) -> Uri {
        raw.parse().unwrap()
    }

    #[test]
    fn only_requests_below_the_api_base_are_intercepted() {
        let base = "http://localhost:3000/api";

        assert_eq!(
            api_relative_path(base, &uri("http://localhost:3000/api/users/1?x=1")).as_deref(),
            Some("/users/1")
        );
        assert_eq!(
            api_relative_path(base, &uri("http://LOCALHOST:3000/api")).as_deref(),
            Some("/")
        );
        assert_eq!(api_relative_path(base, &uri("http://localhost:3000/apix/users")), None);
        assert_eq!(api_relative_path(base, &uri("http://localhost:4000/api/users")), None);
        assert_eq!(api_relative_path(base, &uri("https://localhost:3000/api/users")), None);
        assert_eq!(api_relative_path(base, &uri("/api/users")), None);
    }

    #[test]
    fn query_values_are_percent_decoded() {
        let backup = uri("http://localhost:3000/api/_mock/backup?scope=a%6Cl&note=two+words&flag");

        assert_eq!(query_value(&backup, "scope").as_deref(), Some("all"));
        assert_eq!(query_value(&backup, "note").as_deref(), Some("two words"));
        assert_eq!(query_value(&backup, "flag").as_deref(), Some(""));
        assert_eq!(query_value(&backup, "missing"), None);
        assert_eq!(query_value(&uri("http://localhost:3000/api/users"), "scope"), None);
    }

    #[test]
    fn handler_errors_map_to_http_statuses() {
        let not_found = HandlerError::Store(StoreError::NotFound {
            collection: Collection::Users,
            id: "1".to_owned(),
        });
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let duplicate = HandlerError::Store(StoreError::DuplicateId {
            collection: Collection::Users,
            id: "1".to_owned(),
        });
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        assert_eq!(
            HandlerError::Store(StoreError::Path(PathError::NoField)).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            HandlerError::Store(StoreError::ConnectionUnavailable("x".to_owned())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            HandlerError::Store(StoreError::Storage("disk".to_owned())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
