use crate::cache::{CacheStore, CacheWriter};
use crate::error::ProxyError;
use crate::forward::{ForwardRules, with_default_scheme};
use crate::inflight::{Completed, Flight, FlightGuard, InFlight};
use crate::tee::{self, ProxyBody, StreamingFileBody, Tee};
use crate::validate::{RemoteUrl, validate_request_path};
use http_body_util::BodyExt;
use http::header::{CONTENT_LENGTH, HeaderMap, HeaderName};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// Connection-level headers owned by our own server connection.
static HOP_BY_HOP: [HeaderName; 8] = [
    HeaderName::from_static("connection"),
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-authenticate"),
    HeaderName::from_static("proxy-authorization"),
    HeaderName::from_static("te"),
    HeaderName::from_static("trailers"),
    HeaderName::from_static("transfer-encoding"),
    HeaderName::from_static("upgrade"),
];

pub type OriginClient = Client<HttpsConnector<HttpConnector>, http_body_util::Empty<bytes::Bytes>>;

#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub connect_timeout: Option<Duration>,
    pub pool_max_idle_per_host: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            pool_max_idle_per_host: 10,
        }
    }
}

/// Per-request orchestration: validate, resolve forward, serve from cache or
/// fetch and tee into the cache.
///
/// Shared across all connections; holds only read-only state plus the
/// in-flight registry.
pub struct ProxyHandler {
    client: OriginClient,
    cache: CacheStore,
    forwards: Arc<ForwardRules>,
    flights: InFlight,
}

impl ProxyHandler {
    pub fn new(cache: CacheStore, forwards: Arc<ForwardRules>) -> Self {
        Self::with_options(cache, forwards, HandlerOptions::default())
    }

    pub fn with_options(cache: CacheStore, forwards: Arc<ForwardRules>, options: HandlerOptions) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(options.connect_timeout);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .build(HttpsConnector::new_with_connector(http));

        Self {
            client,
            cache,
            forwards,
            flights: InFlight::new(),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody> {
        let path = req.uri().path().to_string();
        drop(req);

        match self.process(&path).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    ProxyError::InvalidUri(_) => warn!("uri err: {}", e),
                    _ => error!("{}", e),
                }
                error_response(&e)
            }
        }
    }

    async fn process(&self, path: &str) -> Result<Response<ProxyBody>, ProxyError> {
        let remote = validate_request_path(path)?;
        info!("req: {}", remote.raw);

        let key = self.cache.key_for(&remote.raw);

        loop {
            match self.flights.join(&key) {
                Flight::Leader(guard) => return self.fetch(&remote, guard).await,
                Flight::Follower(follower) => {
                    let Some(completed) = follower.wait().await else {
                        debug!("In-flight fetch for {} gave up, retrying", remote.raw);
                        continue;
                    };
                    match self.serve_cached(&key, completed.status, &completed.headers).await {
                        Ok(response) => {
                            debug!("Served {} from cache after shared fetch", remote.raw);
                            return Ok(response);
                        }
                        Err(e) => {
                            warn!("Shared cache entry unreadable, fetching: {}", e);
                            continue;
                        }
                    }
                }
            }
        }
    }

    async fn fetch(&self, remote: &RemoteUrl, guard: FlightGuard) -> Result<Response<ProxyBody>, ProxyError> {
        let key = guard.key().to_path_buf();
        let cached = self.cache.stat(&key).await;

        let target = self.forwards.resolve(remote);
        let uri: Uri = with_default_scheme(&target)
            .parse()
            .map_err(|e| ProxyError::OriginUnavailable(format!("{}: {}", target, e)))?;
        if !matches!(uri.scheme_str(), Some("http") | Some("https")) {
            return Err(ProxyError::OriginUnavailable(format!("unsupported protocol scheme: {}", target)));
        }

        let response = self
            .client
            .get(uri)
            .await
            .map_err(|e| ProxyError::OriginUnavailable(format!("get {}: {}", target, e)))?;

        let (parts, body) = response.into_parts();
        let headers = copy_headers(&parts.headers);
        let declared_length = declared_length(&parts.headers);

        if !parts.status.is_success() {
            debug!("Origin answered {} for {}, not caching", parts.status, remote.raw);
            return Ok(self.stream(parts.status, headers, body, None, guard));
        }

        if cached.is_fresh(declared_length) {
            drop(body);
            debug!("Cache hit for {} ({} bytes)", remote.raw, declared_length);
            let response = self.serve_cached(&key, parts.status, &headers).await?;
            guard.complete(Completed {
                status: parts.status,
                headers,
            });
            return Ok(response);
        }

        debug!(
            "Cache miss for {} (cached: {:?}, declared length: {})",
            remote.raw, cached, declared_length
        );
        let writer = CacheWriter::create(&key).await?;
        Ok(self.stream(parts.status, headers, body, Some(writer), guard))
    }

    /// Hands the origin body to a copy task and answers with the client end.
    /// Status and headers are fixed here, before any body byte moves.
    fn stream(
        &self,
        status: StatusCode,
        headers: HeaderMap,
        body: Incoming,
        writer: Option<CacheWriter>,
        guard: FlightGuard,
    ) -> Response<ProxyBody> {
        let (tee, client_body) = Tee::new(writer);
        let completed = Completed {
            status,
            headers: headers.clone(),
        };

        tokio::spawn(tee::copy_body(body, tee, move |_| guard.complete(completed)));

        build_response(status, headers, client_body.boxed_unsync())
    }

    async fn serve_cached(
        &self,
        path: &Path,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ProxyError::CacheIo(format!("open {} failed: {}", path.display(), e)))?;
        let body = StreamingFileBody::new(file).boxed_unsync();
        Ok(build_response(status, headers.clone(), body))
    }
}

/// Additive copy: every value of every end-to-end header is kept.
pub fn copy_headers(src: &HeaderMap) -> HeaderMap {
    let mut dst = HeaderMap::with_capacity(src.len());
    for (name, value) in src.iter() {
        if HOP_BY_HOP.contains(name) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
    dst
}

/// Missing or unparsable `Content-Length` counts as 0.
pub fn declared_length(headers: &HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

fn build_response(status: StatusCode, headers: HeaderMap, body: ProxyBody) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn error_response(e: &ProxyError) -> Response<ProxyBody> {
    let mut response = Response::new(tee::empty());
    *response.status_mut() = e.status();
    response
}
