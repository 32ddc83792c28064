//! End-to-end tests for the caching proxy.
//!
//! Each test starts a local hyper origin on an ephemeral port that records
//! every request it sees, and points the proxy at a fresh temp cache root.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use url_proxy::forward::ForwardRules;
use url_proxy::handler::ProxyHandler;
use url_proxy::server;
use url_proxy::CacheStore;

#[derive(Clone)]
struct Route {
    status: StatusCode,
    body: Bytes,
    delay: Duration,
    headers: Vec<(&'static str, &'static str)>,
}

impl Route {
    fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            body: body.into(),
            delay: Duration::ZERO,
            headers: Vec::new(),
        }
    }
}

#[derive(Clone)]
struct Origin {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    paths: Arc<Mutex<Vec<String>>>,
    routes: Arc<Mutex<HashMap<String, Route>>>,
}

impl Origin {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = Origin {
            addr: listener.local_addr().unwrap(),
            hits: Arc::new(AtomicUsize::new(0)),
            paths: Arc::new(Mutex::new(Vec::new())),
            routes: Arc::new(Mutex::new(HashMap::new())),
        };

        let state = origin.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let state = state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(state.respond(req.uri().path()).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        origin
    }

    async fn respond(&self, path: &str) -> Response<Full<Bytes>> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().unwrap().push(path.to_string());

        let route = self.routes.lock().unwrap().get(path).cloned();
        let Some(route) = route else {
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from_static(b"no such file")))
                .unwrap();
        };

        tokio::time::sleep(route.delay).await;
        let mut builder = Response::builder().status(route.status);
        for (name, value) in &route.headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Full::new(route.body)).unwrap()
    }

    fn route(&self, path: &str, route: Route) {
        self.routes.lock().unwrap().insert(path.to_string(), route);
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn handler(cache_root: &Path, forwards: ForwardRules) -> ProxyHandler {
    ProxyHandler::new(CacheStore::new(cache_root), Arc::new(forwards))
}

async fn get(handler: &ProxyHandler, url: &str) -> (StatusCode, hyper::HeaderMap, Bytes) {
    let req = Request::builder()
        .uri(format!("/{}", url))
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = handler.handle(req).await;
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, body)
}

fn files_under(dir: &Path) -> Vec<String> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                found.push(path.strip_prefix(dir).unwrap().to_string_lossy().to_string());
            }
        }
    }
    found.sort();
    found
}

#[tokio::test]
async fn test_invalid_urls_are_rejected_without_fetching() {
    let origin = Origin::start().await;
    let cache = TempDir::new().unwrap();
    let proxy = handler(cache.path(), ForwardRules::default());

    for bad in ["", "not-a-url", "file:///etc/passwd", "gopher://example.com/x", "mailto:someone@example.com"] {
        let (status, _, _) = get(&proxy, bad).await;
        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE, "{:?}", bad);
    }

    assert_eq!(origin.hits(), 0);
    assert!(files_under(cache.path()).is_empty());
}

#[tokio::test]
async fn test_fetch_streams_and_caches() {
    let origin = Origin::start().await;
    let body: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    origin.route("/file.bin", Route::ok(body.clone()));

    let cache = TempDir::new().unwrap();
    let proxy = handler(cache.path(), ForwardRules::default());
    let url = origin.url("/file.bin");

    let (status, headers, received) = get(&proxy, &url).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-length"], "1024");
    assert_eq!(&received[..], &body[..]);

    let cached_path = cache.path().join("http").join(origin.addr.to_string()).join("file.bin");
    assert_eq!(proxy.cache().key_for(&url), cached_path);
    assert_eq!(std::fs::read(&cached_path).unwrap(), body);
    assert_eq!(files_under(cache.path()).len(), 1);
}

#[tokio::test]
async fn test_repeat_request_is_served_from_cache() {
    let origin = Origin::start().await;
    origin.route("/data.txt", Route::ok("first version"));

    let cache = TempDir::new().unwrap();
    let proxy = handler(cache.path(), ForwardRules::default());
    let url = origin.url("/data.txt");

    let (_, _, first) = get(&proxy, &url).await;
    assert_eq!(&first[..], b"first version");

    // Same length, different bytes: only a cache hit returns the old content.
    origin.route("/data.txt", Route::ok("other version"));
    let (status, _, second) = get(&proxy, &url).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&second[..], b"first version");
    assert_eq!(
        std::fs::read(proxy.cache().key_for(&url)).unwrap(),
        b"first version"
    );
}

#[tokio::test]
async fn test_length_change_refetches_and_overwrites() {
    let origin = Origin::start().await;
    origin.route("/data.txt", Route::ok("short"));

    let cache = TempDir::new().unwrap();
    let proxy = handler(cache.path(), ForwardRules::default());
    let url = origin.url("/data.txt");

    get(&proxy, &url).await;
    origin.route("/data.txt", Route::ok("a much longer body"));
    let (_, _, received) = get(&proxy, &url).await;

    assert_eq!(&received[..], b"a much longer body");
    let key = proxy.cache().key_for(&url);
    assert_eq!(std::fs::read(&key).unwrap(), b"a much longer body");
    assert_eq!(std::fs::metadata(&key).unwrap().len(), 18);
    assert_eq!(files_under(cache.path()).len(), 1);
}

#[tokio::test]
async fn test_forward_rule_changes_fetch_target_not_cache_key() {
    let mirror = Origin::start().await;
    mirror.route("/http://example.com/a.txt", Route::ok("mirrored"));

    let cache = TempDir::new().unwrap();
    let rules = ForwardRules::parse(&format!("example.com http://{}\n", mirror.addr));
    let proxy = handler(cache.path(), rules);

    let (status, _, received) = get(&proxy, "http://example.com/a.txt").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&received[..], b"mirrored");
    assert_eq!(
        mirror.paths.lock().unwrap().clone(),
        vec!["/http://example.com/a.txt".to_string()]
    );
    assert_eq!(
        std::fs::read(cache.path().join("http/example.com/a.txt")).unwrap(),
        b"mirrored"
    );
}

#[tokio::test]
async fn test_dot_segments_stay_under_requested_host() {
    let origin = Origin::start().await;
    origin.route("/https/victim.example/app.js", Route::ok("EVIL"));

    let cache = TempDir::new().unwrap();
    let proxy = handler(cache.path(), ForwardRules::default());

    let (status, _, received) = get(&proxy, &origin.url("/../../https/victim.example/app.js")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&received[..], b"EVIL");
    assert!(!proxy.cache().key_for("https://victim.example/app.js").exists());
    assert_eq!(
        files_under(cache.path()),
        vec![format!("http/{}/https/victim.example/app.js", origin.addr)]
    );
}

#[tokio::test]
async fn test_forward_host_without_scheme_uses_http() {
    let mirror = Origin::start().await;
    mirror.route("/ftp://ftp.example.org/pub/file.iso", Route::ok("iso bytes"));

    let cache = TempDir::new().unwrap();
    let rules = ForwardRules::parse(&format!("ftp.example.org {}\n", mirror.addr));
    let proxy = handler(cache.path(), rules);

    let (status, _, received) = get(&proxy, "ftp://ftp.example.org/pub/file.iso").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&received[..], b"iso bytes");
    assert!(cache.path().join("ftp/ftp.example.org/pub/file.iso").is_file());
}

#[tokio::test]
async fn test_unreachable_origin_is_server_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let cache = TempDir::new().unwrap();
    let proxy = handler(cache.path(), ForwardRules::default());

    let (status, _, body) = get(&proxy, &format!("http://{}/file.bin", dead)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.is_empty());
    assert!(files_under(cache.path()).is_empty());
}

#[tokio::test]
async fn test_direct_ftp_is_origin_unavailable() {
    let cache = TempDir::new().unwrap();
    let proxy = handler(cache.path(), ForwardRules::default());

    let (status, _, _) = get(&proxy, "ftp://ftp.example.org/pub/file.iso").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_error_status_is_passed_through_uncached() {
    let origin = Origin::start().await;
    let cache = TempDir::new().unwrap();
    let proxy = handler(cache.path(), ForwardRules::default());

    let (status, _, body) = get(&proxy, &origin.url("/missing")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(&body[..], b"no such file");
    assert!(files_under(cache.path()).is_empty());
}

#[tokio::test]
async fn test_cache_directory_failure_is_server_error() {
    let origin = Origin::start().await;
    origin.route("/a/b", Route::ok("nested"));

    let cache = TempDir::new().unwrap();
    let proxy = handler(cache.path(), ForwardRules::default());

    // A file where the entry's parent directory has to go.
    let blocker = proxy.cache().key_for(&origin.url("/a"));
    std::fs::create_dir_all(blocker.parent().unwrap()).unwrap();
    std::fs::write(&blocker, b"blocking file").unwrap();

    let (status, _, _) = get(&proxy, &origin.url("/a/b")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(std::fs::read(&blocker).unwrap(), b"blocking file");
}

#[tokio::test]
async fn test_headers_are_copied_additively() {
    let origin = Origin::start().await;
    origin.route(
        "/page.html",
        Route {
            headers: vec![
                ("content-type", "text/html"),
                ("x-origin-tag", "one"),
                ("x-origin-tag", "two"),
            ],
            ..Route::ok("<html></html>")
        },
    );

    let cache = TempDir::new().unwrap();
    let proxy = handler(cache.path(), ForwardRules::default());

    let (_, headers, _) = get(&proxy, &origin.url("/page.html")).await;

    assert_eq!(headers["content-type"], "text/html");
    let tags: Vec<_> = headers.get_all("x-origin-tag").iter().collect();
    assert_eq!(tags, vec!["one", "two"]);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_fetch() {
    let origin = Origin::start().await;
    origin.route(
        "/slow.bin",
        Route {
            delay: Duration::from_millis(200),
            ..Route::ok(vec![42u8; 4096])
        },
    );

    let cache = TempDir::new().unwrap();
    let proxy = handler(cache.path(), ForwardRules::default());
    let url = origin.url("/slow.bin");

    let (a, b, c) = tokio::join!(get(&proxy, &url), get(&proxy, &url), get(&proxy, &url));

    for (status, _, body) in [a, b, c] {
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], &[42u8; 4096][..]);
    }
    assert_eq!(origin.hits(), 1);
    assert_eq!(files_under(cache.path()).len(), 1);
}

#[tokio::test]
async fn test_served_over_tcp() {
    let origin = Origin::start().await;
    origin.route("/file.bin", Route::ok("over the wire"));

    let cache = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let proxy = Arc::new(handler(cache.path(), ForwardRules::default()));
    tokio::spawn(server::serve(listener, proxy));

    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let uri = format!("http://{}/{}", proxy_addr, origin.url("/file.bin"));

    let response = client.get(uri.parse().unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"over the wire");

    let bad = client
        .get(format!("http://{}/gopher://example.com/", proxy_addr).parse().unwrap())
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::RANGE_NOT_SATISFIABLE);
}
