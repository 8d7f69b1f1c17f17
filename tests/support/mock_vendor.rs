use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// API key the mock vendor accepts. Other keys get a 401.
pub const MOCK_VENDOR_KEY: &str = "test-key";

#[derive(Clone)]
struct ProductEntry {
    asin: String,
    record: Value,
}

/// Scripted product database behind the mock vendor endpoints. Terms are
/// matched case-insensitively; unknown terms return an empty search result.
#[derive(Clone, Default)]
pub struct MockVendorData {
    by_term: Arc<RwLock<HashMap<String, ProductEntry>>>,
    by_asin: Arc<RwLock<HashMap<String, Value>>>,
    search_failures: Arc<AtomicUsize>,
    search_calls: Arc<AtomicUsize>,
    product_calls: Arc<AtomicUsize>,
}

impl MockVendorData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a product under a search term. `record` is the raw vendor
    /// product JSON returned by the lookup endpoint.
    pub fn insert_product(&self, term: &str, asin: &str, record: Value) {
        self.by_term.write().expect("vendor data poisoned").insert(
            term.to_ascii_lowercase(),
            ProductEntry {
                asin: asin.to_string(),
                record: record.clone(),
            },
        );
        self.by_asin
            .write()
            .expect("vendor data poisoned")
            .insert(asin.to_string(), record);
    }

    /// The next `count` search requests answer with HTTP 500.
    pub fn fail_next_searches(&self, count: usize) {
        self.search_failures.store(count, Ordering::SeqCst);
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn product_calls(&self) -> usize {
        self.product_calls.load(Ordering::SeqCst)
    }

    fn take_search_failure(&self) -> bool {
        self.search_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            })
            .is_ok()
    }

    fn lookup_term(&self, term: &str) -> Option<String> {
        self.by_term
            .read()
            .expect("vendor data poisoned")
            .get(&term.to_ascii_lowercase())
            .map(|entry| entry.asin.clone())
    }

    fn lookup_asin(&self, asin: &str) -> Option<Value> {
        self.by_asin
            .read()
            .expect("vendor data poisoned")
            .get(asin)
            .cloned()
    }
}

pub struct MockVendorServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockVendorServer {
    pub async fn start(data: MockVendorData) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock vendor listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let data = data.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| serve_request(data.clone(), req)))
            }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock vendor server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock vendor server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(
    data: MockVendorData,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::GET {
        return Ok(plain_status(StatusCode::METHOD_NOT_ALLOWED, "GET only"));
    }

    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();

    if query_param(&query, "key").as_deref() != Some(MOCK_VENDOR_KEY) {
        return Ok(plain_status(StatusCode::UNAUTHORIZED, "bad api key"));
    }

    let body = match path.as_str() {
        "/search" => {
            data.search_calls.fetch_add(1, Ordering::SeqCst);
            if data.take_search_failure() {
                return Ok(plain_status(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "scripted outage",
                ));
            }
            let term = query_param(&query, "q").unwrap_or_default();
            match data.lookup_term(&term) {
                Some(asin) => json!({ "products": [{ "asin": asin }] }),
                None => json!({ "products": [] }),
            }
        }
        "/product" => {
            data.product_calls.fetch_add(1, Ordering::SeqCst);
            let asin = query_param(&query, "asin").unwrap_or_default();
            match data.lookup_asin(&asin) {
                Some(record) => json!({ "products": [record] }),
                None => json!({ "products": [] }),
            }
        }
        _ => return Ok(plain_status(StatusCode::NOT_FOUND, "unknown endpoint")),
    };

    let mut response = Response::new(Body::from(body.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn plain_status(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

/// Minimal form decoding; enough for the terms the tests register ('+' for
/// spaces, '%20' tolerated).
fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?;
        if key != name {
            return None;
        }
        let raw = parts.next().unwrap_or_default();
        Some(raw.replace('+', " ").replace("%20", " "))
    })
}
