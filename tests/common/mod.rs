//! In-process stand-in for the hosted database, backed by the crate's own
//! shadow tree: REST mutations on `/<path>/.json` plus per-watcher
//! server-sent-events fan-out.
#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use ember_sdk::shadow::{ShadowNode, ShadowTree};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub struct StubDb {
    pub url: String,
    state: Arc<StubState>,
}

struct StubState {
    tree: Mutex<ShadowTree>,
    watchers: Mutex<Vec<Watcher>>,
    version: AtomicUsize,
    push_counter: AtomicUsize,
    stream_connections: AtomicUsize,
}

struct Watcher {
    path: String,
    tx: mpsc::Sender<Bytes>,
}

impl StubDb {
    pub async fn start() -> StubDb {
        let state = Arc::new(StubState {
            tree: Mutex::new(ShadowTree::new()),
            watchers: Mutex::new(Vec::new()),
            version: AtomicUsize::new(1),
            push_counter: AtomicUsize::new(0),
            stream_connections: AtomicUsize::new(0),
        });
        let app = Router::new().fallback(handler).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        StubDb {
            url: format!("http://{}", addr),
            state,
        }
    }

    /// Seed data without going through HTTP.
    pub fn set(&self, path: &str, data: Value) {
        self.state.apply_put(path, &data);
    }

    /// How many event-stream connections have been opened so far.
    pub fn stream_connections(&self) -> usize {
        self.state.stream_connections.load(Ordering::SeqCst)
    }
}

impl StubState {
    fn apply_put(&self, path: &str, data: &Value) {
        let path = path.trim_matches('/').to_owned();
        {
            let mut tree = self.tree.lock().unwrap();
            if data.is_null() {
                tree.del(&path);
            } else {
                tree.add(&path, ShadowNode::new("", Some(data)));
            }
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        self.notify("put", &path, data);
    }

    fn apply_patch(&self, path: &str, data: &Value) {
        let path = path.trim_matches('/').to_owned();
        self.tree
            .lock()
            .unwrap()
            .update(&path, ShadowNode::new("", Some(data)));
        self.version.fetch_add(1, Ordering::SeqCst);
        self.notify("patch", &path, data);
    }

    fn notify(&self, kind: &str, path: &str, data: &Value) {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|watcher| match relative(&watcher.path, path) {
            None => true,
            Some(rel) => watcher
                .tx
                .try_send(frame(kind, &format!("/{}", rel), data))
                .is_ok(),
        });
    }
}

/// Path of `abs` relative to a watcher registered at `watch`, if the event
/// concerns the watched subtree.
fn relative(watch: &str, abs: &str) -> Option<String> {
    if watch.is_empty() {
        return Some(abs.to_owned());
    }
    if abs == watch {
        return Some(String::new());
    }
    abs.strip_prefix(&format!("{}/", watch)).map(str::to_owned)
}

fn frame(kind: &str, path: &str, data: &Value) -> Bytes {
    Bytes::from(format!(
        "event: {}\ndata: {}\n\n",
        kind,
        json!({ "path": path, "data": data })
    ))
}

fn json_response(value: Value) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_owned()))
        .unwrap()
}

async fn handler(State(state): State<Arc<StubState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let uri_path = parts.uri.path().to_owned();
    let path = uri_path
        .strip_suffix("/.json")
        .unwrap_or(&uri_path)
        .trim_matches('/')
        .to_owned();

    let accept = parts
        .headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if parts.method == Method::GET && accept == "text/event-stream" {
        state.stream_connections.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel::<Bytes>(64);
        let data = state
            .tree
            .lock()
            .unwrap()
            .get(&path)
            .map(|n| n.objectify())
            .unwrap_or(Value::Null);
        tx.send(frame("put", "/", &data)).await.unwrap();
        state.watchers.lock().unwrap().push(Watcher { path, tx });
        let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
        return Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from_stream(stream))
            .unwrap();
    }

    let body = to_bytes(body, usize::MAX).await.unwrap();
    match parts.method {
        Method::GET => {
            let data = state
                .tree
                .lock()
                .unwrap()
                .get(&path)
                .map(|n| n.objectify())
                .unwrap_or(Value::Null);
            let mut response = json_response(data);
            let wants_etag = parts
                .headers
                .get("X-Firebase-ETag")
                .map(|v| v.as_bytes() == b"true")
                .unwrap_or(false);
            if wants_etag {
                let version = state.version.load(Ordering::SeqCst).to_string();
                response
                    .headers_mut()
                    .insert(header::ETAG, version.parse().unwrap());
            }
            response
        }
        Method::PUT => {
            if let Some(expected) = parts.headers.get("if-match") {
                let version = state.version.load(Ordering::SeqCst).to_string();
                if expected.as_bytes() != version.as_bytes() {
                    return error_response(StatusCode::PRECONDITION_FAILED, "etag mismatch");
                }
            }
            let data: Value = match serde_json::from_slice(&body) {
                Ok(data) => data,
                Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid json"),
            };
            state.apply_put(&path, &data);
            json_response(data)
        }
        Method::PATCH => {
            let data: Value = match serde_json::from_slice(&body) {
                Ok(data) => data,
                Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid json"),
            };
            state.apply_patch(&path, &data);
            json_response(data)
        }
        Method::POST => {
            let data: Value = match serde_json::from_slice(&body) {
                Ok(data) => data,
                Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid json"),
            };
            let name = format!("push{:04}", state.push_counter.fetch_add(1, Ordering::SeqCst));
            let child = if path.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", path, name)
            };
            state.apply_put(&child, &data);
            json_response(json!({ "name": name }))
        }
        Method::DELETE => {
            state.apply_put(&path, &Value::Null);
            json_response(Value::Null)
        }
        _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "unsupported method"),
    }
}
