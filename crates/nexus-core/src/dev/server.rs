//! HTTP routes and the live-update socket.

use super::client::{self, CLIENT_RUNTIME, CLIENT_URL, STATUS_URL, WS_URL};
use super::coordinator::{Command, DevSnapshot, FetchReply, ServedModule, SnapshotCell};
use super::session::DevSession;
use crate::builder::InvalidationReport;
use crate::error::{Error, ModuleError};
use crate::graph::ModuleKind;
use crate::transform::mime_for;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path as AxumPath, RawQuery, State,
    },
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use nexus_proto::{
    ClientMessage, DevStatus, ErrorPayload, ServerEvent, GENERATION_HEADER, MODULE_ID_HEADER,
};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use tokio::sync::{broadcast, oneshot, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, trace};

/// State shared by every handler.
#[derive(Debug)]
pub(crate) struct DevState {
    pub(crate) root: PathBuf,
    pub(crate) snapshot: Arc<SnapshotCell>,
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) events: broadcast::Sender<ServerEvent>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) entry_url: Option<String>,
    sessions: AtomicUsize,
    next_session: AtomicU64,
}

impl DevState {
    pub(crate) fn new(
        root: PathBuf,
        snapshot: Arc<SnapshotCell>,
        commands: mpsc::Sender<Command>,
        events: broadcast::Sender<ServerEvent>,
        shutdown: watch::Sender<bool>,
        entry_url: Option<String>,
    ) -> Self {
        Self {
            root,
            snapshot,
            commands,
            events,
            shutdown,
            entry_url,
            sessions: AtomicUsize::new(0),
            next_session: AtomicU64::new(0),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<DevSnapshot> {
        self.snapshot.load()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| Error::other("dev coordinator has stopped"))?;
        rx.await
            .map_err(|_| Error::other("dev coordinator dropped the request"))
    }

    pub(crate) async fn fetch(&self, path: PathBuf, known_generation: u64) -> Result<FetchReply, Error> {
        self.request(|reply| Command::Fetch {
            path,
            known_generation,
            reply,
        })
        .await
    }

    pub(crate) async fn files_changed(&self, paths: Vec<PathBuf>) -> Result<InvalidationReport, Error> {
        self.request(|reply| Command::FilesChanged { paths, reply }).await
    }

    pub(crate) async fn status(&self) -> Result<DevStatus, Error> {
        let mut status = self.request(|reply| Command::Status { reply }).await?;
        status.sessions = self.sessions.load(Ordering::Relaxed);
        Ok(status)
    }

    /// Filesystem path a request URL names. `None` for URLs that try to
    /// climb out of the root.
    fn file_for_url(&self, url: &str) -> Option<PathBuf> {
        let (base, rel) = match url.strip_prefix("/@fs/") {
            Some(abs) => (PathBuf::from("/"), abs),
            None => (self.root.clone(), url.trim_start_matches('/')),
        };
        let rel = Path::new(rel);
        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return None;
        }
        let path = base.join(rel);
        Some(dunce::canonicalize(&path).unwrap_or(path))
    }

    fn index_html(&self) -> String {
        let html = std::fs::read_to_string(self.root.join("index.html"))
            .unwrap_or_else(|_| client::generate_index_html(self.entry_url.as_deref()));
        client::inject_client(&html)
    }
}

pub(crate) fn router(state: Arc<DevState>) -> Router {
    Router::new()
        .route("/", get(serve_index))
        .route(CLIENT_URL, get(serve_client))
        .route(WS_URL, get(live_socket))
        .route(STATUS_URL, get(serve_status))
        .route("/*path", get(serve_module))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

fn with_headers(mut response: Response, content_type: &'static str, generation: u64) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static(GENERATION_HEADER),
        HeaderValue::from(generation),
    );
    response
}

/// Responses carry the newest generation the server has published, never the
/// older stamp an unchanged module was rendered at.
fn module_response(module: &ServedModule, generation: u64) -> Response {
    let mut response = with_headers(
        (StatusCode::OK, module.body.to_string()).into_response(),
        module.content_type,
        module.generation.max(generation),
    );
    if let Ok(value) = HeaderValue::from_str(&module.url) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(MODULE_ID_HEADER), value);
    }
    response
}

fn error_response(url: &str, error: &ModuleError, generation: u64) -> Response {
    let status = if error.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    debug!(module = %url, code = error.code(), status = status.as_u16(), "Module request failed");
    let payload = ErrorPayload::new(error.code(), error.to_string(), generation).with_module(url);
    with_headers(
        (status, Json(payload)).into_response(),
        "application/json",
        generation,
    )
}

async fn serve_index(State(state): State<Arc<DevState>>) -> Response {
    let generation = state.snapshot().generation;
    with_headers(
        (StatusCode::OK, state.index_html()).into_response(),
        "text/html; charset=utf-8",
        generation,
    )
}

async fn serve_client(State(state): State<Arc<DevState>>) -> Response {
    with_headers(
        (StatusCode::OK, CLIENT_RUNTIME).into_response(),
        "application/javascript",
        state.snapshot().generation,
    )
}

async fn serve_status(State(state): State<Arc<DevState>>) -> Response {
    match state.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// Serve a module or a raw file.
///
/// Scripts always go through the module pipeline. Other files are served
/// raw unless requested with `?import`, which asks for their module form.
async fn serve_module(
    State(state): State<Arc<DevState>>,
    AxumPath(path): AxumPath<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let url = format!("/{path}");
    let snapshot = state.snapshot();
    let generation = snapshot.generation;

    let Some(file) = state.file_for_url(&url) else {
        return error_response(&url, &ModuleError::OutsideRoot { path: url.clone() }, generation);
    };

    let as_import = query
        .as_deref()
        .is_some_and(|q| q.split('&').any(|p| p == "import" || p.starts_with("import=")));
    let is_script = ModuleKind::from_path(&file) == ModuleKind::Script;

    if !file.exists() && file.extension().is_none() {
        // Client-side route
        return with_headers(
            (StatusCode::OK, state.index_html()).into_response(),
            "text/html; charset=utf-8",
            generation,
        );
    }

    if !is_script && !as_import {
        return serve_raw(&state, &url, &file, generation);
    }

    if let Some(module) = snapshot.module(&file) {
        trace!(module = %url, "Serving from snapshot");
        return module_response(module, generation);
    }

    match state.fetch(file, generation).await {
        Ok(FetchReply::Module(module)) => {
            module_response(&module, state.snapshot().generation)
        }
        Ok(FetchReply::Failed {
            url,
            error,
            generation,
        }) => error_response(&url, &error, generation),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

fn serve_raw(state: &DevState, url: &str, file: &Path, generation: u64) -> Response {
    if !file.starts_with(&state.root) {
        return error_response(url, &ModuleError::OutsideRoot { path: url.to_string() }, generation);
    }
    match std::fs::read(file) {
        Ok(bytes) => with_headers(
            (StatusCode::OK, bytes).into_response(),
            mime_for(file),
            generation,
        ),
        Err(e) => error_response(url, &ModuleError::read(file, &e), generation),
    }
}

async fn live_socket(ws: WebSocketUpgrade, State(state): State<Arc<DevState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Forward events to one client and read its acknowledgements.
async fn handle_socket(mut socket: WebSocket, state: Arc<DevState>) {
    // Subscribe before reading the generation so nothing falls in between
    let mut events = state.events.subscribe();
    let mut shutdown = state.shutdown.subscribe();
    let id = state.next_session.fetch_add(1, Ordering::Relaxed) + 1;
    let mut session = DevSession::new(id, state.snapshot().generation);
    state.sessions.fetch_add(1, Ordering::Relaxed);
    debug!(session = id, generation = session.last_delivered(), "Session opened");

    if socket
        .send(Message::Text(session.connected().to_json()))
        .await
        .is_ok()
    {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let event = match event {
                        Ok(event) => {
                            if !session.accept(&event) {
                                continue;
                            }
                            event
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            session.lagged(state.snapshot().generation, skipped)
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if socket.send(Message::Text(event.to_json())).await.is_err() {
                        break;
                    }
                }
                message = socket.recv() => match message {
                    Some(Ok(Message::Text(text))) => handle_client_message(&mut session, &text),
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    state.sessions.fetch_sub(1, Ordering::Relaxed);
    debug!(session = id, acked = session.last_acked(), "Session closed");
}

fn handle_client_message(session: &mut DevSession, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ack { generation }) => {
            if !session.ack(generation) {
                trace!(session = session.id(), generation, "Ignoring out-of-order ack");
            }
        }
        Ok(ClientMessage::Ping) => {}
        Err(e) => debug!(session = session.id(), error = %e, "Unreadable client message"),
    }
}
