//! Mock cloud for the integration suite: the REST endpoints the proxy needs
//! plus the remote access WebSocket, backed by one in-process axum server.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

pub const TOKEN: &str = "mock-token";
pub const DEVICE: &str = "device01";

/// What the mock tunnel endpoint does with accepted sockets.
#[derive(Clone, Copy)]
pub enum WsBehavior {
    /// Echo binary frames back.
    Echo,
    /// Close the first connection shortly after accepting it; echo on later
    /// connections. Exercises the idle-reconnect path.
    CloseFirstThenEcho,
    /// Close as soon as the first binary frame arrives. Exercises the
    /// attached-failure path.
    CloseOnFirstFrame,
    /// Accept and never read: no pongs ever come back.
    Silent,
}

pub struct MockOptions {
    pub reject_login: bool,
    pub known_device: Option<&'static str>,
    pub ambiguous: bool,
    pub ws: WsBehavior,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            reject_login: false,
            known_device: Some(DEVICE),
            ambiguous: false,
            ws: WsBehavior::Echo,
        }
    }
}

pub struct MockState {
    pub options: MockOptions,
    pub ws_connections: AtomicUsize,
    pub pings: AtomicUsize,
}

pub struct MockCloud {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockCloud {
    pub async fn spawn(options: MockOptions) -> Self {
        let state = Arc::new(MockState {
            options,
            ws_connections: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/tenant/oauth", post(oauth))
            .route("/tenant/currentTenant", get(current_tenant))
            .route("/identity/externalIds/{xtype}/{xid}", get(identity))
            .route("/inventory/managedObjects", get(inventory_query))
            .route("/inventory/managedObjects/{id}", get(managed_object))
            .route(
                "/service/remoteaccess/client/{device}/{config}",
                get(tunnel_ws),
            )
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock cloud");
        let addr = listener.local_addr().expect("mock addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock cloud serve");
        });

        Self { addr, state }
    }

    pub fn host(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_connections(&self) -> usize {
        self.state.ws_connections.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }
}

async fn oauth(State(state): State<Arc<MockState>>) -> Response {
    if state.options.reject_login {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "Bad credentials"})),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [(
            header::SET_COOKIE,
            format!("authorization={TOKEN}; Path=/; HttpOnly"),
        )],
        Json(json!({})),
    )
        .into_response()
}

async fn current_tenant(State(state): State<Arc<MockState>>) -> Response {
    if state.options.reject_login {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "Invalid token"})),
        )
            .into_response();
    }
    Json(json!({"name": "t100"})).into_response()
}

async fn identity(
    State(state): State<Arc<MockState>>,
    Path((_xtype, xid)): Path<(String, String)>,
) -> Response {
    match state.options.known_device {
        Some(known) if known == xid => {
            Json(json!({"managedObject": {"id": "5555"}})).into_response()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "identity not found"})),
        )
            .into_response(),
    }
}

async fn inventory_query(State(state): State<Arc<MockState>>) -> Json<Value> {
    let objects: Vec<Value> = if state.options.ambiguous {
        vec![json!({"id": "5555"}), json!({"id": "5556"})]
    } else {
        vec![]
    };
    Json(json!({"managedObjects": objects}))
}

async fn managed_object(Path(id): Path<String>) -> Json<Value> {
    Json(json!({
        "id": id,
        "name": DEVICE,
        "c8y_RemoteAccessList": [
            {"id": "ra1", "name": "ssh", "protocol": "PASSTHROUGH", "port": 22}
        ]
    }))
}

async fn tunnel_ws(
    State(state): State<Arc<MockState>>,
    Path((_device, _config)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_tunnel(socket, state))
}

async fn handle_tunnel(mut socket: WebSocket, state: Arc<MockState>) {
    let connection = state.ws_connections.fetch_add(1, Ordering::SeqCst) + 1;
    match state.options.ws {
        WsBehavior::CloseFirstThenEcho if connection == 1 => {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = socket.send(Message::Close(None)).await;
        }
        WsBehavior::CloseOnFirstFrame => {
            while let Some(Ok(msg)) = socket.recv().await {
                match msg {
                    Message::Binary(_) => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                    Message::Ping(_) => {
                        state.pings.fetch_add(1, Ordering::SeqCst);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
        WsBehavior::Silent => {
            // Hold the socket open without ever reading it.
            let _parked = socket;
            std::future::pending::<()>().await;
        }
        WsBehavior::Echo | WsBehavior::CloseFirstThenEcho => echo(socket, &state).await,
    }
}

async fn echo(mut socket: WebSocket, state: &MockState) {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Binary(payload) => {
                if socket.send(Message::Binary(payload)).await.is_err() {
                    break;
                }
            }
            Message::Ping(_) => {
                state.pings.fetch_add(1, Ordering::SeqCst);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}
