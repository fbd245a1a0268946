// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! WebSocket endpoint (axum). One [`Connection`] per socket.

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::application::dispatcher::Dispatcher;
use crate::domain::node_config::ServerConfig;
use crate::presentation::connection::Connection;
use crate::presentation::protocol::Frame;

/// How long a closing connection waits for in-flight calls to reply
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    connections: TaskTracker,
}

pub async fn bind(config: &ServerConfig) -> anyhow::Result<TcpListener> {
    let addr = format!("{}:{}", config.bind, config.port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))
}

fn router(state: AppState) -> Router {
    let path = state.dispatcher.config().spec.server.path.clone();
    Router::new()
        .route(&path, get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the protocol until the dispatcher shuts down, then wait for every
/// connection to say goodbye
pub async fn serve(dispatcher: Arc<Dispatcher>, listener: TcpListener) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(
        addr = %addr,
        path = %dispatcher.config().spec.server.path,
        "Dispatcher listening"
    );

    let shutdown = dispatcher.shutdown_token();
    let connections = TaskTracker::new();
    let state = AppState {
        dispatcher,
        connections: connections.clone(),
    };

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("WebSocket server failed")?;

    connections.close();
    connections.wait().await;
    info!("WebSocket server stopped");
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let AppState {
        dispatcher,
        connections,
    } = state;
    ws.on_upgrade(move |socket| connections.track_future(handle_socket(dispatcher, socket, addr)))
}

async fn handle_socket(dispatcher: Arc<Dispatcher>, socket: WebSocket, addr: SocketAddr) {
    let shutdown = dispatcher.shutdown_token();
    let (connection, mut outbound) = Connection::open(dispatcher, Some(addr.to_string()));
    let session_id = connection.session_id();
    info!(session_id = %session_id, addr = %addr, "Client connected");

    let (mut sink, mut stream) = socket.split();
    let mut closing = false;

    loop {
        let frame = tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    connection.handle_text(text.as_str()).await;
                    continue;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(session_id = %session_id, error = %e, "Socket error");
                    break;
                }
            },
            Some(frame) = outbound.frames.recv() => frame,
            Some(event) = outbound.events.recv() => Frame::event(&event),
            _ = shutdown.cancelled() => {
                closing = true;
                break;
            }
        };

        if let Err(e) = sink.send(Message::Text(frame.to_text().into())).await {
            debug!(session_id = %session_id, error = %e, "Send failed");
            break;
        }
    }

    if closing {
        // Let in-flight calls (e.g. the management.restart that triggered
        // this) reply before saying goodbye
        connection.drain(DRAIN_TIMEOUT).await;
        while let Ok(frame) = outbound.frames.try_recv() {
            if sink.send(Message::Text(frame.to_text().into())).await.is_err() {
                break;
            }
        }
        let logout = Frame::logout();
        if sink.send(Message::Text(logout.to_text().into())).await.is_err() {
            warn!(session_id = %session_id, "Could not deliver logout");
        }
        let _ = sink.send(Message::Close(None)).await;
    }

    connection.close().await;
    info!(session_id = %session_id, addr = %addr, "Client disconnected");
}
