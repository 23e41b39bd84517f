use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::{ClientEvent, ServerEvent};
use super::server::AppState;
use crate::error::{AuthError, TabError};
use crate::session::{BoundConnection, Registry, SessionHandle, TabBinding, TabState};

pub fn ws_routes() -> Router<Arc<AppState>> {
    Router::new().route("/terminal/ws", get(ws_handler))
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    // Authenticate after the upgrade so the client gets a structured error
    // event instead of a bare failed handshake
    ws.on_upgrade(move |socket| async move {
        match state.auth.validate(&cookie).await {
            Ok(user) => handle_connection(socket, state, user).await,
            Err(e) => reject_unauthorized(socket, e).await,
        }
    })
}

/// Tell the client why it is being dropped, then close. No client event is
/// processed on an unauthenticated socket.
async fn reject_unauthorized(mut socket: WebSocket, err: AuthError) {
    tracing::info!(error = %err, "Rejected unauthenticated WebSocket");

    let event = ServerEvent::Error {
        message: "Unauthorized".to_string(),
    };
    if let Ok(json) = serde_json::to_string(&event) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Utf8Bytes::from_static("Unauthorized"),
        })))
        .await;
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, user: String) {
    tracing::info!(user = %user, "WebSocket connected");

    let bound = state.registry.bind_connection(&user).await;
    let conn_id = bound.conn_id;

    if let Err(e) = serve_connection(socket, &state.registry, bound).await {
        tracing::debug!(user = %user, error = %e, "WebSocket handler error");
    }

    state.registry.unbind(&user, conn_id).await;
    tracing::info!(user = %user, "WebSocket disconnected");
}

async fn serve_connection(
    socket: WebSocket,
    registry: &Arc<Registry>,
    mut bound: BoundConnection,
) -> anyhow::Result<()> {
    let (mut sink, mut stream) = socket.split();
    let session = bound.session.clone();
    let outbound = bound.outbound.clone();
    let cancel = bound.cancel.clone();

    // Topology first so the UI can build its tab strip before output arrives
    send_event(
        &mut sink,
        &ServerEvent::Tabs {
            tabs: bound.tabs_snapshot.clone(),
            active_tab: bound.active_tab.clone(),
        },
    )
    .await?;

    for binding in bound.tabs.drain(..) {
        spawn_tab_forwarder(binding, outbound.clone(), cancel.clone());
    }

    loop {
        tokio::select! {
            // A newer connection for this user took over
            _ = cancel.cancelled() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: Utf8Bytes::from_static("Replaced by new connection"),
                    })))
                    .await;
                break;
            }

            // Queued server events -> client
            event = bound.events.recv() => {
                match event {
                    Some(event) => send_event(&mut sink, &event).await?,
                    None => break,
                }
            }

            // Client frames -> dispatch
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                dispatch(registry, &session, &outbound, &cancel, event).await;
                            }
                            Err(e) => {
                                // Malformed frames are dropped, not fatal
                                tracing::debug!(error = %e, "Ignoring malformed client event");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> anyhow::Result<()> {
    let json = serde_json::to_string(event)?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

async fn dispatch(
    registry: &Arc<Registry>,
    session: &Arc<SessionHandle>,
    outbound: &mpsc::Sender<ServerEvent>,
    cancel: &CancellationToken,
    event: ClientEvent,
) {
    match event {
        ClientEvent::PtyInput { tab_id, input } => {
            match registry
                .write_tab(session, &tab_id, Bytes::from(input.into_bytes()))
                .await
            {
                Ok(()) => {}
                // Keystrokes racing a tab's death are expected; drop them
                Err(TabError::DeadProcess(_)) | Err(TabError::NotFound(_)) => {
                    tracing::debug!(tab = %tab_id, "Dropped input for unavailable tab");
                }
                Err(e) => send_tab_error(outbound, &tab_id, &e).await,
            }
        }
        ClientEvent::Resize { tab_id, cols, rows } => {
            if let Err(e) = registry.resize_tab(session, &tab_id, cols, rows).await {
                tracing::debug!(tab = %tab_id, error = %e, "Resize rejected");
                send_tab_error(outbound, &tab_id, &e).await;
            }
        }
        ClientEvent::TabOpen { tab_id } => match registry.open_tab(session, &tab_id).await {
            Ok(binding) => spawn_tab_forwarder(binding, outbound.clone(), cancel.clone()),
            // Both sides may open the same tab during reconnect reconciliation
            Err(TabError::AlreadyExists(_)) => {}
            Err(e) => send_tab_error(outbound, &tab_id, &e).await,
        },
        ClientEvent::TabClose { tab_id } => {
            if let Err(e) = registry.close_tab(session, &tab_id).await {
                tracing::debug!(tab = %tab_id, error = %e, "Close rejected");
            }
        }
        ClientEvent::TabSelect { tab_id } => {
            if let Err(e) = registry.select_tab(session, &tab_id).await {
                tracing::debug!(tab = %tab_id, error = %e, "Select rejected");
            }
        }
    }
}

async fn send_tab_error(outbound: &mpsc::Sender<ServerEvent>, tab_id: &str, err: &TabError) {
    let _ = outbound
        .send(ServerEvent::TabError {
            tab_id: tab_id.to_string(),
            message: err.to_string(),
        })
        .await;
}

/// Pump one tab's output into the connection queue: buffered replay first,
/// then live output. Ends when the tab's channel closes or the connection is
/// replaced.
fn spawn_tab_forwarder(
    binding: TabBinding,
    outbound: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let tab_id = binding.tab_id;

        if !binding.replay.is_empty() {
            let event = ServerEvent::PtyOutput {
                tab_id: tab_id.clone(),
                output: String::from_utf8_lossy(&binding.replay).into_owned(),
            };
            if outbound.send(event).await.is_err() {
                return;
            }
        }

        // A tab that died while no client was attached still owes its exit
        // notification after the replay
        match binding.state {
            TabState::Running => {}
            TabState::Dead => {
                let _ = outbound
                    .send(ServerEvent::TabExit {
                        tab_id: tab_id.clone(),
                        code: binding.exit_code.unwrap_or(0),
                    })
                    .await;
                return;
            }
            TabState::Failed => {
                let _ = outbound
                    .send(ServerEvent::TabError {
                        tab_id: tab_id.clone(),
                        message: "failed to spawn shell".to_string(),
                    })
                    .await;
                return;
            }
        }

        let Some(mut rx) = binding.output else {
            return;
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = rx.recv() => match res {
                    Ok((seq, bytes)) => {
                        // Already delivered as part of the replay
                        if seq < binding.replay_seq {
                            continue;
                        }
                        let event = ServerEvent::PtyOutput {
                            tab_id: tab_id.clone(),
                            output: String::from_utf8_lossy(&bytes).into_owned(),
                        };
                        if outbound.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(tab = %tab_id, dropped = n, "Client lagging, output dropped");
                    }
                    // Process gone; the exit watcher reports the exit itself
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}
