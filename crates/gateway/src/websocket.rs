//! Client websocket endpoint.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use parley_events::UserId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::GatewayResult;
use crate::events::{ClientEvent, ServerEvent};
use crate::state::GatewayState;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Response {
    // Rejections are reported in-band: error frame, then close.
    let auth = state.authenticate(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, auth))
}

async fn handle_socket(socket: WebSocket, state: GatewayState, auth: GatewayResult<UserId>) {
    let (mut sink, mut receiver) = socket.split();

    let user_id = match auth {
        Ok(user_id) => user_id,
        Err(error) => {
            info!(%error, "websocket rejected");
            reject(&mut sink, &error.to_string()).await;
            return;
        }
    };

    let Connection {
        id: connection_id,
        user_id,
        sender: reply_tx,
        receiver: mut outbound_rx,
    } = match state.connections.register(&user_id).await {
        Ok(connection) => connection,
        Err(error) => {
            warn!(user_id = %user_id, %error, "connection registration failed");
            reject(&mut sink, "presence unavailable, retry later").await;
            return;
        }
    };

    let connected = ServerEvent::connected(user_id.clone(), state.connections.gateway_id().clone());
    if send_event(&mut sink, &connected).await.is_err() {
        release(&state, &user_id, connection_id).await;
        return;
    }

    let send_user = user_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            if let Err(error) = send_event(&mut sink, &event).await {
                debug!(user_id = %send_user, %error, "websocket send failed");
                break;
            }
        }
    });

    let recv_user = user_id.clone();
    let mut receive_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => handle_text(&recv_user, &text, &reply_tx).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(error) => {
                    debug!(user_id = %recv_user, %error, "websocket receive failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => receive_task.abort(),
        _ = &mut receive_task => send_task.abort(),
    }

    release(&state, &user_id, connection_id).await;
}

async fn handle_text(user_id: &UserId, text: &str, reply_tx: &mpsc::Sender<ServerEvent>) {
    let reply = match ClientEvent::parse(text) {
        Ok(ClientEvent::Ping) => ServerEvent::pong(),
        Err(error) => {
            debug!(user_id = %user_id, %error, "unsupported client frame");
            ServerEvent::error(error.to_string())
        }
    };
    // The queue is closed only when the socket is going away.
    let _ = reply_tx.send(reply).await;
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> GatewayResult<()> {
    let frame = event.to_frame()?;
    sink.send(Message::Text(frame)).await?;
    Ok(())
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, message: &str) {
    let _ = send_event(sink, &ServerEvent::error(message)).await;
    let _ = sink.send(Message::Close(None)).await;
}

async fn release(state: &GatewayState, user_id: &UserId, connection_id: u64) {
    if let Err(error) = state.connections.unregister(user_id, connection_id).await {
        warn!(user_id = %user_id, %error, "presence release failed, record will expire");
    }
}
