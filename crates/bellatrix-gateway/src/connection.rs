use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, trace, warn};

use bellatrix_types::events::{GatewayCommand, GatewayEvent};

use crate::handlers::{GatewayContext, Session, handle_command};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a websocket whose token was already checked at the HTTP upgrade.
/// Sends `ready`, then runs until either side goes away.
pub async fn handle_connection(socket: WebSocket, ctx: GatewayContext, user_id: i64, username: String, couple_id: i64) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut outbound_rx) = ctx.dispatcher.register(user_id, username.clone()).await;
    info!("{} ({}) connected to gateway", username, conn_id);

    let ready = GatewayEvent::Ready {
        username: username.clone(),
        couple_id,
    };
    let sent = match encode(&ready) {
        Some(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        None => false,
    };
    if !sent {
        ctx.dispatcher.unregister(conn_id).await;
        return;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Outbound queue -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = outbound_rx.recv() => {
                    let Some(event) = event else { break };
                    let Some(text) = encode(&event) else { continue };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Client commands, handled one at a time in arrival order
    let recv_ctx = ctx.clone();
    let mut session = Session::new(conn_id, user_id, username.clone());
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(text.as_str()) {
                    Ok(cmd) => {
                        trace!("{} ({}) -> {}", session.username, session.conn_id, cmd.name());
                        let outbound = handle_command(&recv_ctx, &mut session, cmd).await;
                        recv_ctx.dispatcher.deliver(outbound).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            session.username,
                            session.conn_id,
                            e,
                            truncate(text.as_str(), 200)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for the other task to actually stop so no command is still
    // touching the registry when the connection is removed
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            let _ = recv_task.await;
        }
        _ = &mut recv_task => {
            send_task.abort();
            let _ = send_task.await;
        }
    }

    ctx.dispatcher.unregister(conn_id).await;
    info!("{} ({}) disconnected from gateway", username, conn_id);
}

fn encode(event: &GatewayEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            error!("Failed to encode {} event: {}", event.name(), e);
            None
        }
    }
}

/// Cut a string to at most `max` bytes on a char boundary.
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
