use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};
use uuid::Uuid;

use crate::registry::Outbound;
use crate::session::{Flow, Gateway, Session};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long the writer gets to flush a requested close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

enum Ended {
    Writer,
    Peer,
    CloseRequested,
}

/// Drives one room socket. The caller has already verified the access token
/// and resolved `user_id` from it.
pub async fn serve_socket(socket: WebSocket, gateway: Gateway, room_id: Uuid, user_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut session = Session::new(gateway, room_id, user_id, tx.clone());

    match session.open().await {
        Ok(true) => {}
        Ok(false) => {
            send_close(&mut sender, close_code::POLICY, "not a member").await;
            return;
        }
        Err(e) => {
            error!("Could not authorize {} for room {}: {}", user_id, room_id, e);
            send_close(&mut sender, close_code::ERROR, "internal error").await;
            return;
        }
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let mut send_task = tokio::spawn(write_loop(sender, rx, pong_received.clone()));

    let ended = tokio::select! {
        _ = &mut send_task => Ended::Writer,
        ended = read_loop(&mut session, &mut receiver, &pong_received, &tx) => ended,
    };

    session.close().await;

    match ended {
        Ended::Writer => {}
        Ended::CloseRequested => {
            if tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
                send_task.abort();
            }
        }
        Ended::Peer => send_task.abort(),
    }
    info!("{} disconnected from room {}", user_id, room_id);
}

async fn read_loop(
    session: &mut Session,
    receiver: &mut SplitStream<WebSocket>,
    pong_received: &AtomicBool,
    tx: &mpsc::UnboundedSender<Outbound>,
) -> Ended {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                if let Flow::Close { code, reason } = session.handle_text(text.as_str()).await {
                    let _ = tx.send(Outbound::Close { code, reason });
                    return Ended::CloseRequested;
                }
            }
            Message::Pong(_) => {
                pong_received.store(true, Ordering::Release);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ended::Peer
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    pong_received: Arc<AtomicBool>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(outbound) = outbound else { break };
                match outbound {
                    Outbound::Event(event) => {
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to encode event: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            trace!("Socket gone while writing");
                            break;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        send_close(&mut sender, code, &reason).await;
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn send_close(sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(e) = sender.send(Message::Close(Some(frame))).await {
        trace!("Close frame not delivered: {}", e);
    }
}
