//! One live socket: a read task and a write task bound to a single user.
//!
//! The read task decodes frames and calls into delivery; it never writes to
//! the socket. Everything the client receives goes through the session's
//! mailbox, which the write task drains. Whichever task stops first takes
//! the session out of the registry.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use toloko_shared::protocol::{ClientEvent, ClientFrame, ServerEvent};
use toloko_shared::UserId;

use crate::config::SessionLimits;
use crate::delivery::MessageDelivery;
use crate::error::ServerError;
use crate::hub::{Registration, Registry, SessionId};

/// Drive a socket until either side gives up.
pub async fn run_session(
    socket: WebSocket,
    user: UserId,
    registry: Registry,
    delivery: MessageDelivery,
    limits: SessionLimits,
) {
    let Registration {
        session_id,
        mailbox,
    } = match registry.register(user).await {
        Ok(registration) => registration,
        Err(e) => {
            warn!(user = %user, error = %e, "could not register session");
            return;
        }
    };

    info!(session = %session_id, user = %user, "session started");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(
        sink,
        mailbox,
        limits.ping_interval,
        limits.write_timeout,
    ));
    let mut reader = tokio::spawn(read_loop(
        stream,
        session_id,
        user,
        registry.clone(),
        delivery,
        limits.idle_timeout,
    ));

    tokio::select! {
        _ = &mut reader => {
            registry.unregister(session_id).await;
            // The mailbox is closed now; give the writer a moment to send its
            // close frame.
            if timeout(limits.write_timeout, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        _ = &mut writer => {
            reader.abort();
            registry.unregister(session_id).await;
        }
    }

    info!(session = %session_id, user = %user, "session ended");
}

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    session: SessionId,
    user: UserId,
    registry: Registry,
    delivery: MessageDelivery,
    idle_timeout: Duration,
) {
    loop {
        // Any inbound frame, keepalive pongs included, refreshes the deadline.
        let message = match timeout(idle_timeout, stream.next()).await {
            Err(_) => {
                info!(session = %session, "idle timeout");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(session = %session, error = %e, "read error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let decoded = match &message {
            Message::Text(text) => ClientFrame::decode(text.as_str().as_bytes()),
            Message::Binary(data) => ClientFrame::decode(data),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                debug!(session = %session, "client closed");
                break;
            }
        };

        match decoded {
            Ok(frame) => dispatch(frame, session, user, &registry, &delivery).await,
            Err(e) if e.is_fatal() => {
                debug!(session = %session, error = %e, "undecodable frame, closing");
                break;
            }
            Err(e) => debug!(session = %session, error = %e, "dropping frame"),
        }
    }
}

async fn dispatch(
    frame: ClientFrame,
    session: SessionId,
    user: UserId,
    registry: &Registry,
    delivery: &MessageDelivery,
) {
    let kind = frame.event.kind();

    let result = match frame.event {
        ClientEvent::SendMessage(payload) => delivery
            .send_message(user, payload.to_user_id, payload.text, frame.temp_id)
            .await
            .map(|_| ()),
        ClientEvent::MarkRead(payload) => delivery
            .mark_read(payload.message_id, user)
            .await
            .map(|_| ()),
        ClientEvent::TypingStart(target) => {
            delivery
                .relay_typing(user, target.conversation_id, true)
                .await
        }
        ClientEvent::TypingStop(target) => {
            delivery
                .relay_typing(user, target.conversation_id, false)
                .await
        }
        ClientEvent::Ping => {
            let pong = ServerEvent::Pong {
                timestamp: Utc::now().timestamp(),
            };
            registry.send_to_session(session, pong).await;
            Ok(())
        }
    };

    match result {
        Ok(()) => {}
        Err(ServerError::Blocked) => {
            debug!(session = %session, user = %user, kind, "blocked, event absorbed");
        }
        Err(e) => warn!(session = %session, user = %user, kind, error = %e, "event failed"),
    }
}

// ---------------------------------------------------------------------------
// Write side
// ---------------------------------------------------------------------------

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut mailbox: mpsc::Receiver<ServerEvent>,
    ping_interval: Duration,
    write_timeout: Duration,
) {
    let mut keepalive = interval_at(Instant::now() + ping_interval, ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = mailbox.recv() => {
                let Some(event) = event else {
                    // Unregistered or evicted.
                    let _ = write_frame(&mut sink, Message::Close(None), write_timeout).await;
                    break;
                };

                let json = match event.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, event = event.event_type(), "failed to encode event");
                        continue;
                    }
                };

                if let Err(e) = write_frame(&mut sink, Message::Text(json.into()), write_timeout).await {
                    debug!(error = %e, "write failed");
                    break;
                }
                keepalive.reset();
            }
            _ = keepalive.tick() => {
                if let Err(e) = write_frame(&mut sink, Message::Ping(Bytes::new()), write_timeout).await {
                    debug!(error = %e, "keepalive failed");
                    break;
                }
            }
        }
    }
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    limit: Duration,
) -> anyhow::Result<()> {
    timeout(limit, sink.send(message)).await??;
    Ok(())
}
