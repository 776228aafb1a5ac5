use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::observability::session_span;

use super::orchestrator::{Services, Session};
use super::protocol::{Envelope, encode};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Frames buffered per connection between operations and the socket.
const OUTBOUND_BUFFER: usize = 512;

#[derive(Debug, Clone, Copy)]
struct Keepalive {
    ping_interval: Duration,
    pong_timeout: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            ping_interval: PING_INTERVAL,
            pong_timeout: PONG_TIMEOUT,
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(services): State<Arc<Services>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, services))
}

async fn handle_socket(socket: WebSocket, services: Arc<Services>) {
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let session = Session::new(services, tx);
    let span = session_span(session.id());

    async move {
        tracing::info!("Session opened");
        let (sender, receiver) = socket.split();
        run_socket_loop(&session, sender, receiver, rx, Keepalive::default()).await;
        session.close();
    }
    .instrument(span)
    .await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Multiplexes outbound frames from the session's operations, inbound client
/// frames and periodic ping/pong health checks in one select loop. Replies to
/// client frames are written straight to the sink, so the loop keeps draining
/// `outbound` no matter how full it is. Exits on close, transport error, pong
/// timeout, or session cancellation.
async fn run_socket_loop<S, R, E>(
    session: &Session,
    sender: S,
    receiver: R,
    mut outbound: mpsc::Receiver<Envelope>,
    keepalive: Keepalive,
) where
    S: Sink<Message>,
    R: Stream<Item = Result<Message, E>>,
    E: Display,
{
    tokio::pin!(sender);
    tokio::pin!(receiver);

    let cancel: CancellationToken = session.cancellation();
    let mut ping_interval = tokio::time::interval(keepalive.ping_interval);
    // The first tick completes immediately; consume it so the first real
    // ping fires after one interval has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Flush what cancelled operations reported before closing.
                while let Ok(envelope) = outbound.try_recv() {
                    if sender.send(Message::Text(encode(&envelope).into())).await.is_err() {
                        break;
                    }
                }
                break;
            }

            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > keepalive.pong_timeout {
                    tracing::info!("No pong received; dropping connection");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            Some(envelope) = outbound.recv() => {
                if sender.send(Message::Text(encode(&envelope).into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()),
                    Some(Ok(Message::Binary(_))) => Some(session.handle_binary()),
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                        None
                    }
                    // axum answers pings itself
                    Some(Ok(Message::Ping(_))) => None,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                };
                if let Some(reply) = reply {
                    if sender.send(Message::Text(encode(&reply).into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}
