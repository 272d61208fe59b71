use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn, Instrument};

use bridge_core::{Envelope, SessionId};

use crate::registry::SessionRegistry;
use crate::server::AppState;
use crate::session::{Inbound, Session, SessionLimits};

/// Close code sent when the server or the heartbeat ends a session.
const CLOSE_GOING_AWAY: u16 = 1001;
/// Pongs may lag this many heartbeat intervals before the peer is dropped.
const MISSED_PONGS: u32 = 3;
/// WebSocket close reasons are limited to 123 bytes.
const MAX_CLOSE_REASON: usize = 123;

/// Run one client connection to completion.
pub(crate) async fn serve_socket(socket: WebSocket, state: AppState) {
    let session_id = SessionId::new();
    let span = tracing::info_span!("session", session_id = %session_id);
    run(socket, session_id, state).instrument(span).await;
}

async fn run(socket: WebSocket, session_id: SessionId, state: AppState) {
    state.sessions.register(session_id.clone());
    state.metrics.session_opened();
    info!("session connected");

    let (ws_tx, mut ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Envelope>(state.config.max_send_queue.max(1));
    let (close_tx, close_rx) = oneshot::channel::<CloseFrame>();

    let mut writer = tokio::spawn(
        write_loop(
            ws_tx,
            out_rx,
            close_rx,
            state.config.heartbeat_interval,
            Arc::clone(&state.sessions),
            session_id.clone(),
        )
        .in_current_span(),
    );

    let mut session = Session::new(
        session_id.clone(),
        Arc::clone(&state.backend),
        out_tx,
        SessionLimits {
            call_buffer: state.config.call_buffer,
            max_frame_bytes: state.config.max_frame_bytes,
        },
        state.metrics.clone(),
    );

    let close = loop {
        let message = tokio::select! {
            _ = state.shutdown.cancelled() => {
                break Some(close_frame(CLOSE_GOING_AWAY, "server shutting down"));
            }
            _ = &mut writer => break None,
            message = ws_rx.next() => message,
        };
        let inbound = match message {
            Some(Ok(WsMessage::Text(text))) => Inbound::Text(text.as_str().to_owned()),
            Some(Ok(WsMessage::Binary(bytes))) => Inbound::Binary(bytes),
            Some(Ok(WsMessage::Pong(_))) => {
                state.sessions.record_pong(&session_id);
                continue;
            }
            Some(Ok(WsMessage::Ping(_))) => continue,
            Some(Ok(WsMessage::Close(frame))) => {
                debug!(?frame, "client closed");
                break None;
            }
            Some(Err(e)) => {
                debug!(error = %e, "transport error");
                break None;
            }
            None => break None,
        };

        match session.handle(inbound).await {
            Ok(()) => state.sessions.set_state(&session_id, session.state()),
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "closing session");
                break Some(close_frame(e.close_code(), &e.to_string()));
            }
        }
    };

    // The writer must see the close frame before the queue closes under it.
    let closing = close.map(|frame| close_tx.send(frame).is_ok()).unwrap_or(false);
    session.close();
    drop(session);
    if !closing
        || tokio::time::timeout(Duration::from_secs(1), &mut writer)
            .await
            .is_err()
    {
        writer.abort();
    }

    let uptime_ms = state
        .sessions
        .uptime(&session_id)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    state.sessions.unregister(&session_id);
    state.metrics.session_closed();
    info!(uptime_ms, "session closed");
}

/// Single writer for the socket: encodes outbound envelopes, sends
/// heartbeat pings and the final close frame.
///
/// Pings are polled ahead of the outbound queue so that a saturated queue
/// cannot starve the heartbeat.
async fn write_loop<S>(
    mut ws_tx: S,
    mut rx: mpsc::Receiver<Envelope>,
    mut close_rx: oneshot::Receiver<CloseFrame>,
    heartbeat: Duration,
    sessions: Arc<SessionRegistry>,
    session_id: SessionId,
) where
    S: Sink<WsMessage> + Unpin,
{
    let mut ping = tokio::time::interval(heartbeat);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            biased;
            frame = &mut close_rx => {
                // Flush what is already queued, then close.
                while let Ok(envelope) = rx.try_recv() {
                    if send_envelope(&mut ws_tx, &envelope).await.is_err() {
                        return;
                    }
                }
                if let Ok(frame) = frame {
                    let _ = ws_tx.send(WsMessage::Close(Some(frame))).await;
                }
                return;
            }
            _ = ping.tick() => {
                if !sessions.is_alive(&session_id, heartbeat * MISSED_PONGS) {
                    warn!("heartbeat timeout");
                    let frame = close_frame(CLOSE_GOING_AWAY, "heartbeat timeout");
                    let _ = ws_tx.send(WsMessage::Close(Some(frame))).await;
                    return;
                }
                if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    return;
                }
                trace!("sent ping");
            }
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { return };
                if send_envelope(&mut ws_tx, &envelope).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn send_envelope<S>(ws_tx: &mut S, envelope: &Envelope) -> Result<(), S::Error>
where
    S: Sink<WsMessage> + Unpin,
{
    trace!(kind = envelope.kind(), call_id = envelope.call_id().get(), "sending");
    ws_tx.send(WsMessage::Binary(bridge_core::encode(envelope))).await
}

fn close_frame(code: u16, reason: &str) -> CloseFrame {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    CloseFrame {
        code,
        reason: reason[..end].to_owned().into(),
    }
}
