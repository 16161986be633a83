//! Inbound frame handling for one session.

use super::{
    connector::WsStream,
    session::{EndReason, SessionShared},
};
use bytes::Bytes;
use chatbridge_core::protocol::{EVENT_LOGIN_OK, InboundEnvelope, split_batch};
use chrono::Utc;
use futures_util::StreamExt;
use std::{ops::ControlFlow, sync::Arc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

pub(crate) async fn read_loop(shared: Arc<SessionShared>, mut stream: WsStream) {
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                info!(?frame, "Chat server closed the socket");
                shared.end(EndReason::PeerClosed);
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!(error = %e, "Chat socket read failed");
                shared.end(EndReason::ReadFailed(e.to_string()));
                break;
            }
            None => {
                info!("Chat socket stream ended");
                shared.end(EndReason::PeerClosed);
                break;
            }
        };
        if handle_frame(&shared, text.as_str()).await.is_break() {
            break;
        }
    }
    debug!("Read loop finished");
}

async fn handle_frame(shared: &SessionShared, text: &str) -> ControlFlow<()> {
    let envelope = match InboundEnvelope::classify(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Can't decode inbound frame");
            return match e.correlation_id() {
                Some(id) => reply(shared, id).await,
                None => ControlFlow::Continue(()),
            };
        }
    };

    if envelope.is_forced_logout() {
        warn!("Agent logged in from another device");
        if let Some(id) = envelope.correlation_id() {
            if reply(shared, id).await.is_break() {
                debug!(id, "Forced logout acknowledgement not delivered");
            }
        }
        shared.end(EndReason::ForcedLogout);
        return ControlFlow::Break(());
    }

    match envelope {
        InboundEnvelope::Pong => {
            shared.record_pong();
            if let Err(e) = shared
                .bridge
                .directory
                .set_last_seen(&shared.agent_id, Utc::now())
                .await
            {
                warn!(error = ?e, "Failed to record last-seen time");
            }
            ControlFlow::Continue(())
        }
        InboundEnvelope::SingleEvent {
            id,
            event_name,
            raw,
        } => {
            if event_name == EVENT_LOGIN_OK {
                info!("Chat server accepted the login");
            }
            debug!(?id, event = %event_name, "Forwarding event");
            publish(shared, Bytes::from(raw)).await;
            match id {
                Some(id) => reply(shared, id).await,
                None => ControlFlow::Continue(()),
            }
        }
        InboundEnvelope::BatchEvent {
            id,
            events,
            skipped,
        } => {
            debug!(id, count = events.len(), skipped, "Forwarding batch");
            match split_batch(id, &events) {
                Ok(frames) => {
                    for frame in frames {
                        publish(shared, Bytes::from(frame)).await;
                    }
                }
                Err(e) => error!(id, error = %e, "Failed to re-frame batch"),
            }
            reply(shared, id).await
        }
        InboundEnvelope::Other { id, method } => {
            debug!(?id, ?method, "Ignoring frame");
            ControlFlow::Continue(())
        }
    }
}

async fn publish(shared: &SessionShared, payload: Bytes) {
    if let Err(e) = shared.bridge.publisher.publish(payload).await {
        error!(error = ?e, "Failed to publish event to the bus");
    }
}

async fn reply(shared: &SessionShared, id: i64) -> ControlFlow<()> {
    match shared.link.reply(id).await {
        Ok(_) => ControlFlow::Continue(()),
        Err(e) => {
            shared.write_failed(e);
            if shared.cancel.is_cancelled() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }
    }
}
