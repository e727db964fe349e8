//! Live event stream over WebSocket.
//!
//! `GET /ws` upgrades to a WebSocket that forwards every [`LiveEvent`] on
//! the bus as a JSON text frame. The first frame is a `connected` event,
//! sent once the connection is subscribed, so a client knows it will not
//! miss anything published afterwards.
//!
//! Clients may send:
//!
//! - `{"type": "join-dashboard"}` - accepted for compatibility; dashboards
//!   receive all untargeted events regardless.
//! - `{"type": "register-device", "deviceId": "laptop1"}` - also receive
//!   events addressed to that device, such as agent commands. Answered
//!   with a `registered` frame.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::notify::bus::{EventBus, LiveEvent};

/// Topic of the greeting frame.
pub const CONNECTED_TOPIC: &str = "connected";

/// Topic confirming a device registration.
pub const REGISTERED_TOPIC: &str = "registered";

/// Messages a live client can send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage {
    JoinDashboard,
    RegisterDevice {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
}

/// GET /ws - Upgrade to a live event stream.
pub async fn live_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_events(socket, state.bus))
}

async fn stream_events(socket: WebSocket, bus: Arc<EventBus>) {
    let mut events = bus.subscribe();
    let (mut sink, mut stream) = socket.split();
    let mut device: Option<String> = None;

    info!(viewers = bus.subscriber_count(), "Live viewer connected");

    if send_event(&mut sink, &LiveEvent::new(CONNECTED_TOPIC, serde_json::Value::Null))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if event.is_visible_to(device.as_deref())
                        && send_event(&mut sink, &event).await.is_err()
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Live viewer fell behind, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::RegisterDevice { device_id }) => {
                        info!(device_id = %device_id, "Device registered for live commands");
                        let ack = LiveEvent::for_device(
                            device_id.clone(),
                            REGISTERED_TOPIC,
                            serde_json::Value::Null,
                        );
                        device = Some(device_id);
                        if send_event(&mut sink, &ack).await.is_err() {
                            break;
                        }
                    }
                    Ok(ClientMessage::JoinDashboard) => debug!("Viewer joined dashboard"),
                    Err(e) => debug!(error = %e, "Ignoring unrecognized live message"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Live socket receive error");
                    break;
                }
            },
        }
    }

    info!("Live viewer disconnected");
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &LiveEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(e) => {
            warn!(topic = %event.topic, error = %e, "Failed to encode live event");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_messages() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"type":"register-device","deviceId":"laptop1"}"#).unwrap();
        assert!(matches!(
            message,
            ClientMessage::RegisterDevice { ref device_id } if device_id == "laptop1"
        ));

        let message: ClientMessage = serde_json::from_str(r#"{"type":"join-dashboard"}"#).unwrap();
        assert!(matches!(message, ClientMessage::JoinDashboard));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shutdown"}"#).is_err());
    }
}
