//! Push notification channel.
//!
//! A background reader task keeps a full-duplex text-frame connection to the
//! notification server, heartbeats it every five seconds and feeds every
//! text frame into the [`NotificationQueue`]. The reader also owns the
//! auto-acknowledgement policy: spurious console OFFERs that arrive while
//! the caller flow is not explicitly waiting for one are RESULT-acked right
//! here, which means the reader issues outbound HTTP through the shared
//! [`ApiClient`].
//!
//! The reader never holds a lock across I/O: the state mask is sampled for
//! the ack-window predicate, the console target is cloned out of its lock,
//! and only then is the acknowledgement posted.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::error::{PunchError, PunchResult};
use crate::http::{ApiClient, ConsoleTarget};
use crate::message::{SessionMessage, SessionMessageAction};
use crate::notify::{NotificationKind, NotificationQueue};
use crate::state::{SessionState, StateCell};

/// Vendor headers the notification server requires verbatim.
const CHANNEL_HEADERS: [(&str, &str); 8] = [
    ("Sec-WebSocket-Protocol", "np-pushpacket"),
    ("User-Agent", "WebSocket++/0.8.2"),
    ("X-PSN-APP-TYPE", "REMOTE_PLAY"),
    ("X-PSN-APP-VER", "RemotePlay/1.0"),
    ("X-PSN-KEEP-ALIVE-STATUS-TYPE", "3"),
    ("X-PSN-OS-VER", "Windows/10.0"),
    ("X-PSN-PROTOCOL-VERSION", "2.1"),
    ("X-PSN-RECONNECTION", "false"),
];

/// Everything the reader task needs.
pub(crate) struct PushReader {
    /// Full channel URL (`wss://{fqdn}/np/pushNotification`)
    pub url: String,
    /// Queue fed with classified frames
    pub queue: Arc<NotificationQueue>,
    /// Session state, set to `WS_OPEN` once connected
    pub state: Arc<StateCell>,
    /// Shared HTTP client for auto-acknowledgements
    pub api: ApiClient,
    /// Console identity, available once the session started
    pub target: Arc<RwLock<Option<ConsoleTarget>>>,
    /// Heartbeat interval
    pub ping_interval: Duration,
}

/// Handle to a running reader task.
pub(crate) struct PushHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PushHandle {
    /// Signals the reader to stop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// Spawns the reader task.
pub(crate) fn spawn(reader: PushReader) -> PushHandle {
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        if let Err(e) = reader.run(stop_rx).await {
            tracing::error!("push channel terminated: {e}");
        }
    });
    PushHandle { stop, task }
}

/// The auto-acknowledgement window: between receiving the control OFFER and
/// establishing the control flow, and again after the data OFFER arrived,
/// nobody is waiting for OFFERs, so the reader answers them itself.
pub(crate) fn auto_ack_window(state: SessionState) -> bool {
    (state.contains(SessionState::CTRL_OFFER_RECEIVED)
        && !state.contains(SessionState::CTRL_ESTABLISHED))
        || state.contains(SessionState::DATA_OFFER_RECEIVED)
}

impl PushReader {
    async fn run(self, mut stop: watch::Receiver<bool>) -> PunchResult<()> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| PunchError::Network(format!("bad push URL {}: {e}", self.url)))?;
        {
            let headers = request.headers_mut();
            headers.insert(
                "Authorization",
                self.api
                    .bearer()
                    .parse()
                    .map_err(|_| PunchError::Network("bearer not header-safe".to_string()))?,
            );
            for (name, value) in CHANNEL_HEADERS {
                headers.insert(name, value.parse().expect("static header value"));
            }
        }

        let (mut channel, _) = connect_async(request)
            .await
            .map_err(|e| PunchError::Network(format!("connecting to {}: {e}", self.url)))?;
        tracing::debug!("push channel open: {}", self.url);
        self.state.set(SessionState::WS_OPEN);

        let mut heartbeat = tokio::time::interval(self.ping_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and doubles as the first ping
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    let _ = channel.close(None).await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        return Err(PunchError::Protocol(
                            "push channel did not answer ping in time".to_string(),
                        ));
                    }
                    channel
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| PunchError::Network(format!("ping failed: {e}")))?;
                    tracing::trace!("push channel: ping");
                    awaiting_pong = true;
                }
                frame = channel.next() => match frame {
                    None => {
                        return Err(PunchError::Network("push channel closed".to_string()));
                    }
                    Some(Err(e)) => {
                        return Err(PunchError::Network(format!("push channel read: {e}")));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        tracing::trace!("push channel: pong");
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        channel
                            .send(Message::Pong(payload))
                            .await
                            .map_err(|e| PunchError::Network(format!("pong failed: {e}")))?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Err(PunchError::Network(
                            "push channel closed by server".to_string(),
                        ));
                    }
                    Some(Ok(Message::Text(text))) => self.ingest(&text).await,
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.ingest(text).await,
                        Err(_) => tracing::warn!("push channel: non-UTF-8 binary frame dropped"),
                    },
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    /// Parses, classifies, optionally auto-acks and enqueues one frame.
    async fn ingest(&self, raw: &str) {
        let json: serde_json::Value = match serde_json::from_str(raw) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("push channel: unparseable frame dropped ({e})");
                tracing::debug!("frame was: {raw}");
                return;
            }
        };
        let kind = NotificationKind::classify(&json);
        tracing::trace!("push channel: {kind:?} frame, {} bytes", raw.len());

        if kind == NotificationKind::SessionMessageCreated && auto_ack_window(self.state.snapshot())
        {
            self.auto_ack(&json).await;
        }

        self.queue.push(kind, json, raw.to_string());
    }

    /// RESULT-acks an unsolicited OFFER with an empty connection request.
    async fn auto_ack(&self, json: &serde_json::Value) {
        let message = match SessionMessage::payload_body(json)
            .and_then(|body| SessionMessage::from_body(&body))
        {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("push channel: failed to parse session message for acking: {e}");
                return;
            }
        };
        if message.action != SessionMessageAction::Offer {
            return;
        }

        let target = {
            let guard = self.target.read().expect("console target lock poisoned");
            guard.clone()
        };
        let Some(target) = target else {
            tracing::warn!("push channel: OFFER before console is known, not acking");
            return;
        };

        let ack = SessionMessage {
            action: SessionMessageAction::Result,
            req_id: message.req_id,
            error: 0,
            conn_request: None,
            notification: None,
        };
        match self.api.send_session_message(&target, &ack).await {
            Ok(()) => tracing::debug!("push channel: auto-acked OFFER reqId {}", message.req_id),
            Err(e) => tracing::error!("push channel: auto-ack failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_window_between_ctrl_offer_and_established() {
        assert!(!auto_ack_window(SessionState::INIT));
        assert!(!auto_ack_window(SessionState::CUSTOMDATA1_RECEIVED));

        // Control OFFER received, control flow not yet punched: ack
        let state = SessionState::CUSTOMDATA1_RECEIVED | SessionState::CTRL_OFFER_RECEIVED;
        assert!(auto_ack_window(state));
        let state = state | SessionState::CTRL_OFFER_SENT | SessionState::CTRL_CONSOLE_ACCEPTED;
        assert!(auto_ack_window(state));

        // Control flow punched, waiting for the data OFFER: leave it alone
        let state = state | SessionState::CTRL_CLIENT_ACCEPTED | SessionState::CTRL_ESTABLISHED;
        assert!(!auto_ack_window(state));

        // Data OFFER received: ack until the end of the session
        let state = state | SessionState::DATA_OFFER_RECEIVED;
        assert!(auto_ack_window(state));
        let state = state | SessionState::DATA_ESTABLISHED;
        assert!(auto_ack_window(state));
    }
}
