//! Session orchestrator.
//!
//! Drives one remote-play connection attempt end to end: create the session
//! on the server, start it for a concrete console, then punch one UDP hole
//! per port kind by exchanging OFFER/RESULT/ACCEPT messages and probing the
//! console's candidates. One orchestrator per token at a time; a failed
//! attempt leaves its milestone bits set and the session must be discarded.

use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;

use pierce_net::igd::Gateway;
use pierce_net::{interfaces, stun};

use crate::config::SessionConfig;
use crate::error::{PunchError, PunchResult};
use crate::http::{ApiClient, ConsoleTarget};
use crate::message::{
    ActionSet, Candidate, CandidateKind, ConnectionRequest, LocalPeerAddr, SessionMessage,
    SessionMessageAction, decode_custom_data1,
};
use crate::notify::{NotificationKind, NotificationQueue};
use crate::probe::{self, ProbeIdentity};
use crate::push::{self, PushHandle, PushReader};
use crate::state::{SessionState, StateCell};
use crate::types::{ConsoleKind, PortKind};

/// Request id of our own OFFER.
const OFFER_REQ_ID: u16 = 1;

/// Request id of our ACCEPT.
const ACCEPT_REQ_ID: u16 = 2;

/// One remote-play negotiation attempt.
pub struct Session {
    config: Arc<SessionConfig>,
    api: ApiClient,
    state: Arc<StateCell>,
    queue: Arc<NotificationQueue>,
    target: Arc<RwLock<Option<ConsoleTarget>>>,

    pushctx_id: String,
    sid_local: u16,
    hashed_id_local: [u8; 20],
    data1: [u8; 16],
    data2: [u8; 16],

    session_id: String,
    account_id: u64,
    sid_console: u16,
    hashed_id_console: [u8; 20],
    custom_data1: [u8; 16],

    push: Option<PushHandle>,
    // Sockets advertised in our OFFERs; the console keeps probing them, so
    // they stay bound until teardown.
    advertised: Vec<UdpSocket>,
    // Gateway mappings to remove on teardown
    mappings: Vec<(Gateway, u16)>,
}

impl Session {
    /// Builds a session from an OAuth2 bearer token.
    ///
    /// Draws the local signalling identity (session id, hashed id, data
    /// blobs, push context UUID) from the OS random source.
    pub fn init(token: &str, config: SessionConfig) -> PunchResult<Session> {
        let config = Arc::new(config);
        let api = ApiClient::new(token, config.clone())?;
        let session = Session {
            config,
            api,
            state: Arc::new(StateCell::new()),
            queue: Arc::new(NotificationQueue::new()),
            target: Arc::new(RwLock::new(None)),
            pushctx_id: uuid::Uuid::new_v4().to_string(),
            sid_local: rand::random(),
            hashed_id_local: rand::random(),
            data1: rand::random(),
            data2: rand::random(),
            session_id: String::new(),
            account_id: 0,
            sid_console: 0,
            hashed_id_console: [0u8; 20],
            custom_data1: [0u8; 16],
            push: None,
            advertised: Vec::new(),
            mappings: Vec::new(),
        };
        tracing::debug!(
            "session initialized, push context {}, state {}",
            session.pushctx_id,
            session.state.snapshot()
        );
        Ok(session)
    }

    /// Current milestone mask.
    pub fn state(&self) -> SessionState {
        self.state.snapshot()
    }

    /// Server-assigned session UUID, empty before [`Session::create`].
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The console's 16-byte secret, delivered during [`Session::start`] and
    /// consumed by the downstream media protocol.
    pub fn custom_data1(&self) -> &[u8; 16] {
        &self.custom_data1
    }

    /// Phase 1: create the session on the server.
    ///
    /// Resolves the notification server, opens the push channel, posts the
    /// creation request and waits for both the session-created and our own
    /// member-joined notification under one budget.
    pub async fn create(&mut self) -> PunchResult<()> {
        let fqdn = self.api.fetch_push_fqdn().await?;
        tracing::debug!("create: notification server is {fqdn}");

        // The channel scheme follows the API host scheme so that plain-HTTP
        // deployments (tests) get a plain websocket.
        let scheme = if self.config.push_api_base.starts_with("http://") {
            "ws"
        } else {
            "wss"
        };
        self.push = Some(push::spawn(PushReader {
            url: format!("{scheme}://{fqdn}/np/pushNotification"),
            queue: self.queue.clone(),
            state: self.state.clone(),
            api: self.api.clone(),
            target: self.target.clone(),
            ping_interval: self.config.ping_interval,
        }));
        self.state
            .wait_for(SessionState::WS_OPEN, self.config.notification_budget)
            .await?;

        let (session_id, account_id) = self.api.create_session(&self.pushctx_id).await?;
        self.session_id = session_id;
        self.account_id = account_id;
        tracing::debug!("create: session {} for account {}", self.session_id, self.account_id);

        let deadline = Instant::now() + self.config.notification_budget;
        let wanted = SessionState::CREATED | SessionState::CLIENT_JOINED;
        while !self.state.contains(wanted) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let notification = self
                .queue
                .wait(
                    NotificationKind::SessionCreated | NotificationKind::MemberCreated,
                    remaining,
                )
                .await?;
            match notification.kind {
                NotificationKind::SessionCreated => {
                    self.state.set(SessionState::CREATED);
                    tracing::debug!("create: session created");
                }
                NotificationKind::MemberCreated => {
                    self.state.set(SessionState::CLIENT_JOINED);
                    tracing::debug!("create: client joined");
                }
                other => {
                    return Err(PunchError::Protocol(format!(
                        "unexpected notification {other:?} while creating the session"
                    )));
                }
            }
            self.queue.clear(&notification);
        }
        Ok(())
    }

    /// Phase 2: start the session for a concrete console.
    ///
    /// Posts the start command and waits for the console to join and deliver
    /// its `customData1` secret under one budget.
    pub async fn start(
        &mut self,
        device_uid: [u8; 32],
        console_kind: ConsoleKind,
    ) -> PunchResult<()> {
        if !self.state.contains(SessionState::CREATED) {
            return Err(PunchError::Uninitialized("session not created yet"));
        }
        if self.state.contains(SessionState::STARTED) {
            return Err(PunchError::Uninitialized("session already started"));
        }
        self.state.set(SessionState::STARTED);
        tracing::debug!(
            "start: session {} for device {}",
            self.session_id,
            hex::encode(device_uid)
        );

        let target = ConsoleTarget {
            session_id: self.session_id.clone(),
            account_id: self.account_id,
            console_uid: device_uid,
            console_kind,
        };
        *self.target.write().expect("console target lock poisoned") = Some(target.clone());

        self.api
            .start_session(&target, &self.data1, &self.data2)
            .await?;
        self.state.set(SessionState::DATA_SENT);

        let deadline = Instant::now() + self.config.notification_budget;
        let wanted = SessionState::CONSOLE_JOINED | SessionState::CUSTOMDATA1_RECEIVED;
        while !self.state.contains(wanted) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let notification = self
                .queue
                .wait(
                    NotificationKind::MemberCreated | NotificationKind::CustomData1Updated,
                    remaining,
                )
                .await?;
            match notification.kind {
                NotificationKind::MemberCreated => {
                    let member_duid = notification
                        .json
                        .pointer("/body/data/members/0/deviceUniqueId")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            PunchError::InvalidSchema(format!(
                                "member notification without deviceUniqueId: {}",
                                notification.raw
                            ))
                        })?;
                    let member_uid: [u8; 32] = hex::decode(member_duid)
                        .ok()
                        .and_then(|bytes| bytes.try_into().ok())
                        .ok_or_else(|| {
                            PunchError::InvalidSchema(format!(
                                "deviceUniqueId is not 32 hex bytes: '{member_duid}'"
                            ))
                        })?;
                    if member_uid != device_uid {
                        return Err(PunchError::Protocol(
                            "session does not contain our console".to_string(),
                        ));
                    }
                    self.state.set(SessionState::CONSOLE_JOINED);
                    tracing::debug!("start: console joined");
                }
                NotificationKind::CustomData1Updated => {
                    let value = notification
                        .json
                        .pointer("/body/data/customData1")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            PunchError::InvalidSchema(format!(
                                "notification without customData1 string: {}",
                                notification.raw
                            ))
                        })?;
                    if value.len() != 32 {
                        return Err(PunchError::InvalidSchema(format!(
                            "customData1 has unexpected length {}, expected 32",
                            value.len()
                        )));
                    }
                    self.custom_data1 = decode_custom_data1(value)?;
                    self.state.set(SessionState::CUSTOMDATA1_RECEIVED);
                    tracing::debug!("start: customData1 received");
                }
                other => {
                    return Err(PunchError::Protocol(format!(
                        "unexpected notification {other:?} while starting the session"
                    )));
                }
            }
            self.queue.clear(&notification);
        }
        Ok(())
    }

    /// Phase 3: punch one UDP hole toward the console.
    ///
    /// Runs the OFFER/RESULT/ACCEPT exchange for the given port kind, probes
    /// the console's candidates and returns the winning socket, connected to
    /// the elected endpoint.
    pub async fn punch_hole(&mut self, port_kind: PortKind) -> PunchResult<UdpSocket> {
        match port_kind {
            PortKind::Ctrl if !self.state.contains(SessionState::CUSTOMDATA1_RECEIVED) => {
                return Err(PunchError::Uninitialized("customData1 not received yet"));
            }
            PortKind::Data if !self.state.contains(SessionState::CTRL_ESTABLISHED) => {
                return Err(PunchError::Uninitialized("control flow not punched yet"));
            }
            _ => {}
        }
        let budget = self.config.notification_budget;

        // 1. The console opens with an OFFER carrying its candidates.
        let console_offer = self
            .wait_for_session_message(SessionMessageAction::Offer.into(), budget)
            .await?;
        let console_request = console_offer.conn_request.as_ref().ok_or_else(|| {
            PunchError::Protocol("console OFFER without a connection request".to_string())
        })?;
        self.hashed_id_console = console_request.local_hashed_id;
        self.sid_console = console_request.sid as u16;
        self.state.set(match port_kind {
            PortKind::Ctrl => SessionState::CTRL_OFFER_RECEIVED,
            PortKind::Data => SessionState::DATA_OFFER_RECEIVED,
        });
        log_connection_request("console OFFER", console_request);

        // 2. Acknowledge it.
        self.send_message(&SessionMessage {
            action: SessionMessageAction::Result,
            req_id: console_offer.req_id,
            error: 0,
            conn_request: None,
            notification: None,
        })
        .await?;

        // 3. Send our own OFFER with our candidates.
        self.send_offer(OFFER_REQ_ID).await?;
        self.state.set(match port_kind {
            PortKind::Ctrl => SessionState::CTRL_OFFER_SENT,
            PortKind::Data => SessionState::DATA_OFFER_SENT,
        });

        // 4. Wait for the console to acknowledge it.
        self.wait_for_session_message_ack(OFFER_REQ_ID, budget)
            .await?;
        self.state.set(match port_kind {
            PortKind::Ctrl => SessionState::CTRL_CONSOLE_ACCEPTED,
            PortKind::Data => SessionState::DATA_CONSOLE_ACCEPTED,
        });

        // 5. Probe the console's candidates for a reachable endpoint.
        let identity = ProbeIdentity {
            sid_local: self.sid_local,
            sid_console: self.sid_console,
            hashed_id_local: self.hashed_id_local,
            hashed_id_console: self.hashed_id_console,
        };
        let (socket, winner) = probe::check_candidates(
            &identity,
            &console_request.candidates,
            self.config.probe_budget,
        )
        .await
        .inspect_err(|_| {
            tracing::error!("punch_hole: no reachable candidate for the {port_kind} flow");
        })?;

        // 6. Tell the console which candidate won.
        self.send_message(&SessionMessage {
            action: SessionMessageAction::Accept,
            req_id: ACCEPT_REQ_ID,
            error: 0,
            conn_request: Some(ConnectionRequest {
                sid: self.sid_local as u32,
                peer_sid: self.sid_console as u32,
                nat_type: if winner.kind == CandidateKind::Local { 0 } else { 2 },
                candidates: vec![winner],
                local_peer_addr: Some(LocalPeerAddr {
                    account_id: self.account_id,
                    platform: "REMOTE_PLAY".to_string(),
                }),
                ..Default::default()
            }),
            notification: None,
        })
        .await?;
        self.state.set(match port_kind {
            PortKind::Ctrl => SessionState::CTRL_CLIENT_ACCEPTED,
            PortKind::Data => SessionState::DATA_CLIENT_ACCEPTED,
        });

        // 7. The console's ACCEPT seals the flow.
        self.wait_for_session_message(SessionMessageAction::Accept.into(), budget)
            .await?;
        self.state.set(match port_kind {
            PortKind::Ctrl => SessionState::CTRL_ESTABLISHED,
            PortKind::Data => SessionState::DATA_ESTABLISHED,
        });
        tracing::debug!("punch_hole: {port_kind} flow established");

        Ok(socket)
    }

    /// Tears the session down: stops the push reader, removes installed
    /// gateway mappings and drains the queue.
    pub async fn fini(mut self) {
        if let Some(push) = self.push.take() {
            push.shutdown().await;
        }
        for (gateway, port) in self.mappings.drain(..) {
            if let Err(e) = gateway.delete_udp_mapping(port).await {
                tracing::warn!("fini: removing UDP mapping for port {port} failed: {e}");
            }
        }
        // The console has nothing left to probe; release the advertised ports
        self.advertised.clear();
        self.queue.drain();
        tracing::debug!("session torn down");
    }

    /// Posts a session message to the console.
    async fn send_message(&self, message: &SessionMessage) -> PunchResult<()> {
        let target = {
            let guard = self.target.read().expect("console target lock poisoned");
            guard.clone()
        }
        .ok_or(PunchError::Uninitialized("session not started yet"))?;
        self.api.send_session_message(&target, message).await
    }

    /// Binds the advertised socket, gathers reachability and sends our OFFER.
    async fn send_offer(&mut self, req_id: u16) -> PunchResult<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let local_port = socket.local_addr()?.port();

        let (local_ip, static_ip) = self.gather_reachability(local_port).await?;
        let mac = match interfaces::default_route_mac(local_ip) {
            Ok(mac) => mac,
            Err(e) => {
                tracing::warn!("send_offer: no default-route MAC ({e}), sending zeroes");
                [0u8; 6]
            }
        };

        let request = ConnectionRequest {
            sid: self.sid_local as u32,
            peer_sid: 0,
            skey: [0u8; 16],
            nat_type: 2,
            candidates: vec![
                Candidate {
                    kind: CandidateKind::Local,
                    addr: local_ip.to_string(),
                    mapped_addr: "0.0.0.0".to_string(),
                    port: local_port,
                    mapped_port: 0,
                },
                Candidate {
                    kind: CandidateKind::Static,
                    addr: static_ip.to_string(),
                    mapped_addr: "0.0.0.0".to_string(),
                    port: local_port,
                    mapped_port: 0,
                },
            ],
            default_route_mac: mac,
            local_hashed_id: self.hashed_id_local,
            local_peer_addr: Some(LocalPeerAddr {
                account_id: self.account_id,
                platform: "REMOTE_PLAY".to_string(),
            }),
        };
        log_connection_request("our OFFER", &request);

        self.send_message(&SessionMessage {
            action: SessionMessageAction::Offer,
            req_id,
            error: 0,
            conn_request: Some(request),
            notification: None,
        })
        .await?;
        self.advertised.push(socket);
        Ok(())
    }

    /// Discovers how this host is reachable: LAN address plus external
    /// address, gateway first, STUN as fallback.
    async fn gather_reachability(&mut self, local_port: u16) -> PunchResult<(Ipv4Addr, Ipv4Addr)> {
        match Gateway::discover(self.config.ssdp_budget).await {
            Ok(gateway) => {
                let lan_ip = gateway.lan_ip();
                let external = match gateway.external_ip().await {
                    Ok(ip) => Some(ip),
                    Err(e) => {
                        tracing::debug!("gateway denied external address query: {e}");
                        None
                    }
                };
                match gateway
                    .add_udp_mapping(local_port, local_port, "PIERCE UDP holepunch")
                    .await
                {
                    Ok(()) => self.mappings.push((gateway, local_port)),
                    Err(e) => tracing::warn!("installing UDP mapping failed: {e}"),
                }
                let external = match external {
                    Some(ip) => ip,
                    None => self.stun_external().await?,
                };
                Ok((lan_ip, external))
            }
            Err(e) => {
                tracing::debug!("no usable gateway ({e}), using interfaces + STUN");
                let lan_ip = interfaces::local_ipv4()?;
                let external = self.stun_external().await?;
                Ok((lan_ip, external))
            }
        }
    }

    async fn stun_external(&self) -> PunchResult<Ipv4Addr> {
        match stun::external_address(&self.config.stun_server).await {
            Ok((ip, _port)) => Ok(ip),
            Err(e) => {
                tracing::error!("send_offer: could not determine external address: {e}");
                Err(PunchError::Protocol(
                    "no external address available".to_string(),
                ))
            }
        }
    }

    /// Waits for the next session message with one of the given actions,
    /// discarding others. The budget spans the whole wait.
    async fn wait_for_session_message(
        &self,
        actions: ActionSet,
        budget: Duration,
    ) -> PunchResult<SessionMessage> {
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let notification = self
                .queue
                .wait(NotificationKind::SessionMessageCreated, remaining)
                .await
                .inspect_err(|_| {
                    tracing::error!("timed out waiting for a session message");
                })?;
            self.queue.clear(&notification);
            let message = SessionMessage::from_notification(&notification)?;
            if !actions.contains(message.action) {
                tracing::debug!("ignoring session message with action {}", message.action);
                continue;
            }
            return Ok(message);
        }
    }

    /// Waits for the RESULT acknowledging `req_id`, discarding others.
    async fn wait_for_session_message_ack(&self, req_id: u16, budget: Duration) -> PunchResult<()> {
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = self
                .wait_for_session_message(SessionMessageAction::Result.into(), remaining)
                .await?;
            if message.req_id != req_id {
                tracing::warn!("got ACK for unexpected request id {}", message.req_id);
                continue;
            }
            if message.error != 0 {
                tracing::warn!("OFFER was acknowledged with error {}", message.error);
            }
            return Ok(());
        }
    }
}

fn log_connection_request(label: &str, request: &ConnectionRequest) {
    tracing::debug!(
        "{label}: sid={} peerSid={} natType={} mac={} candidates={}",
        request.sid,
        request.peer_sid,
        request.nat_type,
        crate::message::format_mac(&request.default_route_mac),
        request.candidates.len(),
    );
    for candidate in &request.candidates {
        tracing::debug!("{label}: candidate {candidate}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::init("TOKEN_A", SessionConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn init_draws_a_fresh_identity() {
        let a = session();
        let b = session();
        assert_ne!(a.pushctx_id, b.pushctx_id);
        assert_ne!(a.hashed_id_local, b.hashed_id_local);
        assert_ne!(a.data1, a.data2);

        // Push context is a well-formed UUIDv4
        assert_eq!(a.pushctx_id.len(), 36);
        assert_eq!(a.pushctx_id.as_bytes()[14], b'4');

        assert_eq!(a.state(), SessionState::INIT);
        assert_eq!(a.session_id(), "");
    }

    #[tokio::test]
    async fn start_requires_create() {
        let mut session = session();
        let result = session.start([0u8; 32], ConsoleKind::Ps5).await;
        assert!(matches!(result, Err(PunchError::Uninitialized(_))));
    }

    #[tokio::test]
    async fn start_rejects_a_second_start() {
        let mut session = session();
        session.state.set(SessionState::CREATED | SessionState::STARTED);
        let result = session.start([0u8; 32], ConsoleKind::Ps5).await;
        assert!(matches!(result, Err(PunchError::Uninitialized(_))));
    }

    #[tokio::test]
    async fn punch_hole_requires_its_preconditions() {
        let mut session = session();
        let result = session.punch_hole(PortKind::Ctrl).await;
        assert!(matches!(result, Err(PunchError::Uninitialized(_))));

        let result = session.punch_hole(PortKind::Data).await;
        assert!(matches!(result, Err(PunchError::Uninitialized(_))));
    }

    #[tokio::test]
    async fn send_message_requires_a_started_session() {
        let session = session();
        let message = SessionMessage {
            action: SessionMessageAction::Result,
            req_id: 1,
            error: 0,
            conn_request: None,
            notification: None,
        };
        let result = session.send_message(&message).await;
        assert!(matches!(result, Err(PunchError::Uninitialized(_))));
    }
}
