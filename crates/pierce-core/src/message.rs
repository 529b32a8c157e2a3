//! Session-message sub-protocol codec.
//!
//! Session messages (OFFER / RESULT / ACCEPT / TERMINATE) travel as a string
//! payload of the form `ver=1.0, type=text, body={...}` inside push
//! notifications and HTTP envelopes. The official client does not emit valid
//! JSON: a connection request without a local peer address serializes as
//! `"localPeerAddr":,` (no value at all), and candidate lists carry a
//! trailing comma. The decoder patches both quirks before parsing; the
//! encoder reproduces them, building its output with string formatting
//! instead of a JSON serializer so the bytes match what consoles expect.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{PunchError, PunchResult};
use crate::notify::Notification;

/// Scope of a connection candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    /// LAN-scope endpoint
    Local,
    /// Internet-scope endpoint
    Static,
}

impl CandidateKind {
    fn as_str(self) -> &'static str {
        match self {
            CandidateKind::Local => "LOCAL",
            CandidateKind::Static => "STATIC",
        }
    }
}

impl std::fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reachable endpoint advertised by one of the peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Candidate scope
    pub kind: CandidateKind,
    /// IP literal
    pub addr: String,
    /// NAT-mapped IP literal, `0.0.0.0` when unknown
    pub mapped_addr: String,
    /// Port
    pub port: u16,
    /// NAT-mapped port, 0 when unknown
    pub mapped_port: u16,
}

impl Candidate {
    /// Candidate identity is the (kind, addr, port) triple; the mapped fields
    /// are advisory.
    pub fn same_endpoint(&self, other: &Candidate) -> bool {
        self.kind == other.kind && self.addr == other.addr && self.port == other.port
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}:{} (mapped {}:{})",
            self.kind, self.addr, self.port, self.mapped_addr, self.mapped_port
        )
    }
}

/// The local peer address block of a connection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeerAddr {
    /// Numeric account id
    pub account_id: u64,
    /// Platform marker; clients send `REMOTE_PLAY`
    pub platform: String,
}

/// Payload of an OFFER or ACCEPT session message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionRequest {
    /// Sender's session id
    pub sid: u32,
    /// Receiver's session id, 0 if unknown
    pub peer_sid: u32,
    /// 16-byte session key material
    pub skey: [u8; 16],
    /// NAT type code (0 or 2)
    pub nat_type: u8,
    /// Advertised candidates
    pub candidates: Vec<Candidate>,
    /// MAC of the sender's default route, all zero when unknown
    pub default_route_mac: [u8; 6],
    /// Sender's 20-byte hashed id
    pub local_hashed_id: [u8; 20],
    /// Optional local peer address block; absence reproduces the
    /// comma-without-value quirk on the wire
    pub local_peer_addr: Option<LocalPeerAddr>,
}

/// The four actions of the sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMessageAction {
    /// Unrecognized action string
    Unknown,
    /// Proposes candidates
    Offer,
    /// Acknowledges an OFFER by request id
    Result,
    /// Selects a candidate
    Accept,
    /// Ends the session
    Terminate,
}

impl SessionMessageAction {
    fn as_str(self) -> &'static str {
        match self {
            SessionMessageAction::Unknown => "UNKNOWN",
            SessionMessageAction::Offer => "OFFER",
            SessionMessageAction::Result => "RESULT",
            SessionMessageAction::Accept => "ACCEPT",
            SessionMessageAction::Terminate => "TERMINATE",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "OFFER" => SessionMessageAction::Offer,
            "RESULT" => SessionMessageAction::Result,
            "ACCEPT" => SessionMessageAction::Accept,
            "TERMINATE" => SessionMessageAction::Terminate,
            _ => SessionMessageAction::Unknown,
        }
    }

    const fn bit(self) -> u8 {
        match self {
            SessionMessageAction::Unknown => 0,
            SessionMessageAction::Offer => 1,
            SessionMessageAction::Result => 1 << 2,
            SessionMessageAction::Accept => 1 << 3,
            SessionMessageAction::Terminate => 1 << 4,
        }
    }
}

impl std::fmt::Display for SessionMessageAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of actions to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSet(u8);

impl ActionSet {
    /// True when `action` is a member. `Unknown` is a member of no set.
    pub fn contains(self, action: SessionMessageAction) -> bool {
        self.0 & action.bit() != 0
    }
}

impl From<SessionMessageAction> for ActionSet {
    fn from(action: SessionMessageAction) -> Self {
        ActionSet(action.bit())
    }
}

impl std::ops::BitOr for SessionMessageAction {
    type Output = ActionSet;

    fn bitor(self, rhs: SessionMessageAction) -> ActionSet {
        ActionSet(self.bit() | rhs.bit())
    }
}

/// One decoded session message.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    /// Message action
    pub action: SessionMessageAction,
    /// Request id this message carries or answers
    pub req_id: u16,
    /// Error code, 0 on success
    pub error: u16,
    /// Connection request, absent for plain acknowledgements
    pub conn_request: Option<ConnectionRequest>,
    /// Back-reference to the notification this message arrived in
    pub notification: Option<Arc<Notification>>,
}

// The notification back-reference is bookkeeping, not message identity.
impl PartialEq for SessionMessage {
    fn eq(&self, other: &Self) -> bool {
        self.action == other.action
            && self.req_id == other.req_id
            && self.error == other.error
            && self.conn_request == other.conn_request
    }
}

impl SessionMessage {
    /// Extracts the message body from a session-message notification.
    ///
    /// The payload string lives at `/body/data/sessionMessage/payload` and
    /// has the shape `ver=1.0, type=text, body={...}`; everything after
    /// `body=` is the (possibly malformed) body JSON.
    pub fn payload_body(notification_json: &serde_json::Value) -> PunchResult<String> {
        let payload = notification_json
            .pointer("/body/data/sessionMessage/payload")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PunchError::InvalidSchema(format!(
                    "notification has no session message payload string: {notification_json}"
                ))
            })?;

        let body_at = payload.find("body=").ok_or_else(|| {
            PunchError::InvalidSchema(format!("payload has no body: {payload}"))
        })?;
        Ok(payload[body_at + 5..].to_string())
    }

    /// Decodes a message body, patching the known wire quirks first.
    pub fn from_body(body: &str) -> PunchResult<SessionMessage> {
        let patched = patch_local_peer_addr(body);
        let patched = patch_trailing_commas(&patched);
        let json: serde_json::Value = serde_json::from_str(&patched).map_err(|e| {
            PunchError::InvalidSchema(format!("unparseable session message ({e}): {body}"))
        })?;

        let action = json
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| schema_error("action", &json))?;
        let req_id = parse_u16(&json, "reqId")?;
        let error = parse_u16(&json, "error")?;

        let conn_request_json = json
            .get("connRequest")
            .and_then(|v| v.as_object())
            .ok_or_else(|| schema_error("connRequest", &json))?;
        let conn_request = if conn_request_json.is_empty() {
            None
        } else {
            Some(parse_conn_request(conn_request_json, &json)?)
        };

        Ok(SessionMessage {
            action: SessionMessageAction::from_str(action),
            req_id,
            error,
            conn_request,
            notification: None,
        })
    }

    /// Decodes the message carried by a notification and keeps the
    /// back-reference.
    pub fn from_notification(notification: &Arc<Notification>) -> PunchResult<SessionMessage> {
        let body = Self::payload_body(&notification.json)?;
        let mut message = Self::from_body(&body)?;
        message.notification = Some(notification.clone());
        Ok(message)
    }

    /// Serializes the message body the way the official client does.
    ///
    /// This is deliberately not a JSON serializer: the output must be
    /// byte-compatible with the vendor client, malformations included.
    pub fn serialize(&self) -> String {
        let conn_request = match &self.conn_request {
            None => "{}".to_string(),
            Some(request) => serialize_conn_request(request),
        };
        format!(
            "{{\"action\":\"{}\",\"reqId\":{},\"error\":{},\"connRequest\":{}}}",
            self.action, self.req_id, self.error, conn_request
        )
    }
}

fn serialize_conn_request(request: &ConnectionRequest) -> String {
    let mut candidates = String::from("[");
    for candidate in &request.candidates {
        // Trailing comma after each candidate, as emitted by the official
        // client; peers tolerate it.
        candidates.push_str(&format!(
            "{{\"type\":\"{}\",\"addr\":\"{}\",\"mappedAddr\":\"{}\",\"port\":{},\"mappedPort\":{}}},",
            candidate.kind, candidate.addr, candidate.mapped_addr, candidate.port, candidate.mapped_port
        ));
    }
    candidates.push(']');

    let mac = if request.default_route_mac == [0u8; 6] {
        String::new()
    } else {
        format_mac(&request.default_route_mac)
    };

    // An absent local peer address leaves the value empty: `"localPeerAddr":,`
    // is invalid JSON but is what the peer expects.
    let local_peer_addr = match &request.local_peer_addr {
        Some(addr) => format!(
            "{{\"accountId\":\"{}\",\"platform\":\"{}\"}}",
            addr.account_id, addr.platform
        ),
        None => String::new(),
    };

    format!(
        "{{\"sid\":{},\"peerSid\":{},\"skey\":\"{}\",\"natType\":{},\
         \"candidate\":{},\"defaultRouteMacAddr\":\"{}\",\
         \"localPeerAddr\":{},\"localHashedId\":\"{}\"}}",
        request.sid,
        request.peer_sid,
        BASE64.encode(request.skey),
        request.nat_type,
        candidates,
        mac,
        local_peer_addr,
        BASE64.encode(request.local_hashed_id),
    )
}

/// Inserts `{}` after a value-less `"localPeerAddr":` so the body parses.
/// Only this key is patched.
fn patch_local_peer_addr(body: &str) -> String {
    const KEY: &str = "\"localPeerAddr\":";
    let Some(key_at) = body.find(KEY) else {
        return body.to_string();
    };
    let value_at = key_at + KEY.len();
    if body[value_at..].starts_with('{') {
        return body.to_string();
    }
    let mut patched = String::with_capacity(body.len() + 2);
    patched.push_str(&body[..value_at]);
    patched.push_str("{}");
    patched.push_str(&body[value_at..]);
    patched
}

/// Drops the trailing comma the official client leaves before `]`.
fn patch_trailing_commas(body: &str) -> String {
    body.replace(",]", "]")
}

fn schema_error(field: &str, json: &serde_json::Value) -> PunchError {
    PunchError::InvalidSchema(format!("session message missing or bad \"{field}\": {json}"))
}

fn parse_u16(json: &serde_json::Value, field: &str) -> PunchResult<u16> {
    json.get(field)
        .and_then(|v| v.as_u64())
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| schema_error(field, json))
}

fn parse_conn_request(
    object: &serde_json::Map<String, serde_json::Value>,
    root: &serde_json::Value,
) -> PunchResult<ConnectionRequest> {
    let sid = object
        .get("sid")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| schema_error("sid", root))?;
    let peer_sid = object
        .get("peerSid")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| schema_error("peerSid", root))?;

    let skey_str = object
        .get("skey")
        .and_then(|v| v.as_str())
        .ok_or_else(|| schema_error("skey", root))?;
    let skey: [u8; 16] = BASE64
        .decode(skey_str)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            PunchError::InvalidSchema(format!("skey is not 16 base64 bytes: '{skey_str}'"))
        })?;

    let nat_type = object
        .get("natType")
        .and_then(|v| v.as_u64())
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| schema_error("natType", root))?;

    let mac_str = object
        .get("defaultRouteMacAddr")
        .and_then(|v| v.as_str())
        .ok_or_else(|| schema_error("defaultRouteMacAddr", root))?;
    let default_route_mac = parse_mac(mac_str)
        .ok_or_else(|| PunchError::InvalidSchema(format!("bad MAC '{mac_str}'")))?;

    let hashed_id_str = object
        .get("localHashedId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| schema_error("localHashedId", root))?;
    let local_hashed_id: [u8; 20] = BASE64
        .decode(hashed_id_str)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            PunchError::InvalidSchema(format!(
                "localHashedId is not 20 base64 bytes: '{hashed_id_str}'"
            ))
        })?;

    let candidates_json = object
        .get("candidate")
        .and_then(|v| v.as_array())
        .ok_or_else(|| schema_error("candidate", root))?;
    let mut candidates = Vec::with_capacity(candidates_json.len());
    for candidate in candidates_json {
        candidates.push(parse_candidate(candidate)?);
    }

    let local_peer_addr = match object.get("localPeerAddr").and_then(|v| v.as_object()) {
        None => None,
        Some(addr) if addr.is_empty() => None,
        Some(addr) => Some(parse_local_peer_addr(addr, root)?),
    };

    Ok(ConnectionRequest {
        sid,
        peer_sid,
        skey,
        nat_type,
        candidates,
        default_route_mac,
        local_hashed_id,
        local_peer_addr,
    })
}

fn parse_candidate(json: &serde_json::Value) -> PunchResult<Candidate> {
    let kind = match json.get("type").and_then(|v| v.as_str()) {
        Some("LOCAL") => CandidateKind::Local,
        Some("STATIC") => CandidateKind::Static,
        _ => return Err(schema_error("candidate type", json)),
    };
    let addr = json
        .get("addr")
        .and_then(|v| v.as_str())
        .ok_or_else(|| schema_error("candidate addr", json))?
        .to_string();
    let mapped_addr = json
        .get("mappedAddr")
        .and_then(|v| v.as_str())
        .ok_or_else(|| schema_error("candidate mappedAddr", json))?
        .to_string();
    let port = parse_u16(json, "port")
        .map_err(|_| schema_error("candidate port", json))?;
    let mapped_port = parse_u16(json, "mappedPort")
        .map_err(|_| schema_error("candidate mappedPort", json))?;

    Ok(Candidate {
        kind,
        addr,
        mapped_addr,
        port,
        mapped_port,
    })
}

fn parse_local_peer_addr(
    object: &serde_json::Map<String, serde_json::Value>,
    root: &serde_json::Value,
) -> PunchResult<LocalPeerAddr> {
    let account_id = match object.get("accountId") {
        Some(serde_json::Value::String(s)) => s.parse::<u64>().ok(),
        Some(v) => v.as_u64(),
        None => None,
    }
    .ok_or_else(|| schema_error("localPeerAddr accountId", root))?;
    let platform = object
        .get("platform")
        .and_then(|v| v.as_str())
        .ok_or_else(|| schema_error("localPeerAddr platform", root))?
        .to_string();
    Ok(LocalPeerAddr {
        account_id,
        platform,
    })
}

/// Formats a MAC as colon-separated lowercase hex.
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Parses a MAC field: 17-char colon form, or empty meaning unknown.
fn parse_mac(s: &str) -> Option<[u8; 6]> {
    if s.is_empty() {
        return Some([0u8; 6]);
    }
    if s.len() != 17 {
        return None;
    }
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

/// Decodes the console's double-base64 `customData1` field into its 16-byte
/// secret. Both rounds must succeed and the inner round must yield exactly
/// 16 bytes.
pub fn decode_custom_data1(custom_data1: &str) -> PunchResult<[u8; 16]> {
    let round1 = BASE64.decode(custom_data1).map_err(|e| {
        PunchError::InvalidSchema(format!("customData1 outer decode failed: {e}"))
    })?;
    let round1_str = std::str::from_utf8(&round1).map_err(|_| {
        PunchError::InvalidSchema("customData1 inner value is not text".to_string())
    })?;
    let round2 = BASE64.decode(round1_str).map_err(|e| {
        PunchError::InvalidSchema(format!("customData1 inner decode failed: {e}"))
    })?;
    round2.try_into().map_err(|_| {
        PunchError::InvalidSchema("customData1 does not decode to 16 bytes".to_string())
    })
}
