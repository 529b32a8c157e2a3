//! Candidate probe protocol.
//!
//! After the OFFER exchange both peers hold each other's candidate lists and
//! race small binary request/response frames over UDP to find an endpoint
//! that actually forwards. Each candidate gets its own socket, connected to
//! the candidate endpoint so replies are pre-filtered by the kernel; the
//! first valid response elects a winner, with LAN-scope candidates preferred
//! over internet-scope ones.

use std::time::Duration;

use futures_util::future::select_all;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout};

use crate::error::{PunchError, PunchResult};
use crate::message::{Candidate, CandidateKind};

/// Probe frames are fixed-size.
pub const FRAME_LEN: usize = 88;

/// Request frame marker.
pub const MSG_TYPE_REQ: u32 = 6;

/// Response frame marker.
pub const MSG_TYPE_RESP: u32 = 7;

/// After a STATIC candidate answered, how much longer a LOCAL one may still
/// take the win before the STATIC winner is accepted.
const LOCAL_UPGRADE_GRACE: Duration = Duration::from_secs(1);

/// The identifiers echoed between the peers in probe frames.
#[derive(Debug, Clone)]
pub struct ProbeIdentity {
    /// Our 16-bit session id
    pub sid_local: u16,
    /// The console's 16-bit session id
    pub sid_console: u16,
    /// Our 20-byte hashed id
    pub hashed_id_local: [u8; 20],
    /// The console's 20-byte hashed id
    pub hashed_id_console: [u8; 20],
}

/// Builds an 88-byte big-endian probe request.
///
/// Layout: message type at 0x00, our hashed id at 0x04 and the console's at
/// 0x24 (each zero-padded to 32 bytes), the two session ids at 0x44/0x46,
/// the request id at 0x48, the remainder reserved as zero.
pub fn build_request(identity: &ProbeIdentity, request_id: u32) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0x00..0x04].copy_from_slice(&MSG_TYPE_REQ.to_be_bytes());
    frame[0x04..0x18].copy_from_slice(&identity.hashed_id_local);
    frame[0x24..0x38].copy_from_slice(&identity.hashed_id_console);
    frame[0x44..0x46].copy_from_slice(&identity.sid_local.to_be_bytes());
    frame[0x46..0x48].copy_from_slice(&identity.sid_console.to_be_bytes());
    frame[0x48..0x4C].copy_from_slice(&request_id.to_be_bytes());
    frame
}

/// Validates a probe response: exact length, response marker and the echoed
/// request id.
///
/// The sender identifiers at 0x04..0x48 and the tail at 0x4C are not
/// validated, matching observed console behavior.
pub fn parse_response(frame: &[u8], request_id: u32) -> PunchResult<()> {
    if frame.len() != FRAME_LEN {
        return Err(PunchError::Protocol(format!(
            "probe response of unexpected size {}",
            frame.len()
        )));
    }
    let msg_type = u32::from_be_bytes(frame[0x00..0x04].try_into().expect("sized slice"));
    if msg_type != MSG_TYPE_RESP {
        return Err(PunchError::Protocol(format!(
            "probe response of unexpected type {msg_type}"
        )));
    }
    let echoed = u32::from_be_bytes(frame[0x48..0x4C].try_into().expect("sized slice"));
    if echoed != request_id {
        return Err(PunchError::Protocol(format!(
            "probe response for unexpected request id {echoed} (want {request_id})"
        )));
    }
    Ok(())
}

/// Probes every candidate and returns the winning socket and candidate.
///
/// Opens one fresh socket per candidate, connects it, fires the request and
/// waits on all sockets under a single monotonic budget. A LOCAL candidate
/// wins immediately; a STATIC winner waits one more grace tick for a LOCAL
/// upgrade. Exactly one socket leaves this function; the rest are closed on
/// every path.
///
/// # Errors
///
/// [`PunchError::Timeout`] when nothing valid answered within the budget
/// (including the zero-candidate case, which waits out the full budget) and
/// [`PunchError::Protocol`] on an invalid response frame.
pub async fn check_candidates(
    identity: &ProbeIdentity,
    candidates: &[Candidate],
    budget: Duration,
) -> PunchResult<(UdpSocket, Candidate)> {
    let deadline = Instant::now() + budget;
    let request_id: u32 = rand::random();
    let request = build_request(identity, request_id);

    // (candidate index, connected socket) per probeable candidate
    let mut probes: Vec<(usize, UdpSocket)> = Vec::new();
    for (index, candidate) in candidates.iter().enumerate() {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!("probe: binding socket for {candidate} failed: {e}");
                continue;
            }
        };
        if let Err(e) = socket.connect((candidate.addr.as_str(), candidate.port)).await {
            tracing::warn!("probe: connecting to {candidate} failed: {e}");
            continue;
        }
        if let Err(e) = socket.send(&request).await {
            tracing::warn!("probe: sending request to {candidate} failed: {e}");
            continue;
        }
        tracing::debug!("probe: request sent to {candidate}");
        probes.push((index, socket));
    }

    if probes.is_empty() {
        // Nothing can answer; the budget still bounds the call
        tokio::time::sleep_until(deadline).await;
        tracing::error!("probe: no probeable candidates");
        return Err(PunchError::Timeout);
    }

    // Slot of the current winner within `probes`
    let mut winner: Option<usize> = None;
    loop {
        let wait_until = match winner {
            Some(_) => deadline.min(Instant::now() + LOCAL_UPGRADE_GRACE),
            None => deadline,
        };
        let remaining = wait_until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let receivers: Vec<_> = probes
            .iter()
            .enumerate()
            .map(|(slot, (_, socket))| {
                Box::pin(async move {
                    let mut buf = [0u8; 256];
                    let received = socket.recv(&mut buf).await;
                    (slot, received.map(|len| buf[..len].to_vec()))
                })
            })
            .collect();

        match timeout(remaining, select_all(receivers)).await {
            // Tick expired: accept a standing winner, or give up below
            Err(_) => break,
            Ok(((slot, received), _, _)) => {
                let candidate = &candidates[probes[slot].0];
                let frame = received
                    .map_err(|e| PunchError::Network(format!("probe recv from {candidate}: {e}")))?;
                parse_response(&frame, request_id).inspect_err(|e| {
                    tracing::error!("probe: invalid response from {candidate}: {e}");
                })?;

                tracing::debug!("probe: valid response from {candidate}");
                winner = Some(slot);
                if candidate.kind == CandidateKind::Local {
                    break;
                }
                // STATIC winner: keep listening one grace tick for a LOCAL
            }
        }
    }

    let Some(slot) = winner else {
        tracing::error!("probe: no candidate answered within the budget");
        return Err(PunchError::Timeout);
    };
    let (candidate_index, socket) = probes.swap_remove(slot);
    let elected = candidates[candidate_index].clone();
    tracing::debug!("probe: elected {elected}");
    Ok((socket, elected))
}
