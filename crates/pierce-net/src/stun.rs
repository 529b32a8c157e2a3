//! Minimal STUN client (RFC 5389 Binding Request).
//!
//! Used as the fallback external-address probe when no UPnP gateway answers
//! or the gateway refuses `GetExternalIPAddress`. Only the small slice of
//! STUN needed for that - a single Binding Request and the
//! XOR-MAPPED-ADDRESS / MAPPED-ADDRESS attributes of the response - is
//! implemented.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::{NetError, NetResult};

/// STUN magic cookie (RFC 5389 Section 6).
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Binding Request message type.
const BINDING_REQUEST: u16 = 0x0001;

/// Binding Success Response message type.
const BINDING_SUCCESS: u16 = 0x0101;

/// XOR-MAPPED-ADDRESS attribute.
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// MAPPED-ADDRESS attribute (pre-RFC-5389 servers).
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;

/// How long to wait for the Binding Success Response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Queries `server` (a `host:port` string) for this host's NAT-mapped
/// external address.
///
/// # Errors
///
/// Returns [`NetError::Stun`] on a malformed response, [`NetError::Timeout`]
/// when the server stays silent and [`NetError::Io`] on socket failures.
pub async fn external_address(server: &str) -> NetResult<(Ipv4Addr, u16)> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server).await?;

    let (request, transaction_id) = build_binding_request();
    socket.send(&request).await?;

    let mut response = [0u8; 512];
    let len = timeout(RESPONSE_TIMEOUT, socket.recv(&mut response))
        .await
        .map_err(|_| NetError::Timeout)??;

    let mapped = parse_binding_response(&response[..len], &transaction_id)?;
    tracing::debug!("stun: {} mapped us to {}:{}", server, mapped.0, mapped.1);
    Ok(mapped)
}

/// Builds a Binding Request with a random transaction id.
fn build_binding_request() -> ([u8; 20], [u8; 12]) {
    let txn_id: [u8; 12] = rand::random();

    let mut request = [0u8; 20];
    request[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Length stays zero: no attributes
    request[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    request[8..20].copy_from_slice(&txn_id);

    (request, txn_id)
}

/// Extracts the mapped IPv4 address from a Binding Success Response.
fn parse_binding_response(response: &[u8], txn_id: &[u8; 12]) -> NetResult<(Ipv4Addr, u16)> {
    if response.len() < 20 {
        return Err(NetError::Stun("response shorter than header".into()));
    }

    let msg_type = u16::from_be_bytes([response[0], response[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(NetError::Stun(format!(
            "unexpected message type {msg_type:#06x}"
        )));
    }
    if &response[8..20] != txn_id {
        return Err(NetError::Stun("transaction id mismatch".into()));
    }

    let attr_len = u16::from_be_bytes([response[2], response[3]]) as usize;
    let end = (20 + attr_len).min(response.len());
    let mut pos = 20;

    while pos + 4 <= end {
        let attr_type = u16::from_be_bytes([response[pos], response[pos + 1]]);
        let value_len = u16::from_be_bytes([response[pos + 2], response[pos + 3]]) as usize;
        pos += 4;
        if pos + value_len > end {
            break;
        }

        // Both address attributes share the layout: reserved byte, family,
        // port, address. Family 0x01 is IPv4.
        if attr_type == ATTR_XOR_MAPPED_ADDRESS && value_len >= 8 && response[pos + 1] == 0x01 {
            let port = u16::from_be_bytes([response[pos + 2], response[pos + 3]]) ^ 0x2112;
            let ip = Ipv4Addr::new(
                response[pos + 4] ^ 0x21,
                response[pos + 5] ^ 0x12,
                response[pos + 6] ^ 0xA4,
                response[pos + 7] ^ 0x42,
            );
            return Ok((ip, port));
        }
        if attr_type == ATTR_MAPPED_ADDRESS && value_len >= 8 && response[pos + 1] == 0x01 {
            let port = u16::from_be_bytes([response[pos + 2], response[pos + 3]]);
            let ip = Ipv4Addr::new(
                response[pos + 4],
                response[pos + 5],
                response[pos + 6],
                response[pos + 7],
            );
            return Ok((ip, port));
        }

        // Attributes are padded to 4-byte boundaries
        pos += (value_len + 3) & !3;
    }

    Err(NetError::Stun("no mapped address in response".into()))
}
