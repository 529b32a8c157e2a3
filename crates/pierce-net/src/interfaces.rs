//! Local interface enumeration and ARP lookups.
//!
//! The LAN-scope candidate address is the first usable IPv4 address on the
//! host. IPv6 interfaces are skipped outright: the candidate exchange only
//! carries IPv4 literals.

use std::net::Ipv4Addr;

use network_interface::{NetworkInterface, NetworkInterfaceConfig};

use crate::{NetError, NetResult};

/// Returns the first usable IPv4 address of this host.
///
/// An interface qualifies when it carries an IPv4 address that is neither
/// loopback, link-local nor unspecified. Interfaces that are administratively
/// down expose no address through the OS tables, so address presence stands
/// in for the up flag.
///
/// # Errors
///
/// Returns [`NetError::Network`] when no interface qualifies.
pub fn local_ipv4() -> NetResult<Ipv4Addr> {
    let interfaces = NetworkInterface::show()
        .map_err(|e| NetError::Network(format!("interface enumeration failed: {e}")))?;

    for iface in &interfaces {
        for addr in &iface.addr {
            let ip = match addr.ip() {
                std::net::IpAddr::V4(ip) => ip,
                std::net::IpAddr::V6(_) => continue,
            };
            if ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() {
                continue;
            }
            tracing::debug!("local_ipv4: using {} on {}", ip, iface.name);
            return Ok(ip);
        }
    }

    Err(NetError::Network(
        "no usable IPv4 interface found".to_string(),
    ))
}

/// Resolves the MAC address associated with the route toward `ip`.
///
/// Scans the system ARP table first; when the address has no ARP entry (the
/// usual case for the host's own LAN address) the MAC of the interface that
/// owns `ip` is returned instead.
///
/// # Errors
///
/// Returns [`NetError::Network`] when neither source yields a MAC.
pub fn default_route_mac(ip: Ipv4Addr) -> NetResult<[u8; 6]> {
    #[cfg(target_os = "linux")]
    if let Some(mac) = arp_table_lookup(ip) {
        return Ok(mac);
    }

    owning_interface_mac(ip)
}

/// Looks up `ip` in `/proc/net/arp`. `None` when the table has no usable
/// entry or cannot be read.
#[cfg(target_os = "linux")]
fn arp_table_lookup(ip: Ipv4Addr) -> Option<[u8; 6]> {
    let table = match std::fs::read_to_string("/proc/net/arp") {
        Ok(table) => table,
        Err(e) => {
            tracing::debug!("default_route_mac: reading ARP table failed: {e}");
            return None;
        }
    };

    let needle = ip.to_string();
    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (Some(entry_ip), Some(_hw_type), Some(_flags), Some(hw_addr)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if entry_ip == needle {
            return parse_mac(hw_addr);
        }
    }
    None
}

/// Returns the MAC of the interface that carries `ip`.
fn owning_interface_mac(ip: Ipv4Addr) -> NetResult<[u8; 6]> {
    let interfaces = NetworkInterface::show()
        .map_err(|e| NetError::Network(format!("interface enumeration failed: {e}")))?;

    for iface in &interfaces {
        let owns = iface
            .addr
            .iter()
            .any(|a| a.ip() == std::net::IpAddr::V4(ip));
        if !owns {
            continue;
        }
        if let Some(mac) = iface.mac_addr.as_deref().and_then(parse_mac) {
            return Ok(mac);
        }
    }

    Err(NetError::Network(format!("no MAC known for route to {ip}")))
}

/// Parses a colon-separated MAC string. Rejects the all-zero placeholder the
/// kernel prints for incomplete entries.
fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() || mac == [0u8; 6] {
        return None;
    }
    Some(mac)
}
