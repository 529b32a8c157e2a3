//! Internet Gateway Device discovery and control (SSDP + UPnP).
//!
//! Speaks just enough UPnP for hole punching: find the gateway with an SSDP
//! `M-SEARCH`, fetch its device description to locate the `WANIPConnection`
//! control endpoint, then issue the three SOAP actions the session layer
//! needs - `GetExternalIPAddress`, `AddPortMapping`, `DeletePortMapping`.
//!
//! Discovery uses the same socket for send and receive since gateways reply
//! unicast to the searching socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::{NetError, NetResult};

/// Standard SSDP multicast address and port.
const SSDP_MULTICAST_ADDR: &str = "239.255.255.250:1900";

/// Search target for internet gateways.
const IGD_SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

/// WAN connection service types, in preference order.
const WAN_SERVICE_TYPES: [&str; 2] = [
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:service:WANPPPConnection:1",
];

/// A discovered internet gateway with a usable WAN connection service.
pub struct Gateway {
    lan_ip: Ipv4Addr,
    control_url: String,
    service_type: String,
    http: reqwest::Client,
}

impl Gateway {
    /// Discovers a gateway on the local network.
    ///
    /// Sends an `M-SEARCH` for internet gateway devices and waits up to
    /// `budget` for a device whose description advertises a WAN connection
    /// service.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Timeout`] when no gateway answers within the
    /// budget and [`NetError::Upnp`] when a gateway answers but its
    /// description is unusable.
    pub async fn discover(budget: Duration) -> NetResult<Self> {
        let socket = ssdp_socket()?;
        let msearch = build_msearch(budget.as_secs().max(1));
        socket
            .send_to(msearch.as_bytes(), SSDP_MULTICAST_ADDR)
            .await?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| NetError::Upnp(format!("HTTP client: {e}")))?;

        let deadline = tokio::time::Instant::now() + budget;
        let mut buf = [0u8; 2048];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(NetError::Timeout);
            }
            let (len, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => return Err(NetError::Timeout),
            };

            let response = String::from_utf8_lossy(&buf[..len]);
            let Some(location) = parse_ssdp_location(&response) else {
                tracing::trace!("igd: ignoring SSDP response without LOCATION from {from}");
                continue;
            };

            match Self::from_description(&http, &location, from).await {
                Ok(gateway) => {
                    tracing::debug!(
                        "igd: using gateway at {} (control {})",
                        from,
                        gateway.control_url
                    );
                    return Ok(gateway);
                }
                Err(e) => {
                    tracing::debug!("igd: gateway at {from} unusable: {e}");
                    continue;
                }
            }
        }
    }

    /// Fetches a device description and extracts the WAN control endpoint.
    async fn from_description(
        http: &reqwest::Client,
        location: &str,
        gateway_addr: SocketAddr,
    ) -> NetResult<Self> {
        let description = http
            .get(location)
            .send()
            .await
            .map_err(|e| NetError::Upnp(format!("fetching {location}: {e}")))?
            .text()
            .await
            .map_err(|e| NetError::Upnp(format!("reading {location}: {e}")))?;

        let (service_type, control_path) = find_wan_service(&description)
            .ok_or_else(|| NetError::Upnp("description has no WAN connection service".into()))?;
        let control_url = resolve_control_url(location, &control_path)?;

        Ok(Self {
            lan_ip: lan_ip_toward(gateway_addr).await?,
            control_url,
            service_type,
            http: http.clone(),
        })
    }

    /// The LAN address this host uses to talk to the gateway.
    pub fn lan_ip(&self) -> Ipv4Addr {
        self.lan_ip
    }

    /// Queries the gateway's external (internet-visible) IPv4 address.
    pub async fn external_ip(&self) -> NetResult<Ipv4Addr> {
        let body = self.soap("GetExternalIPAddress", "").await?;
        let ip = extract_tag(&body, "NewExternalIPAddress")
            .ok_or_else(|| NetError::Upnp("no NewExternalIPAddress in response".into()))?;
        ip.parse()
            .map_err(|_| NetError::Upnp(format!("gateway returned bad external IP '{ip}'")))
    }

    /// Installs a UDP port mapping on the gateway.
    pub async fn add_udp_mapping(
        &self,
        internal: u16,
        external: u16,
        description: &str,
    ) -> NetResult<()> {
        let args = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{external}</NewExternalPort>\
             <NewProtocol>UDP</NewProtocol>\
             <NewInternalPort>{internal}</NewInternalPort>\
             <NewInternalClient>{}</NewInternalClient>\
             <NewEnabled>1</NewEnabled>\
             <NewPortMappingDescription>{description}</NewPortMappingDescription>\
             <NewLeaseDuration>0</NewLeaseDuration>",
            self.lan_ip
        );
        self.soap("AddPortMapping", &args).await?;
        tracing::debug!("igd: mapped UDP {external} -> {}:{internal}", self.lan_ip);
        Ok(())
    }

    /// Removes a UDP port mapping from the gateway.
    pub async fn delete_udp_mapping(&self, external: u16) -> NetResult<()> {
        let args = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{external}</NewExternalPort>\
             <NewProtocol>UDP</NewProtocol>"
        );
        self.soap("DeletePortMapping", &args).await?;
        tracing::debug!("igd: unmapped UDP {external}");
        Ok(())
    }

    /// Performs one SOAP action against the control endpoint.
    async fn soap(&self, action: &str, args: &str) -> NetResult<String> {
        let envelope = soap_envelope(&self.service_type, action, args);
        let response = self
            .http
            .post(&self.control_url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header(
                "SOAPAction",
                format!("\"{}#{}\"", self.service_type, action),
            )
            .body(envelope)
            .send()
            .await
            .map_err(|e| NetError::Upnp(format!("{action}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| NetError::Upnp(format!("{action}: reading response: {e}")))?;
        if !status.is_success() {
            return Err(NetError::Upnp(format!(
                "{action} failed with HTTP {status}: {body}"
            )));
        }
        Ok(body)
    }
}

/// UDP socket suitable for SSDP: reusable address, multicast TTL 4.
fn ssdp_socket() -> NetResult<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // UPnP 1.0 recommends TTL 4 for SSDP multicast
    socket.set_multicast_ttl_v4(4)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// The local address the kernel routes toward `gateway` from.
async fn lan_ip_toward(gateway: SocketAddr) -> NetResult<Ipv4Addr> {
    let probe = UdpSocket::bind("0.0.0.0:0").await?;
    probe.connect(gateway).await?;
    match probe.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(NetError::Upnp("gateway reached over IPv6".into())),
    }
}

fn build_msearch(mx: u64) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {mx}\r\n\
         ST: {IGD_SEARCH_TARGET}\r\n\r\n"
    )
}

/// Extracts the LOCATION header from an SSDP response.
fn parse_ssdp_location(response: &str) -> Option<String> {
    response
        .lines()
        .find(|line| {
            line.len() >= 9 && line.as_bytes()[..9].eq_ignore_ascii_case(b"location:")
        })
        .map(|line| line[9..].trim().to_string())
        .filter(|loc| !loc.is_empty())
}

/// Finds the first advertised WAN connection service and its control URL
/// inside a device description document.
fn find_wan_service(description: &str) -> Option<(String, String)> {
    for service_type in WAN_SERVICE_TYPES {
        let Some(type_pos) = description.find(service_type) else {
            continue;
        };
        // The controlURL element belongs to the same <service> block, which
        // lists serviceType first per the UPnP device template.
        let rest = &description[type_pos..];
        let control = extract_tag(rest, "controlURL")?;
        return Some((service_type.to_string(), control));
    }
    None
}

/// Joins a possibly-relative control path against the description URL.
fn resolve_control_url(location: &str, control_path: &str) -> NetResult<String> {
    if control_path.starts_with("http://") || control_path.starts_with("https://") {
        return Ok(control_path.to_string());
    }
    // Base is scheme://host:port from the LOCATION header
    let scheme_end = location
        .find("://")
        .ok_or_else(|| NetError::Upnp(format!("bad description URL '{location}'")))?;
    let host_end = location[scheme_end + 3..]
        .find('/')
        .map(|i| scheme_end + 3 + i)
        .unwrap_or(location.len());
    let base = &location[..host_end];
    if control_path.starts_with('/') {
        Ok(format!("{base}{control_path}"))
    } else {
        Ok(format!("{base}/{control_path}"))
    }
}

/// Returns the text content of the first `<tag>...</tag>` element.
fn extract_tag(document: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = document.find(&open)? + open.len();
    let end = document[start..].find(&close)? + start;
    Some(document[start..end].trim().to_string())
}

fn soap_envelope(service_type: &str, action: &str, args: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body><u:{action} xmlns:u=\"{service_type}\">{args}</u:{action}></s:Body>\
         </s:Envelope>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
        <controlURL>/l3f</controlURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
        <controlURL>/ctl/IPConn</controlURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    #[test]
    fn msearch_layout() {
        let msg = build_msearch(2);
        assert!(msg.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(msg.contains("HOST: 239.255.255.250:1900"));
        assert!(msg.contains("MX: 2"));
        assert!(msg.contains("ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1"));
        assert!(msg.ends_with("\r\n\r\n"));
    }

    #[test]
    fn ssdp_location_case_insensitive() {
        let response = "HTTP/1.1 200 OK\r\n\
                        CACHE-CONTROL: max-age=120\r\n\
                        location: http://192.168.1.1:5000/rootDesc.xml\r\n\
                        ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\r\n";
        assert_eq!(
            parse_ssdp_location(response).as_deref(),
            Some("http://192.168.1.1:5000/rootDesc.xml")
        );
    }

    #[test]
    fn ssdp_location_missing() {
        assert_eq!(parse_ssdp_location("HTTP/1.1 200 OK\r\n\r\n"), None);
    }

    #[test]
    fn wan_service_from_description() {
        let (service_type, control) = find_wan_service(DESCRIPTION).unwrap();
        assert_eq!(service_type, "urn:schemas-upnp-org:service:WANIPConnection:1");
        assert_eq!(control, "/ctl/IPConn");
    }

    #[test]
    fn wan_service_absent() {
        assert!(find_wan_service("<root></root>").is_none());
    }

    #[test]
    fn control_url_resolution() {
        assert_eq!(
            resolve_control_url("http://192.168.1.1:5000/rootDesc.xml", "/ctl/IPConn").unwrap(),
            "http://192.168.1.1:5000/ctl/IPConn"
        );
        assert_eq!(
            resolve_control_url("http://192.168.1.1:5000/rootDesc.xml", "ctl").unwrap(),
            "http://192.168.1.1:5000/ctl"
        );
        assert_eq!(
            resolve_control_url("http://a/b", "http://192.168.1.1/ctl").unwrap(),
            "http://192.168.1.1/ctl"
        );
    }

    #[test]
    fn soap_envelope_shape() {
        let envelope = soap_envelope(
            "urn:schemas-upnp-org:service:WANIPConnection:1",
            "GetExternalIPAddress",
            "",
        );
        assert!(envelope.contains(
            "<u:GetExternalIPAddress xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">"
        ));
        assert!(envelope.ends_with("</s:Body></s:Envelope>"));
    }

    #[test]
    fn external_ip_extraction() {
        let body = "<s:Envelope><s:Body><u:GetExternalIPAddressResponse>\
                    <NewExternalIPAddress>203.0.113.5</NewExternalIPAddress>\
                    </u:GetExternalIPAddressResponse></s:Body></s:Envelope>";
        assert_eq!(
            extract_tag(body, "NewExternalIPAddress").as_deref(),
            Some("203.0.113.5")
        );
    }
}
