//! Full control-flow negotiation against a scripted stand-in for the cloud
//! service and the console.
//!
//! The mock serves the REST endpoints over plain HTTP, pushes notifications
//! over a plain websocket and answers candidate probes over UDP, walking the
//! client through create -> start -> punch_hole(ctrl).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use pierce_core::state::SessionState;
use pierce_core::{ConsoleKind, PortKind, Session, SessionConfig};

const SESSION_ID: &str = "123e4567-e89b-42d3-a456-426614174000";
const ACCOUNT_ID: u64 = 1234567890;
const CONSOLE_SID: u32 = 4242;
const SECRET: [u8; 16] = *b"sixteen byte key";

struct MockPsn {
    ws_tx: mpsc::UnboundedSender<String>,
    console_duid: String,
    console_udp_port: u16,
    dead_udp_port: u16,
    // Session-message bodies posted by the client, in order
    messages: Mutex<Vec<String>>,
}

fn notification(data_type: &str, body: serde_json::Value) -> String {
    serde_json::json!({
        "dataType": data_type,
        "body": body,
    })
    .to_string()
}

/// Double-base64 of the console secret, as the server delivers it.
fn custom_data1() -> String {
    BASE64.encode(BASE64.encode(SECRET).as_bytes())
}

fn console_offer_body(mock: &MockPsn) -> String {
    // Valid-JSON-except-localPeerAddr, exactly as consoles send it
    format!(
        "{{\"action\":\"OFFER\",\"reqId\":42,\"error\":0,\"connRequest\":{{\
         \"sid\":{CONSOLE_SID},\"peerSid\":0,\"skey\":\"{}\",\"natType\":2,\
         \"candidate\":[\
         {{\"type\":\"LOCAL\",\"addr\":\"127.0.0.1\",\"mappedAddr\":\"0.0.0.0\",\"port\":{},\"mappedPort\":0}},\
         {{\"type\":\"STATIC\",\"addr\":\"127.0.0.1\",\"mappedAddr\":\"0.0.0.0\",\"port\":{},\"mappedPort\":0}}],\
         \"defaultRouteMacAddr\":\"\",\"localPeerAddr\":,\"localHashedId\":\"{}\"}}}}",
        BASE64.encode([3u8; 16]),
        mock.console_udp_port,
        mock.dead_udp_port,
        BASE64.encode([4u8; 20]),
    )
}

fn session_message_notification(body: &str) -> String {
    notification(
        "psn:sessionManager:sys:rps:sessionMessage:created",
        serde_json::json!({
            "data": {"sessionMessage": {"payload": format!("ver=1.0, type=text, body={body}")}}
        }),
    )
}

impl MockPsn {
    /// Routes one HTTP request and drives the push choreography.
    fn handle(&self, method: &str, path: &str, body: &str, ws_host: &str) -> String {
        match (method, path) {
            ("GET", p) if p.starts_with("/np/serveraddr") => {
                format!("{{\"fqdn\":\"{ws_host}\"}}")
            }
            ("POST", "/api/sessionManager/v1/remotePlaySessions") => {
                self.push(notification(
                    "psn:sessionManager:sys:remotePlaySession:created",
                    serde_json::json!({}),
                ));
                self.push(notification(
                    "psn:sessionManager:sys:rps:members:created",
                    serde_json::json!({"data": {"members": [{"deviceUniqueId": "00".repeat(32)}]}}),
                ));
                format!(
                    "{{\"remotePlaySessions\":[{{\"sessionId\":\"{SESSION_ID}\",\
                     \"members\":[{{\"accountId\":\"{ACCOUNT_ID}\"}}]}}]}}"
                )
            }
            ("POST", "/api/cloudAssistedNavigation/v2/users/me/commands") => {
                self.push(notification(
                    "psn:sessionManager:sys:rps:members:created",
                    serde_json::json!({"data": {"members": [{"deviceUniqueId": self.console_duid}]}}),
                ));
                self.push(notification(
                    "psn:sessionManager:sys:rps:customData1:updated",
                    serde_json::json!({"data": {"customData1": custom_data1()}}),
                ));
                // The console opens the control-port exchange right away
                self.push(session_message_notification(&console_offer_body(self)));
                "{}".to_string()
            }
            ("POST", p) if p.contains("/sessionMessage") => {
                self.messages.lock().unwrap().push(body.to_string());
                if body.contains("\\\"action\\\":\\\"OFFER\\\"") {
                    self.push(session_message_notification(
                        "{\"action\":\"RESULT\",\"reqId\":1,\"error\":0,\"connRequest\":{}}",
                    ));
                }
                if body.contains("\\\"action\\\":\\\"ACCEPT\\\"") {
                    self.push(session_message_notification(
                        "{\"action\":\"ACCEPT\",\"reqId\":2,\"error\":0,\"connRequest\":{}}",
                    ));
                }
                "{}".to_string()
            }
            other => panic!("mock got unexpected request {other:?}"),
        }
    }

    fn push(&self, frame: String) {
        self.ws_tx.send(frame).expect("push channel mock gone");
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<(String, String, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };

        let header = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let content_length = header
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);

        let mut body = buf[header_end + 4..].to_vec();
        while body.len() < content_length {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }

        let mut request_line = header.lines().next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let path = request_line.next()?.to_string();
        return Some((method, path, String::from_utf8_lossy(&body).to_string()));
    }
}

async fn write_response(stream: &mut TcpStream, body: &str) {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json; charset=utf-8\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Answers STUN binding requests with the XOR-mapped source address.
async fn spawn_stun_mock() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            if len < 20 {
                continue;
            }
            let ip = match from.ip() {
                std::net::IpAddr::V4(ip) => ip.octets(),
                std::net::IpAddr::V6(_) => continue,
            };
            let xport = from.port() ^ 0x2112;
            let mut response = Vec::new();
            response.extend_from_slice(&0x0101u16.to_be_bytes());
            response.extend_from_slice(&12u16.to_be_bytes());
            response.extend_from_slice(&0x2112_A442u32.to_be_bytes());
            response.extend_from_slice(&buf[8..20]);
            response.extend_from_slice(&[0x00, 0x20, 0x00, 0x08, 0x00, 0x01]);
            response.extend_from_slice(&xport.to_be_bytes());
            response.extend_from_slice(&[
                ip[0] ^ 0x21,
                ip[1] ^ 0x12,
                ip[2] ^ 0xA4,
                ip[3] ^ 0x42,
            ]);
            let _ = socket.send_to(&response, from).await;
        }
    });
    port
}

/// The console side of the probe protocol: answers every valid request.
async fn spawn_console_probe_responder() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 256];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            if len != 88 || buf[0x03] != 6 {
                continue;
            }
            let mut response = [0u8; 88];
            response[0x03] = 7;
            response[0x48..0x4C].copy_from_slice(&buf[0x48..0x4C]);
            let _ = socket.send_to(&response, from).await;
        }
    });
    port
}

#[tokio::test]
async fn full_control_flow_negotiation() {
    // The offer path needs a real non-loopback interface; skip where the
    // environment has none.
    if pierce_net::interfaces::local_ipv4().is_err() {
        eprintln!("skipping: no usable network interface");
        return;
    }

    let console_duid = "ab".repeat(32);
    let device_uid = [0xab; 32];

    let stun_port = spawn_stun_mock().await;
    let console_udp_port = spawn_console_probe_responder().await;
    let dead_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead_udp_port = dead_socket.local_addr().unwrap().port();

    // Push channel endpoint
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_host = format!("127.0.0.1:{}", ws_listener.local_addr().unwrap().port());
    let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let (stream, _) = ws_listener.accept().await.unwrap();
        let mut channel = tokio_tungstenite::accept_async(stream).await.unwrap();
        loop {
            tokio::select! {
                frame = channel.next() => match frame {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    // Pings are answered automatically during polling
                    Some(Ok(_)) => {}
                },
                outgoing = ws_rx.recv() => match outgoing {
                    Some(text) => channel.send(Message::Text(text)).await.unwrap(),
                    None => break,
                },
            }
        }
    });

    let mock = Arc::new(MockPsn {
        ws_tx,
        console_duid: console_duid.clone(),
        console_udp_port,
        dead_udp_port,
        messages: Mutex::new(Vec::new()),
    });

    // REST endpoint
    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_port = http_listener.local_addr().unwrap().port();
    {
        let mock = mock.clone();
        let ws_host = ws_host.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = http_listener.accept().await else {
                    break;
                };
                let mock = mock.clone();
                let ws_host = ws_host.clone();
                tokio::spawn(async move {
                    if let Some((method, path, body)) = read_request(&mut stream).await {
                        let response = mock.handle(&method, &path, &body, &ws_host);
                        write_response(&mut stream, &response).await;
                    }
                });
            }
        });
    }

    let config = SessionConfig {
        web_api_base: format!("http://127.0.0.1:{http_port}"),
        push_api_base: format!("http://127.0.0.1:{http_port}"),
        stun_server: format!("127.0.0.1:{stun_port}"),
        notification_budget: Duration::from_secs(10),
        probe_budget: Duration::from_secs(5),
        ping_interval: Duration::from_secs(5),
        ssdp_budget: Duration::from_millis(50),
    };

    let mut session = Session::init("TOKEN_A", config).unwrap();

    session.create().await.unwrap();
    assert_eq!(session.session_id(), SESSION_ID);
    assert!(
        session
            .state()
            .contains(SessionState::WS_OPEN | SessionState::CREATED | SessionState::CLIENT_JOINED)
    );

    session.start(device_uid, ConsoleKind::Ps5).await.unwrap();
    assert!(session.state().contains(
        SessionState::STARTED
            | SessionState::DATA_SENT
            | SessionState::CONSOLE_JOINED
            | SessionState::CUSTOMDATA1_RECEIVED
    ));
    assert_eq!(session.custom_data1(), &SECRET);

    let ctrl = session.punch_hole(PortKind::Ctrl).await.unwrap();
    assert!(session.state().contains(
        SessionState::CTRL_OFFER_RECEIVED
            | SessionState::CTRL_OFFER_SENT
            | SessionState::CTRL_CONSOLE_ACCEPTED
            | SessionState::CTRL_CLIENT_ACCEPTED
            | SessionState::CTRL_ESTABLISHED
    ));

    // The returned socket is bound and connected to a candidate from the
    // console's OFFER (the LOCAL one wins over the dead STATIC one)
    assert_ne!(ctrl.local_addr().unwrap().port(), 0);
    let peer = ctrl.peer_addr().unwrap();
    assert_eq!(peer.ip().to_string(), "127.0.0.1");
    assert_eq!(peer.port(), console_udp_port);

    // Message sequence: RESULT acking the console's 42, our OFFER with
    // reqId 1, our ACCEPT with reqId 2 electing the LOCAL candidate
    let messages = mock.messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 3);
    assert!(messages[0].contains("\\\"action\\\":\\\"RESULT\\\""));
    assert!(messages[0].contains("\\\"reqId\\\":42"));
    assert!(messages[1].contains("\\\"action\\\":\\\"OFFER\\\""));
    assert!(messages[1].contains("\\\"reqId\\\":1"));
    assert!(messages[2].contains("\\\"action\\\":\\\"ACCEPT\\\""));
    assert!(messages[2].contains("\\\"reqId\\\":2"));
    assert!(messages[2].contains("\\\"natType\\\":0"));
    assert!(messages[2].contains("\\\"type\\\":\\\"LOCAL\\\""));

    session.fini().await;
}
