//! Session configuration.

use std::time::Duration;

/// Tunables for a negotiation session.
///
/// The defaults target the production PSN endpoints; tests point the base
/// URLs at local mock servers instead.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the web API host (session manager, commands, device list)
    pub web_api_base: String,

    /// Base URL of the mobile push host (server-address lookup)
    pub push_api_base: String,

    /// STUN server used as external-address fallback
    pub stun_server: String,

    /// Budget for each bounded notification / session-message wait
    pub notification_budget: Duration,

    /// Budget for the whole candidate probe
    pub probe_budget: Duration,

    /// Push-channel heartbeat interval; a missing pong within one further
    /// interval kills the channel
    pub ping_interval: Duration,

    /// SSDP gateway discovery budget
    pub ssdp_budget: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            web_api_base: "https://web.np.playstation.com".to_string(),
            push_api_base: "https://mobile-pushcl.np.communication.playstation.net".to_string(),
            stun_server: "stun.l.google.com:19302".to_string(),
            notification_budget: Duration::from_secs(30),
            probe_budget: Duration::from_secs(30),
            ping_interval: Duration::from_secs(5),
            ssdp_budget: Duration::from_secs(2),
        }
    }
}
