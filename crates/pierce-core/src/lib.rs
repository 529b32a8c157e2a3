//! PIERCE core - session negotiation and UDP hole punching for PlayStation
//! remote play.
//!
//! A console behind NAT cannot be contacted directly; both it and the client
//! authenticate to the vendor cloud and exchange signalling through it. This
//! crate drives that exchange to completion and punches two directly-routable
//! UDP flows (control and data) using the exchanged candidate endpoints.
//!
//! # Flow
//!
//! ```no_run
//! use pierce_core::{ConsoleKind, PortKind, Session, SessionConfig};
//!
//! # async fn example(token: &str, device_uid: [u8; 32]) -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = Session::init(token, SessionConfig::default())?;
//! session.create().await?;
//! session.start(device_uid, ConsoleKind::Ps5).await?;
//! let ctrl = session.punch_hole(PortKind::Ctrl).await?;
//! let data = session.punch_hole(PortKind::Data).await?;
//! // Hand ctrl/data to the media protocol, then:
//! session.fini().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`session`] - the orchestrator driving the three negotiation phases
//! - [`push`] - push notification channel with heartbeat and auto-ack
//! - [`notify`] - notification classification and queueing
//! - [`message`] - session-message codec, wire quirks included
//! - [`http`] - REST side of the signalling transport
//! - [`probe`] - the candidate probe protocol
//! - [`devices`] - device enumeration and client identity

pub mod config;
pub mod devices;
pub mod error;
pub mod http;
pub mod message;
pub mod notify;
pub mod probe;
pub mod session;
pub mod state;
pub mod types;

mod push;

pub use config::SessionConfig;
pub use devices::{generate_client_device_uid, list_devices};
pub use error::{PunchError, PunchResult};
pub use session::Session;
pub use state::SessionState;
pub use types::{ConsoleKind, DeviceInfo, PortKind};
