//! Network reachability probing for PIERCE.
//!
//! A client that wants to be reached by a console behind NAT has to learn how
//! it is visible from the outside before it can advertise connection
//! candidates. This crate composes three techniques:
//!
//! - [`interfaces`] - enumerate local interfaces for the LAN-scope address and
//!   resolve the default-route MAC from the system ARP table
//! - [`igd`] - discover an Internet Gateway Device over SSDP and query/modify
//!   it over its UPnP control endpoint (external IP, UDP port mappings)
//! - [`stun`] - learn the NAT-mapped external address from a STUN server when
//!   no gateway answers or the gateway refuses the query
//!
//! The preference order (gateway first, STUN as fallback) is applied by the
//! session layer; every prober here reports its own failure and leaves the
//! fallback decision to the caller.

pub mod igd;
pub mod interfaces;
pub mod stun;

use thiserror::Error;

/// Errors produced by the reachability probers.
#[derive(Debug, Error)]
pub enum NetError {
    /// Socket-level failure (bind, send, recv)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interface enumeration, ARP lookup or address resolution failed
    #[error("Network probing failed: {0}")]
    Network(String),

    /// Gateway spoke something other than the expected UPnP dialect
    #[error("UPnP error: {0}")]
    Upnp(String),

    /// STUN response was missing or malformed
    #[error("STUN error: {0}")]
    Stun(String),

    /// A bounded wait expired
    #[error("Operation timed out")]
    Timeout,
}

/// Result type for prober operations.
pub type NetResult<T> = Result<T, NetError>;
