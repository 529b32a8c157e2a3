//! Session state tracking.
//!
//! Negotiation progress is a set of milestone bits that only ever grows:
//! once a milestone is reached it is never un-reached within a session's
//! lifetime. The caller flow and the push reader both consult and advance the
//! mask, so it lives behind a watch channel that doubles as the broadcast
//! mechanism for waiters.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use crate::error::{PunchError, PunchResult};

/// Monotone bitmask of negotiation milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionState(u32);

impl SessionState {
    /// Freshly initialized, nothing reached yet
    pub const INIT: SessionState = SessionState(0);
    /// Push channel is open
    pub const WS_OPEN: SessionState = SessionState(1 << 0);
    /// Server acknowledged session creation
    pub const CREATED: SessionState = SessionState(1 << 1);
    /// Start was requested for a concrete console
    pub const STARTED: SessionState = SessionState(1 << 2);
    /// Our own member joined the session
    pub const CLIENT_JOINED: SessionState = SessionState(1 << 3);
    /// The start command was delivered
    pub const DATA_SENT: SessionState = SessionState(1 << 4);
    /// The console joined the session
    pub const CONSOLE_JOINED: SessionState = SessionState(1 << 5);
    /// The console delivered its 16-byte secret
    pub const CUSTOMDATA1_RECEIVED: SessionState = SessionState(1 << 6);
    /// Console OFFER for the control port arrived
    pub const CTRL_OFFER_RECEIVED: SessionState = SessionState(1 << 7);
    /// Our control-port OFFER went out
    pub const CTRL_OFFER_SENT: SessionState = SessionState(1 << 8);
    /// Console acknowledged our control-port OFFER
    pub const CTRL_CONSOLE_ACCEPTED: SessionState = SessionState(1 << 9);
    /// We sent our control-port ACCEPT
    pub const CTRL_CLIENT_ACCEPTED: SessionState = SessionState(1 << 10);
    /// Control flow is punched
    pub const CTRL_ESTABLISHED: SessionState = SessionState(1 << 11);
    /// Console OFFER for the data port arrived
    pub const DATA_OFFER_RECEIVED: SessionState = SessionState(1 << 12);
    /// Our data-port OFFER went out
    pub const DATA_OFFER_SENT: SessionState = SessionState(1 << 13);
    /// Console acknowledged our data-port OFFER
    pub const DATA_CONSOLE_ACCEPTED: SessionState = SessionState(1 << 14);
    /// We sent our data-port ACCEPT
    pub const DATA_CLIENT_ACCEPTED: SessionState = SessionState(1 << 15);
    /// Data flow is punched
    pub const DATA_ESTABLISHED: SessionState = SessionState(1 << 16);

    /// True when every bit of `other` is present.
    pub fn contains(self, other: SessionState) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when at least one bit of `other` is present.
    pub fn intersects(self, other: SessionState) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for SessionState {
    type Output = SessionState;

    fn bitor(self, rhs: SessionState) -> SessionState {
        SessionState(self.0 | rhs.0)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(SessionState, &str); 17] = [
            (SessionState::WS_OPEN, "WS_OPEN"),
            (SessionState::CREATED, "CREATED"),
            (SessionState::STARTED, "STARTED"),
            (SessionState::CLIENT_JOINED, "CLIENT_JOINED"),
            (SessionState::DATA_SENT, "DATA_SENT"),
            (SessionState::CONSOLE_JOINED, "CONSOLE_JOINED"),
            (SessionState::CUSTOMDATA1_RECEIVED, "CUSTOMDATA1_RECEIVED"),
            (SessionState::CTRL_OFFER_RECEIVED, "CTRL_OFFER_RECEIVED"),
            (SessionState::CTRL_OFFER_SENT, "CTRL_OFFER_SENT"),
            (SessionState::CTRL_CONSOLE_ACCEPTED, "CTRL_CONSOLE_ACCEPTED"),
            (SessionState::CTRL_CLIENT_ACCEPTED, "CTRL_CLIENT_ACCEPTED"),
            (SessionState::CTRL_ESTABLISHED, "CTRL_ESTABLISHED"),
            (SessionState::DATA_OFFER_RECEIVED, "DATA_OFFER_RECEIVED"),
            (SessionState::DATA_OFFER_SENT, "DATA_OFFER_SENT"),
            (SessionState::DATA_CONSOLE_ACCEPTED, "DATA_CONSOLE_ACCEPTED"),
            (SessionState::DATA_CLIENT_ACCEPTED, "DATA_CLIENT_ACCEPTED"),
            (SessionState::DATA_ESTABLISHED, "DATA_ESTABLISHED"),
        ];

        write!(f, "[")?;
        if *self == SessionState::INIT {
            write!(f, " INIT")?;
        }
        for (bit, name) in NAMES {
            if self.contains(bit) {
                write!(f, " {name}")?;
            }
        }
        write!(f, " ]")
    }
}

/// Shared, broadcast-on-change holder for the state mask.
pub struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    /// Creates a cell in the `INIT` state.
    pub fn new() -> Self {
        Self {
            tx: watch::channel(SessionState::INIT).0,
        }
    }

    /// ORs `bits` into the mask and wakes every waiter.
    ///
    /// Bits are never cleared; the mask only grows.
    pub fn set(&self, bits: SessionState) {
        self.tx.send_modify(|state| *state = *state | bits);
        tracing::debug!("session state: {}", self.snapshot());
    }

    /// Current mask.
    pub fn snapshot(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// True when every bit of `bits` has been reached.
    pub fn contains(&self, bits: SessionState) -> bool {
        self.snapshot().contains(bits)
    }

    /// Waits until every bit of `bits` is present, bounded by `budget`.
    ///
    /// Bits reached before the call count immediately.
    pub async fn wait_for(&self, bits: SessionState, budget: Duration) -> PunchResult<()> {
        let mut rx = self.tx.subscribe();
        let waited = timeout(budget, rx.wait_for(|state| state.contains(bits)))
            .await
            .map_err(|_| PunchError::Timeout)?;
        waited
            .map(|_| ())
            .map_err(|_| PunchError::Protocol("state channel closed".to_string()))
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_grows_monotonically() {
        let cell = StateCell::new();
        assert_eq!(cell.snapshot(), SessionState::INIT);

        cell.set(SessionState::WS_OPEN);
        cell.set(SessionState::CREATED);
        cell.set(SessionState::WS_OPEN); // setting twice is a no-op

        let state = cell.snapshot();
        assert!(state.contains(SessionState::WS_OPEN));
        assert!(state.contains(SessionState::CREATED));
        assert!(state.contains(SessionState::WS_OPEN | SessionState::CREATED));
        assert!(!state.contains(SessionState::STARTED));
    }

    #[test]
    fn intersects_matches_any_bit() {
        let state = SessionState::CTRL_OFFER_RECEIVED | SessionState::CTRL_OFFER_SENT;
        assert!(state.intersects(SessionState::CTRL_OFFER_RECEIVED));
        assert!(!state.intersects(SessionState::DATA_OFFER_RECEIVED));
    }

    #[test]
    fn display_lists_reached_milestones() {
        assert_eq!(format!("{}", SessionState::INIT), "[ INIT ]");
        let state = SessionState::WS_OPEN | SessionState::CTRL_ESTABLISHED;
        assert_eq!(format!("{state}"), "[ WS_OPEN CTRL_ESTABLISHED ]");
    }

    #[tokio::test]
    async fn wait_for_sees_prior_bits() {
        let cell = StateCell::new();
        cell.set(SessionState::WS_OPEN);
        cell.wait_for(SessionState::WS_OPEN, Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_wakes_on_set() {
        let cell = std::sync::Arc::new(StateCell::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move {
                cell.wait_for(SessionState::CREATED, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cell.set(SessionState::CREATED);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let cell = StateCell::new();
        let result = cell
            .wait_for(SessionState::DATA_ESTABLISHED, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(PunchError::Timeout)));
    }
}
