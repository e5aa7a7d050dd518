//! Endpoint-local session state: packet-id allocation, retention of
//! unacknowledged outbound packets, and receiver-side QoS2 bookkeeping.

pub mod pid;
pub mod store;

use std::collections::BTreeSet;

use thiserror::Error;

pub use pid::PacketIdRegistry;
pub use store::{ExpectedAck, Store, StoreEntry};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("packet id space exhausted")]
    NoPacketId,
    #[error("packet id {0} already in use")]
    PacketIdConflict(u16),
    #[error("packet id must be non-zero")]
    ZeroPacketId,
}

/// Session state owned exclusively by one endpoint.
///
/// Created with the endpoint and carried across reconnects. A CONNACK with
/// `session_present == false` resets it; with `session_present == true` the
/// store is replayed instead.
#[derive(Debug)]
pub struct Session {
    /// Clean session (v3.1.1) / clean start (v5) request flag.
    pub clean_start: bool,
    pub pid: PacketIdRegistry,
    pub store: Store,
    /// QoS2 publishes received but not yet released by PUBREL. Membership
    /// suppresses duplicate handler delivery.
    pub recv_qos2: BTreeSet<u16>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            clean_start: true,
            pid: PacketIdRegistry::new(),
            store: Store::new(),
            recv_qos2: BTreeSet::new(),
        }
    }

    /// Discard all protocol state. Invoked when the broker reports no prior
    /// session.
    pub fn reset(&mut self) {
        self.pid.clear();
        self.store.clear();
        self.recv_qos2.clear();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
