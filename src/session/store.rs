use std::time::Instant;

use crate::protocol::{Ack, Packet};

use super::SessionError;

/// The acknowledgement that will retire a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedAck {
    PubAck,
    PubRec,
    PubComp,
}

#[derive(Debug, Clone)]
pub struct StoreEntry {
    pub packet_id: u16,
    pub expect: ExpectedAck,
    pub packet: Packet,
    pub sent_at: Instant,
}

/// Ordered retention of outbound packets awaiting acknowledgement.
///
/// Insertion order is replay order. At most one entry exists per packet id.
#[derive(Debug, Default)]
pub struct Store {
    entries: Vec<StoreEntry>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        packet_id: u16,
        expect: ExpectedAck,
        packet: Packet,
        sent_at: Instant,
    ) -> Result<(), SessionError> {
        if self.entries.iter().any(|e| e.packet_id == packet_id) {
            return Err(SessionError::PacketIdConflict(packet_id));
        }
        self.entries.push(StoreEntry {
            packet_id,
            expect,
            packet,
            sent_at,
        });
        Ok(())
    }

    pub fn expected(&self, packet_id: u16) -> Option<ExpectedAck> {
        self.entries
            .iter()
            .find(|e| e.packet_id == packet_id)
            .map(|e| e.expect)
    }

    /// PUBREC receipt: the stored PUBLISH becomes a PUBREL awaiting PUBCOMP,
    /// in place, preserving replay order. Returns false when no QoS2 publish
    /// with this id is pending.
    pub fn on_pubrec(&mut self, packet_id: u16) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.packet_id == packet_id && e.expect == ExpectedAck::PubRec)
        {
            Some(entry) => {
                entry.packet = Packet::PubRel(Ack::new(packet_id));
                entry.expect = ExpectedAck::PubComp;
                true
            }
            None => false,
        }
    }

    /// Retire the entry matched by the received acknowledgement.
    pub fn remove(&mut self, packet_id: u16, expect: ExpectedAck) -> Option<StoreEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.packet_id == packet_id && e.expect == expect)?;
        Some(self.entries.remove(idx))
    }

    /// Packets to re-send after a reconnect with a preserved session, in
    /// insertion order. PUBLISH entries go out with DUP set and their
    /// original ids; entries already advanced to PUBREL go out as PUBREL.
    pub fn replay_packets(&self) -> Vec<Packet> {
        self.entries
            .iter()
            .map(|entry| match &entry.packet {
                Packet::Publish(publish) => {
                    let mut publish = publish.clone();
                    publish.dup = true;
                    Packet::Publish(publish)
                }
                other => other.clone(),
            })
            .collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StoreEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
