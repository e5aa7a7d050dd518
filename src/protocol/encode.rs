//! Wire-format encoding: every packet serialises to the exact frame a
//! conformant parser re-reads.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::decode::MAX_REMAINING_LENGTH;
use super::packet::{Ack, Packet, ProtocolVersion, QoS};
use super::properties::encode_properties;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("packet id required for qos > 0 publish")]
    MissingPacketId,
    #[error("packet body of {0} bytes exceeds the maximum remaining length")]
    PacketTooLarge(usize),
    #[error("AUTH requires MQTT 5")]
    AuthRequiresV5,
}

pub(crate) fn put_vbi(out: &mut BytesMut, mut value: u32) {
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

pub(crate) fn put_str(out: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= usize::from(u16::MAX));
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

pub(crate) fn put_binary(out: &mut BytesMut, b: &[u8]) {
    debug_assert!(b.len() <= usize::from(u16::MAX));
    out.put_u16(b.len() as u16);
    out.put_slice(b);
}

/// Serialise a packet into one owned frame.
pub fn encode_packet(packet: &Packet, version: ProtocolVersion) -> Result<Bytes, EncodeError> {
    let mut body = BytesMut::new();
    let first = match packet {
        Packet::Connect(c) => {
            put_str(&mut body, "MQTT");
            body.put_u8(version.level());
            let mut flags = 0u8;
            if c.clean_start {
                flags |= 0x02;
            }
            if let Some(will) = &c.will {
                flags |= 0x04 | (will.qos.bits() << 3);
                if will.retain {
                    flags |= 0x20;
                }
            }
            if c.password.is_some() {
                flags |= 0x40;
            }
            if c.username.is_some() {
                flags |= 0x80;
            }
            body.put_u8(flags);
            body.put_u16(c.keep_alive);
            if version.is_v5() {
                encode_properties(&c.properties, &mut body);
            }
            put_str(&mut body, &c.client_id);
            if let Some(will) = &c.will {
                if version.is_v5() {
                    encode_properties(&will.properties, &mut body);
                }
                put_str(&mut body, &will.topic);
                put_binary(&mut body, &will.payload);
            }
            if let Some(username) = &c.username {
                put_str(&mut body, username);
            }
            if let Some(password) = &c.password {
                put_binary(&mut body, password);
            }
            0x10
        }
        Packet::ConnAck(c) => {
            body.put_u8(u8::from(c.session_present));
            body.put_u8(c.code);
            if version.is_v5() {
                encode_properties(&c.properties, &mut body);
            }
            0x20
        }
        Packet::Publish(p) => {
            put_binary(&mut body, &p.topic);
            if p.qos != QoS::AtMostOnce {
                let packet_id = p.packet_id.ok_or(EncodeError::MissingPacketId)?;
                body.put_u16(packet_id);
            }
            if version.is_v5() {
                encode_properties(&p.properties, &mut body);
            }
            body.put_slice(&p.payload);
            let dup_bit = u8::from(p.dup && p.qos != QoS::AtMostOnce);
            0x30 | dup_bit << 3 | p.qos.bits() << 1 | u8::from(p.retain)
        }
        Packet::PubAck(a) => encode_ack(a, version, &mut body, 0x40),
        Packet::PubRec(a) => encode_ack(a, version, &mut body, 0x50),
        Packet::PubRel(a) => encode_ack(a, version, &mut body, 0x62),
        Packet::PubComp(a) => encode_ack(a, version, &mut body, 0x70),
        Packet::Subscribe(s) => {
            body.put_u16(s.packet_id);
            if version.is_v5() {
                encode_properties(&s.properties, &mut body);
            }
            for entry in &s.filters {
                put_str(&mut body, &entry.filter);
                let mut opts = entry.qos.bits();
                if version.is_v5() {
                    opts |= u8::from(entry.no_local) << 2;
                    opts |= u8::from(entry.retain_as_published) << 3;
                    opts |= (entry.retain_handling & 0x03) << 4;
                }
                body.put_u8(opts);
            }
            0x82
        }
        Packet::SubAck(s) => {
            body.put_u16(s.packet_id);
            if version.is_v5() {
                encode_properties(&s.properties, &mut body);
            }
            body.put_slice(&s.return_codes);
            0x90
        }
        Packet::Unsubscribe(u) => {
            body.put_u16(u.packet_id);
            if version.is_v5() {
                encode_properties(&u.properties, &mut body);
            }
            for filter in &u.filters {
                put_str(&mut body, filter);
            }
            0xA2
        }
        Packet::UnsubAck(u) => {
            body.put_u16(u.packet_id);
            if version.is_v5() {
                encode_properties(&u.properties, &mut body);
                body.put_slice(&u.reason_codes);
            }
            0xB0
        }
        Packet::PingReq => 0xC0,
        Packet::PingResp => 0xD0,
        Packet::Disconnect(d) => {
            if version.is_v5() && (d.reason_code != 0 || !d.properties.is_empty()) {
                body.put_u8(d.reason_code);
                encode_properties(&d.properties, &mut body);
            }
            0xE0
        }
        Packet::Auth(a) => {
            if !version.is_v5() {
                return Err(EncodeError::AuthRequiresV5);
            }
            if a.reason_code != 0 || !a.properties.is_empty() {
                body.put_u8(a.reason_code);
                encode_properties(&a.properties, &mut body);
            }
            0xF0
        }
    };

    if body.len() > MAX_REMAINING_LENGTH as usize {
        return Err(EncodeError::PacketTooLarge(body.len()));
    }
    let mut frame = BytesMut::with_capacity(body.len() + 5);
    frame.put_u8(first);
    put_vbi(&mut frame, body.len() as u32);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Acks share one layout; v5 appends reason + properties unless both are
/// defaulted, in which case the two-byte short form goes out.
fn encode_ack(ack: &Ack, version: ProtocolVersion, body: &mut BytesMut, first: u8) -> u8 {
    body.put_u16(ack.packet_id);
    if version.is_v5() && (ack.reason_code != 0 || !ack.properties.is_empty()) {
        body.put_u8(ack.reason_code);
        encode_properties(&ack.properties, body);
    }
    first
}
