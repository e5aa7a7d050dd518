//! Wire-format decoding: fixed header, variable-byte integers, and the
//! per-packet body parsers.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::buffer::Buffer;
use crate::core::config::Will;

use super::packet::{
    Ack, Auth, ConnAck, Connect, Disconnect, Packet, ProtocolVersion, Publish, QoS, SubAck,
    Subscribe, SubscribeFilter, UnsubAck, Unsubscribe,
};
use super::properties::{decode_properties, Properties};

/// Largest representable remaining length (four VBI bytes).
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated packet")]
    Truncated,
    #[error("malformed variable byte integer")]
    MalformedVarInt,
    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),
    #[error("reserved fixed-header flags 0x{flags:02x} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    #[error("reserved qos value 3")]
    InvalidQos,
    #[error("dup flag set on qos 0 publish")]
    DupOnQos0,
    #[error("packet id must be non-zero")]
    ZeroPacketId,
    #[error("unexpected trailing bytes")]
    TrailingBytes,
    #[error("invalid protocol name")]
    InvalidProtocolName,
    #[error("unsupported protocol level {0}")]
    UnsupportedProtocolLevel(u8),
    #[error("invalid connect flags 0x{0:02x}")]
    InvalidConnectFlags(u8),
    #[error("reserved connack flags 0x{0:02x}")]
    InvalidConnAckFlags(u8),
    #[error("reserved subscription option bits 0x{0:02x}")]
    ReservedSubscriptionOpts(u8),
    #[error("invalid retain handling value {0}")]
    InvalidRetainHandling(u8),
    #[error("unknown property identifier 0x{0:02x}")]
    UnknownProperty(u8),
    #[error("property 0x{0:02x} must not repeat")]
    DuplicateProperty(u8),
    #[error("property section length mismatch")]
    PropertyLengthMismatch,
    #[error("empty reason code list")]
    EmptyReasonCodes,
    #[error("empty topic filter list")]
    EmptyFilters,
    #[error("AUTH requires MQTT 5")]
    AuthRequiresV5,
}

impl DecodeError {
    /// Errors that count as protocol violations rather than malformed
    /// packets; the distinction picks the v5 DISCONNECT reason code.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateProperty(_) | Self::EmptyReasonCodes | Self::EmptyFilters
        )
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("transport read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Cursor over a packet body. Binary values and the publish payload come out
/// as zero-copy [`Buffer`] slices of the body allocation.
pub(crate) struct Reader {
    buf: Bytes,
    pos: usize,
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn total_len(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn expect_end(&self) -> Result<(), DecodeError> {
        if self.remaining() != 0 {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        if self.remaining() < 1 {
            return Err(DecodeError::Truncated);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        if self.remaining() < 2 {
            return Err(DecodeError::Truncated);
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        if self.remaining() < 4 {
            return Err(DecodeError::Truncated);
        }
        let v = u32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    /// Variable byte integer: 1-4 bytes, 7 bits each.
    pub fn vbi(&mut self) -> Result<u32, DecodeError> {
        let mut value = 0u32;
        for i in 0..4 {
            let byte = self.u8()?;
            value |= u32::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DecodeError::MalformedVarInt)
    }

    fn take(&mut self, len: usize) -> Result<Bytes, DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Truncated);
        }
        let out = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    /// Length-prefixed UTF-8 string, copied out.
    pub fn utf8(&mut self) -> Result<String, DecodeError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(&raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Length-prefixed UTF-8 string as a zero-copy buffer slice.
    pub fn utf8_buf(&mut self) -> Result<Buffer, DecodeError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        if std::str::from_utf8(&raw).is_err() {
            return Err(DecodeError::InvalidUtf8);
        }
        Ok(Buffer::from(raw))
    }

    /// Length-prefixed binary data as a zero-copy buffer slice.
    pub fn binary(&mut self) -> Result<Buffer, DecodeError> {
        let len = self.u16()? as usize;
        Ok(Buffer::from(self.take(len)?))
    }

    pub fn binary_vec(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Everything left in the body.
    pub fn rest(&mut self) -> Buffer {
        let out = self.buf.slice(self.pos..);
        self.pos = self.buf.len();
        Buffer::from(out)
    }
}

/// Read one control packet from the stream: fixed header byte, VBI remaining
/// length, body, then a full body parse.
pub async fn read_packet<S>(stream: &mut S, version: ProtocolVersion) -> Result<Packet, ReadError>
where
    S: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;
    let remaining_len = read_remaining_length(stream).await?;
    let mut body = vec![0u8; remaining_len as usize];
    stream.read_exact(&mut body).await?;
    Ok(decode_packet(first[0], Bytes::from(body), version)?)
}

async fn read_remaining_length<S>(stream: &mut S) -> Result<u32, ReadError>
where
    S: AsyncRead + Unpin,
{
    let mut value = 0u32;
    for i in 0..4 {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        value |= u32::from(byte[0] & 0x7F) << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(DecodeError::MalformedVarInt.into())
}

/// Parse a packet body given the fixed-header control byte.
pub fn decode_packet(
    first: u8,
    body: Bytes,
    version: ProtocolVersion,
) -> Result<Packet, DecodeError> {
    let packet_type = first >> 4;
    let flags = first & 0x0F;
    validate_flags(packet_type, flags)?;

    let mut reader = Reader::new(body);
    let packet = match packet_type {
        1 => Packet::Connect(parse_connect(&mut reader)?),
        2 => Packet::ConnAck(parse_connack(&mut reader, version)?),
        3 => Packet::Publish(parse_publish(flags, &mut reader, version)?),
        4 => Packet::PubAck(parse_ack(&mut reader, version)?),
        5 => Packet::PubRec(parse_ack(&mut reader, version)?),
        6 => Packet::PubRel(parse_ack(&mut reader, version)?),
        7 => Packet::PubComp(parse_ack(&mut reader, version)?),
        8 => Packet::Subscribe(parse_subscribe(&mut reader, version)?),
        9 => Packet::SubAck(parse_suback(&mut reader, version)?),
        10 => Packet::Unsubscribe(parse_unsubscribe(&mut reader, version)?),
        11 => Packet::UnsubAck(parse_unsuback(&mut reader, version)?),
        12 => Packet::PingReq,
        13 => Packet::PingResp,
        14 => Packet::Disconnect(parse_disconnect(&mut reader, version)?),
        15 => Packet::Auth(parse_auth(&mut reader, version)?),
        other => return Err(DecodeError::InvalidPacketType(other)),
    };
    reader.expect_end()?;
    Ok(packet)
}

fn validate_flags(packet_type: u8, flags: u8) -> Result<(), DecodeError> {
    let ok = match packet_type {
        3 => true,
        6 | 8 | 10 => flags == 0b0010,
        _ => flags == 0,
    };
    if !ok {
        return Err(DecodeError::InvalidFlags { packet_type, flags });
    }
    Ok(())
}

fn nonzero_packet_id(id: u16) -> Result<u16, DecodeError> {
    if id == 0 {
        return Err(DecodeError::ZeroPacketId);
    }
    Ok(id)
}

fn parse_connect(reader: &mut Reader) -> Result<Connect, DecodeError> {
    let name = reader.utf8()?;
    if name != "MQTT" {
        return Err(DecodeError::InvalidProtocolName);
    }
    let level = reader.u8()?;
    let version =
        ProtocolVersion::from_level(level).ok_or(DecodeError::UnsupportedProtocolLevel(level))?;

    let flags = reader.u8()?;
    if flags & 0x01 != 0 {
        return Err(DecodeError::InvalidConnectFlags(flags));
    }
    let clean_start = flags & 0x02 != 0;
    let will_flag = flags & 0x04 != 0;
    let will_qos_bits = (flags >> 3) & 0x03;
    let will_retain = flags & 0x20 != 0;
    let password_flag = flags & 0x40 != 0;
    let username_flag = flags & 0x80 != 0;
    if !will_flag && (will_qos_bits != 0 || will_retain) {
        return Err(DecodeError::InvalidConnectFlags(flags));
    }

    let keep_alive = reader.u16()?;
    let properties = if version.is_v5() {
        decode_properties(reader)?
    } else {
        Properties::default()
    };
    let client_id = reader.utf8()?;

    let will = if will_flag {
        let qos = QoS::from_bits(will_qos_bits).ok_or(DecodeError::InvalidQos)?;
        let will_properties = if version.is_v5() {
            decode_properties(reader)?
        } else {
            Properties::default()
        };
        let topic = reader.utf8()?;
        let payload = reader.binary_vec()?;
        Some(Will {
            topic,
            payload,
            qos,
            retain: will_retain,
            properties: will_properties,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(reader.utf8()?)
    } else {
        None
    };
    let password = if password_flag {
        Some(reader.binary_vec()?)
    } else {
        None
    };

    Ok(Connect {
        client_id,
        keep_alive,
        clean_start,
        will,
        username,
        password,
        properties,
    })
}

fn parse_connack(reader: &mut Reader, version: ProtocolVersion) -> Result<ConnAck, DecodeError> {
    let flags = reader.u8()?;
    if flags & !0x01 != 0 {
        return Err(DecodeError::InvalidConnAckFlags(flags));
    }
    let session_present = flags & 0x01 != 0;
    let code = reader.u8()?;
    let properties = if version.is_v5() {
        decode_properties(reader)?
    } else {
        Properties::default()
    };
    Ok(ConnAck {
        session_present,
        code,
        properties,
    })
}

fn parse_publish(
    flags: u8,
    reader: &mut Reader,
    version: ProtocolVersion,
) -> Result<Publish, DecodeError> {
    let dup = flags & 0b1000 != 0;
    let retain = flags & 0b0001 != 0;
    let qos = QoS::from_bits((flags >> 1) & 0x03).ok_or(DecodeError::InvalidQos)?;
    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::DupOnQos0);
    }

    let topic = reader.utf8_buf()?;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(nonzero_packet_id(reader.u16()?)?)
    };
    let properties = if version.is_v5() {
        decode_properties(reader)?
    } else {
        Properties::default()
    };
    let payload = reader.rest();

    Ok(Publish {
        dup,
        qos,
        retain,
        packet_id,
        topic,
        payload,
        properties,
    })
}

fn parse_ack(reader: &mut Reader, version: ProtocolVersion) -> Result<Ack, DecodeError> {
    let packet_id = nonzero_packet_id(reader.u16()?)?;
    let mut ack = Ack::new(packet_id);
    if version.is_v5() && reader.remaining() > 0 {
        ack.reason_code = reader.u8()?;
        if reader.remaining() > 0 {
            ack.properties = decode_properties(reader)?;
        }
    }
    Ok(ack)
}

fn parse_subscribe(
    reader: &mut Reader,
    version: ProtocolVersion,
) -> Result<Subscribe, DecodeError> {
    let packet_id = nonzero_packet_id(reader.u16()?)?;
    let properties = if version.is_v5() {
        decode_properties(reader)?
    } else {
        Properties::default()
    };

    let mut filters = Vec::new();
    while reader.remaining() > 0 {
        let filter = reader.utf8()?;
        let opts = reader.u8()?;
        let reserved_mask = if version.is_v5() { 0b1100_0000 } else { 0b1111_1100 };
        if opts & reserved_mask != 0 {
            return Err(DecodeError::ReservedSubscriptionOpts(opts));
        }
        let qos = QoS::from_bits(opts & 0x03).ok_or(DecodeError::InvalidQos)?;
        let retain_handling = (opts >> 4) & 0x03;
        if retain_handling > 2 {
            return Err(DecodeError::InvalidRetainHandling(retain_handling));
        }
        filters.push(SubscribeFilter {
            filter,
            qos,
            no_local: opts & 0b0000_0100 != 0,
            retain_as_published: opts & 0b0000_1000 != 0,
            retain_handling,
        });
    }
    if filters.is_empty() {
        return Err(DecodeError::EmptyFilters);
    }

    Ok(Subscribe {
        packet_id,
        filters,
        properties,
    })
}

fn parse_suback(reader: &mut Reader, version: ProtocolVersion) -> Result<SubAck, DecodeError> {
    let packet_id = nonzero_packet_id(reader.u16()?)?;
    let properties = if version.is_v5() {
        decode_properties(reader)?
    } else {
        Properties::default()
    };
    let return_codes = reader.rest().to_vec();
    if return_codes.is_empty() {
        return Err(DecodeError::EmptyReasonCodes);
    }
    Ok(SubAck {
        packet_id,
        return_codes,
        properties,
    })
}

fn parse_unsubscribe(
    reader: &mut Reader,
    version: ProtocolVersion,
) -> Result<Unsubscribe, DecodeError> {
    let packet_id = nonzero_packet_id(reader.u16()?)?;
    let properties = if version.is_v5() {
        decode_properties(reader)?
    } else {
        Properties::default()
    };
    let mut filters = Vec::new();
    while reader.remaining() > 0 {
        filters.push(reader.utf8()?);
    }
    if filters.is_empty() {
        return Err(DecodeError::EmptyFilters);
    }
    Ok(Unsubscribe {
        packet_id,
        filters,
        properties,
    })
}

fn parse_unsuback(reader: &mut Reader, version: ProtocolVersion) -> Result<UnsubAck, DecodeError> {
    let packet_id = nonzero_packet_id(reader.u16()?)?;
    if !version.is_v5() {
        return Ok(UnsubAck {
            packet_id,
            reason_codes: Vec::new(),
            properties: Properties::default(),
        });
    }
    let properties = decode_properties(reader)?;
    let reason_codes = reader.rest().to_vec();
    if reason_codes.is_empty() {
        return Err(DecodeError::EmptyReasonCodes);
    }
    Ok(UnsubAck {
        packet_id,
        reason_codes,
        properties,
    })
}

fn parse_disconnect(
    reader: &mut Reader,
    version: ProtocolVersion,
) -> Result<Disconnect, DecodeError> {
    if !version.is_v5() || reader.remaining() == 0 {
        return Ok(Disconnect::default());
    }
    let reason_code = reader.u8()?;
    let properties = if reader.remaining() > 0 {
        decode_properties(reader)?
    } else {
        Properties::default()
    };
    Ok(Disconnect {
        reason_code,
        properties,
    })
}

fn parse_auth(reader: &mut Reader, version: ProtocolVersion) -> Result<Auth, DecodeError> {
    if !version.is_v5() {
        return Err(DecodeError::AuthRequiresV5);
    }
    if reader.remaining() == 0 {
        return Ok(Auth::default());
    }
    let reason_code = reader.u8()?;
    let properties = if reader.remaining() > 0 {
        decode_properties(reader)?
    } else {
        Properties::default()
    };
    Ok(Auth {
        reason_code,
        properties,
    })
}
