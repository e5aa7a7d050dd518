//! MQTT 5.0 property section codec.
//!
//! A property section is a variable-byte-integer total length followed by a
//! sequence of identifier-tagged typed values. Identifiers other than
//! UserProperty and SubscriptionIdentifier must not repeat.

use bytes::BytesMut;

use crate::core::buffer::Buffer;

use super::decode::{DecodeError, Reader};
use super::encode::{put_binary, put_str, put_vbi};

/// MQTT 5.0 property identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQos = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

impl PropertyId {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::PayloadFormatIndicator),
            0x02 => Some(Self::MessageExpiryInterval),
            0x03 => Some(Self::ContentType),
            0x08 => Some(Self::ResponseTopic),
            0x09 => Some(Self::CorrelationData),
            0x0B => Some(Self::SubscriptionIdentifier),
            0x11 => Some(Self::SessionExpiryInterval),
            0x12 => Some(Self::AssignedClientIdentifier),
            0x13 => Some(Self::ServerKeepAlive),
            0x15 => Some(Self::AuthenticationMethod),
            0x16 => Some(Self::AuthenticationData),
            0x17 => Some(Self::RequestProblemInformation),
            0x18 => Some(Self::WillDelayInterval),
            0x19 => Some(Self::RequestResponseInformation),
            0x1A => Some(Self::ResponseInformation),
            0x1C => Some(Self::ServerReference),
            0x1F => Some(Self::ReasonString),
            0x21 => Some(Self::ReceiveMaximum),
            0x22 => Some(Self::TopicAliasMaximum),
            0x23 => Some(Self::TopicAlias),
            0x24 => Some(Self::MaximumQos),
            0x25 => Some(Self::RetainAvailable),
            0x26 => Some(Self::UserProperty),
            0x27 => Some(Self::MaximumPacketSize),
            0x28 => Some(Self::WildcardSubscriptionAvailable),
            0x29 => Some(Self::SubscriptionIdentifierAvailable),
            0x2A => Some(Self::SharedSubscriptionAvailable),
            _ => None,
        }
    }

    /// Whether the identifier may appear more than once in one section.
    pub fn repeatable(&self) -> bool {
        matches!(self, Self::UserProperty | Self::SubscriptionIdentifier)
    }
}

/// One identifier-tagged property value.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    PayloadFormatIndicator(u8),
    MessageExpiryInterval(u32),
    ContentType(String),
    ResponseTopic(String),
    CorrelationData(Buffer),
    SubscriptionIdentifier(u32),
    SessionExpiryInterval(u32),
    AssignedClientIdentifier(String),
    ServerKeepAlive(u16),
    AuthenticationMethod(String),
    AuthenticationData(Buffer),
    RequestProblemInformation(u8),
    WillDelayInterval(u32),
    RequestResponseInformation(u8),
    ResponseInformation(String),
    ServerReference(String),
    ReasonString(String),
    ReceiveMaximum(u16),
    TopicAliasMaximum(u16),
    TopicAlias(u16),
    MaximumQos(u8),
    RetainAvailable(u8),
    UserProperty(String, String),
    MaximumPacketSize(u32),
    WildcardSubscriptionAvailable(u8),
    SubscriptionIdentifierAvailable(u8),
    SharedSubscriptionAvailable(u8),
}

impl Property {
    pub fn id(&self) -> PropertyId {
        match self {
            Self::PayloadFormatIndicator(_) => PropertyId::PayloadFormatIndicator,
            Self::MessageExpiryInterval(_) => PropertyId::MessageExpiryInterval,
            Self::ContentType(_) => PropertyId::ContentType,
            Self::ResponseTopic(_) => PropertyId::ResponseTopic,
            Self::CorrelationData(_) => PropertyId::CorrelationData,
            Self::SubscriptionIdentifier(_) => PropertyId::SubscriptionIdentifier,
            Self::SessionExpiryInterval(_) => PropertyId::SessionExpiryInterval,
            Self::AssignedClientIdentifier(_) => PropertyId::AssignedClientIdentifier,
            Self::ServerKeepAlive(_) => PropertyId::ServerKeepAlive,
            Self::AuthenticationMethod(_) => PropertyId::AuthenticationMethod,
            Self::AuthenticationData(_) => PropertyId::AuthenticationData,
            Self::RequestProblemInformation(_) => PropertyId::RequestProblemInformation,
            Self::WillDelayInterval(_) => PropertyId::WillDelayInterval,
            Self::RequestResponseInformation(_) => PropertyId::RequestResponseInformation,
            Self::ResponseInformation(_) => PropertyId::ResponseInformation,
            Self::ServerReference(_) => PropertyId::ServerReference,
            Self::ReasonString(_) => PropertyId::ReasonString,
            Self::ReceiveMaximum(_) => PropertyId::ReceiveMaximum,
            Self::TopicAliasMaximum(_) => PropertyId::TopicAliasMaximum,
            Self::TopicAlias(_) => PropertyId::TopicAlias,
            Self::MaximumQos(_) => PropertyId::MaximumQos,
            Self::RetainAvailable(_) => PropertyId::RetainAvailable,
            Self::UserProperty(_, _) => PropertyId::UserProperty,
            Self::MaximumPacketSize(_) => PropertyId::MaximumPacketSize,
            Self::WildcardSubscriptionAvailable(_) => PropertyId::WildcardSubscriptionAvailable,
            Self::SubscriptionIdentifierAvailable(_) => PropertyId::SubscriptionIdentifierAvailable,
            Self::SharedSubscriptionAvailable(_) => PropertyId::SharedSubscriptionAvailable,
        }
    }
}

/// Insertion-ordered property collection. Repetition order of UserProperty
/// entries is preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    entries: Vec<Property>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, property: Property) {
        self.entries.push(property);
    }

    pub fn with(mut self, property: Property) -> Self {
        self.entries.push(property);
        self
    }

    /// First property with the given identifier.
    pub fn get(&self, id: PropertyId) -> Option<&Property> {
        self.entries.iter().find(|p| p.id() == id)
    }

    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|p| match p {
            Property::UserProperty(k, v) => Some((k.as_str(), v.as_str())),
            _ => None,
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Property> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<Property> for Properties {
    fn from_iter<I: IntoIterator<Item = Property>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Properties {
    type Item = &'a Property;
    type IntoIter = std::slice::Iter<'a, Property>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Decode a property section (VBI length + TLV stream) at the cursor.
pub(crate) fn decode_properties(reader: &mut Reader) -> Result<Properties, DecodeError> {
    let len = reader.vbi()? as usize;
    let end = reader
        .position()
        .checked_add(len)
        .ok_or(DecodeError::PropertyLengthMismatch)?;
    if end > reader.total_len() {
        return Err(DecodeError::Truncated);
    }

    let mut properties = Properties::new();
    let mut seen = 0u64;
    while reader.position() < end {
        let id_byte = reader.u8()?;
        let id = PropertyId::from_byte(id_byte).ok_or(DecodeError::UnknownProperty(id_byte))?;
        if !id.repeatable() {
            let bit = 1u64 << (id as u8);
            if seen & bit != 0 {
                return Err(DecodeError::DuplicateProperty(id_byte));
            }
            seen |= bit;
        }
        let property = match id {
            PropertyId::PayloadFormatIndicator => Property::PayloadFormatIndicator(reader.u8()?),
            PropertyId::MessageExpiryInterval => Property::MessageExpiryInterval(reader.u32()?),
            PropertyId::ContentType => Property::ContentType(reader.utf8()?),
            PropertyId::ResponseTopic => Property::ResponseTopic(reader.utf8()?),
            PropertyId::CorrelationData => Property::CorrelationData(reader.binary()?),
            PropertyId::SubscriptionIdentifier => Property::SubscriptionIdentifier(reader.vbi()?),
            PropertyId::SessionExpiryInterval => Property::SessionExpiryInterval(reader.u32()?),
            PropertyId::AssignedClientIdentifier => {
                Property::AssignedClientIdentifier(reader.utf8()?)
            }
            PropertyId::ServerKeepAlive => Property::ServerKeepAlive(reader.u16()?),
            PropertyId::AuthenticationMethod => Property::AuthenticationMethod(reader.utf8()?),
            PropertyId::AuthenticationData => Property::AuthenticationData(reader.binary()?),
            PropertyId::RequestProblemInformation => {
                Property::RequestProblemInformation(reader.u8()?)
            }
            PropertyId::WillDelayInterval => Property::WillDelayInterval(reader.u32()?),
            PropertyId::RequestResponseInformation => {
                Property::RequestResponseInformation(reader.u8()?)
            }
            PropertyId::ResponseInformation => Property::ResponseInformation(reader.utf8()?),
            PropertyId::ServerReference => Property::ServerReference(reader.utf8()?),
            PropertyId::ReasonString => Property::ReasonString(reader.utf8()?),
            PropertyId::ReceiveMaximum => Property::ReceiveMaximum(reader.u16()?),
            PropertyId::TopicAliasMaximum => Property::TopicAliasMaximum(reader.u16()?),
            PropertyId::TopicAlias => Property::TopicAlias(reader.u16()?),
            PropertyId::MaximumQos => Property::MaximumQos(reader.u8()?),
            PropertyId::RetainAvailable => Property::RetainAvailable(reader.u8()?),
            PropertyId::UserProperty => {
                let key = reader.utf8()?;
                let value = reader.utf8()?;
                Property::UserProperty(key, value)
            }
            PropertyId::MaximumPacketSize => Property::MaximumPacketSize(reader.u32()?),
            PropertyId::WildcardSubscriptionAvailable => {
                Property::WildcardSubscriptionAvailable(reader.u8()?)
            }
            PropertyId::SubscriptionIdentifierAvailable => {
                Property::SubscriptionIdentifierAvailable(reader.u8()?)
            }
            PropertyId::SharedSubscriptionAvailable => {
                Property::SharedSubscriptionAvailable(reader.u8()?)
            }
        };
        properties.push(property);
    }
    if reader.position() != end {
        return Err(DecodeError::PropertyLengthMismatch);
    }
    Ok(properties)
}

/// Encode a property section (VBI length prefix + TLV stream).
pub(crate) fn encode_properties(properties: &Properties, out: &mut BytesMut) {
    let mut body = BytesMut::new();
    for property in properties {
        body.extend_from_slice(&[property.id() as u8]);
        match property {
            Property::PayloadFormatIndicator(v)
            | Property::RequestProblemInformation(v)
            | Property::RequestResponseInformation(v)
            | Property::MaximumQos(v)
            | Property::RetainAvailable(v)
            | Property::WildcardSubscriptionAvailable(v)
            | Property::SubscriptionIdentifierAvailable(v)
            | Property::SharedSubscriptionAvailable(v) => body.extend_from_slice(&[*v]),
            Property::ServerKeepAlive(v)
            | Property::ReceiveMaximum(v)
            | Property::TopicAliasMaximum(v)
            | Property::TopicAlias(v) => body.extend_from_slice(&v.to_be_bytes()),
            Property::MessageExpiryInterval(v)
            | Property::SessionExpiryInterval(v)
            | Property::WillDelayInterval(v)
            | Property::MaximumPacketSize(v) => body.extend_from_slice(&v.to_be_bytes()),
            Property::SubscriptionIdentifier(v) => put_vbi(&mut body, *v),
            Property::ContentType(s)
            | Property::ResponseTopic(s)
            | Property::AssignedClientIdentifier(s)
            | Property::AuthenticationMethod(s)
            | Property::ResponseInformation(s)
            | Property::ServerReference(s)
            | Property::ReasonString(s) => put_str(&mut body, s),
            Property::CorrelationData(b) | Property::AuthenticationData(b) => {
                put_binary(&mut body, b);
            }
            Property::UserProperty(k, v) => {
                put_str(&mut body, k);
                put_str(&mut body, v);
            }
        }
    }
    put_vbi(out, body.len() as u32);
    out.extend_from_slice(&body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn round_trip(props: Properties) -> Properties {
        let mut out = BytesMut::new();
        encode_properties(&props, &mut out);
        let mut reader = Reader::new(Bytes::from(out.to_vec()));
        let decoded = decode_properties(&mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);
        decoded
    }

    #[test]
    fn user_property_order_preserved() {
        let props = Properties::new()
            .with(Property::UserProperty("k1".into(), "v1".into()))
            .with(Property::UserProperty("k1".into(), "v2".into()))
            .with(Property::UserProperty("k2".into(), "v3".into()));
        let decoded = round_trip(props);
        let pairs: Vec<_> = decoded.user_properties().collect();
        assert_eq!(pairs, vec![("k1", "v1"), ("k1", "v2"), ("k2", "v3")]);
    }

    #[test]
    fn typed_values_round_trip() {
        let props = Properties::new()
            .with(Property::PayloadFormatIndicator(1))
            .with(Property::MessageExpiryInterval(300))
            .with(Property::TopicAlias(7))
            .with(Property::SubscriptionIdentifier(268_435_455))
            .with(Property::CorrelationData(Buffer::from_static(b"\x00\xff")))
            .with(Property::ResponseTopic("response/topic".into()));
        assert_eq!(round_trip(props.clone()), props);
    }

    #[test]
    fn duplicate_non_repeatable_rejected() {
        let mut out = BytesMut::new();
        let props = Properties::new()
            .with(Property::TopicAlias(1))
            .with(Property::TopicAlias(2));
        encode_properties(&props, &mut out);
        let mut reader = Reader::new(Bytes::from(out.to_vec()));
        assert_eq!(
            decode_properties(&mut reader),
            Err(DecodeError::DuplicateProperty(0x23))
        );
    }

    #[test]
    fn unknown_identifier_rejected() {
        let mut reader = Reader::new(Bytes::from_static(&[2, 0x7E, 0]));
        assert_eq!(
            decode_properties(&mut reader),
            Err(DecodeError::UnknownProperty(0x7E))
        );
    }
}
