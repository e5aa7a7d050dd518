//! MQTT packet model and wire codec.
//!
//! The codec is parameterised over [`ProtocolVersion`]; v3.1.1 and v5 share
//! the packet model, with properties and reason codes present only on v5
//! frames. Decoding is zero-copy: topics, payloads, and binary property
//! values are [`crate::Buffer`] views into the received body.

pub mod decode;
pub mod encode;
pub mod packet;
pub mod properties;
pub mod reason;

pub use decode::{decode_packet, read_packet, DecodeError, ReadError, MAX_REMAINING_LENGTH};
pub use encode::{encode_packet, EncodeError};
pub use packet::{
    Ack, Auth, ConnAck, Connect, Disconnect, Packet, ProtocolVersion, Publish, QoS, SubAck,
    Subscribe, SubscribeFilter, UnsubAck, Unsubscribe,
};
pub use properties::{Properties, Property, PropertyId};
pub use reason::{connack_accepted, is_failure, ReasonCodes, ReturnCodes};
