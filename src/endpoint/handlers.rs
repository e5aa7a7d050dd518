//! Handler registration slots.
//!
//! Applications register per-packet-kind callbacks before calling `connect`.
//! v3.1.1 and v5 variants of the same packet kind have separate slots; the
//! v5 forms carry the reason code and properties the wire adds. Packet
//! handlers return `true` to keep the endpoint running; `false` requests a
//! clean disconnect.

use crate::core::buffer::Buffer;
use crate::protocol::{Properties, QoS};

use super::{EndpointError, Ops};

pub type ConnAckHandler = Box<dyn FnMut(&mut Ops<'_>, bool, u8) -> bool + Send>;
pub type V5ConnAckHandler = Box<dyn FnMut(&mut Ops<'_>, bool, u8, &Properties) -> bool + Send>;

/// PUBACK / PUBREC / PUBCOMP / UNSUBACK (v3.1.1): just the packet id.
pub type AckHandler = Box<dyn FnMut(&mut Ops<'_>, u16) -> bool + Send>;
/// v5 PUBACK / PUBREC / PUBCOMP: packet id, reason code, properties.
pub type V5AckHandler = Box<dyn FnMut(&mut Ops<'_>, u16, u8, &Properties) -> bool + Send>;

pub type SubAckHandler = Box<dyn FnMut(&mut Ops<'_>, u16, &[u8]) -> bool + Send>;
pub type V5SubAckHandler = Box<dyn FnMut(&mut Ops<'_>, u16, &[u8], &Properties) -> bool + Send>;
pub type V5UnsubAckHandler = Box<dyn FnMut(&mut Ops<'_>, u16, &[u8], &Properties) -> bool + Send>;

/// Inbound PUBLISH: (dup, qos, retain, packet id, topic, payload). The dup
/// argument is always false; the broker-side DUP bit is masked.
pub type PublishHandler =
    Box<dyn FnMut(&mut Ops<'_>, bool, QoS, bool, Option<u16>, Buffer, Buffer) -> bool + Send>;
pub type V5PublishHandler = Box<
    dyn FnMut(&mut Ops<'_>, bool, QoS, bool, Option<u16>, Buffer, Buffer, &Properties) -> bool
        + Send,
>;

pub type CloseHandler = Box<dyn FnMut() + Send>;
pub type ErrorHandler = Box<dyn FnMut(&EndpointError) + Send>;
/// Fires after the QoS response packet (PUBACK for QoS1, PUBREC for QoS2)
/// has left the outbound path.
pub type PubResSentHandler = Box<dyn FnMut(u16) + Send>;

#[derive(Default)]
pub(crate) struct Handlers {
    pub connack: Option<ConnAckHandler>,
    pub v5_connack: Option<V5ConnAckHandler>,
    pub publish: Option<PublishHandler>,
    pub v5_publish: Option<V5PublishHandler>,
    pub puback: Option<AckHandler>,
    pub v5_puback: Option<V5AckHandler>,
    pub pubrec: Option<AckHandler>,
    pub v5_pubrec: Option<V5AckHandler>,
    pub pubcomp: Option<AckHandler>,
    pub v5_pubcomp: Option<V5AckHandler>,
    pub suback: Option<SubAckHandler>,
    pub v5_suback: Option<V5SubAckHandler>,
    pub unsuback: Option<AckHandler>,
    pub v5_unsuback: Option<V5UnsubAckHandler>,
    pub close: Option<CloseHandler>,
    pub error: Option<ErrorHandler>,
    pub pub_res_sent: Option<PubResSentHandler>,
}
