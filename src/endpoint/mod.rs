//! The MQTT endpoint state machine.
//!
//! An [`Endpoint`] owns a byte-stream transport, a [`Session`], and the
//! registered handler slots. Public operations compose packets into an
//! internal FIFO outbox and flush them before returning; [`Endpoint::run`]
//! drives the inbound side, dispatching packets through the QoS protocols
//! and into the application handlers.
//!
//! All state lives behind `&mut self`: the runtime never polls two futures
//! borrowing the same endpoint, so handler invocations, session mutation,
//! and transport writes are serialised without locks.

pub mod handlers;
mod keep_alive;

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::core::buffer::Buffer;
use crate::core::config::ConnectOptions;
use crate::core::time::{Clock, SystemClock};
use crate::protocol::{
    connack_accepted, encode_packet, read_packet, Ack, Connect, DecodeError, Disconnect,
    EncodeError, Packet, Properties, Property, ProtocolVersion, Publish, QoS, ReadError,
    ReasonCodes, Subscribe, SubscribeFilter, Unsubscribe,
};
use crate::session::{ExpectedAck, Session, SessionError};

use handlers::Handlers;
use keep_alive::KeepAlive;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("malformed packet: {0}")]
    Malformed(#[source] DecodeError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("keep-alive timed out")]
    KeepAliveTimeout,
    #[error("packet id space exhausted")]
    NoPacketId,
    #[error("packet id {0} already in use")]
    PacketIdConflict(u16),
    #[error("invalid topic {0:?}")]
    InvalidTopic(String),
    #[error("connection refused: code 0x{0:02x}")]
    BadResponse(u8),
    #[error("endpoint is not connected")]
    NotConnected,
    #[error("operation aborted")]
    Aborted,
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),
}

impl EndpointError {
    /// Reason code for the v5 DISCONNECT sent while tearing down, when the
    /// error class has one.
    fn disconnect_reason(&self) -> Option<u8> {
        match self {
            Self::Malformed(_) => Some(ReasonCodes::MALFORMED_PACKET),
            Self::Protocol(_) => Some(ReasonCodes::PROTOCOL_ERROR),
            _ => None,
        }
    }
}

impl From<DecodeError> for EndpointError {
    fn from(err: DecodeError) -> Self {
        if err.is_protocol_error() {
            Self::Protocol(err.to_string())
        } else {
            Self::Malformed(err)
        }
    }
}

impl From<SessionError> for EndpointError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NoPacketId => Self::NoPacketId,
            SessionError::PacketIdConflict(id) => Self::PacketIdConflict(id),
            SessionError::ZeroPacketId => Self::Protocol("packet id must be non-zero".to_string()),
        }
    }
}

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// One encoded frame waiting in the outbox. `res_sent` carries the packet id
/// to report through `pub_res_sent_handler` once the frame is written.
struct Outgoing {
    frame: Bytes,
    res_sent: Option<u16>,
}

/// The handler-reachable half of the endpoint: session, outbox, phase.
/// [`Ops`] wraps it so packet handlers can re-enter the endpoint.
pub(crate) struct Core {
    version: ProtocolVersion,
    phase: Phase,
    session: Session,
    outbox: VecDeque<Outgoing>,
    keep_alive: KeepAlive,
    close_requested: bool,
}

impl Core {
    fn new(version: ProtocolVersion, now: Instant) -> Self {
        Self {
            version,
            phase: Phase::Disconnected,
            session: Session::new(),
            outbox: VecDeque::new(),
            keep_alive: KeepAlive::disabled(now),
            close_requested: false,
        }
    }

    fn enqueue(&mut self, packet: &Packet, res_sent: Option<u16>) -> Result<(), EndpointError> {
        let frame = encode_packet(packet, self.version)?;
        debug!(packet = packet.name(), len = frame.len(), "queueing");
        self.outbox.push_back(Outgoing { frame, res_sent });
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), EndpointError> {
        match self.phase {
            Phase::Connected => Ok(()),
            Phase::Disconnecting => Err(EndpointError::Aborted),
            Phase::Disconnected | Phase::Connecting => Err(EndpointError::NotConnected),
        }
    }

    fn op_connect(&mut self, opts: ConnectOptions, now: Instant) -> Result<(), EndpointError> {
        if self.phase != Phase::Disconnected {
            return Err(EndpointError::Protocol(
                "connect attempted while a connection is active".to_string(),
            ));
        }
        self.session.clean_start = opts.clean_start;
        self.keep_alive.configure(opts.keep_alive, now);
        let packet = Packet::Connect(Connect {
            client_id: opts.client_id,
            keep_alive: opts.keep_alive,
            clean_start: opts.clean_start,
            will: opts.will,
            username: opts.username,
            password: opts.password,
            properties: opts.properties,
        });
        self.enqueue(&packet, None)?;
        self.phase = Phase::Connecting;
        Ok(())
    }

    fn op_publish(
        &mut self,
        topic: Buffer,
        payload: Buffer,
        qos: QoS,
        retain: bool,
        properties: Properties,
        now: Instant,
    ) -> Result<Option<u16>, EndpointError> {
        self.ensure_connected()?;
        validate_topic(&topic)?;

        let mut publish = Publish {
            dup: false,
            qos,
            retain,
            packet_id: None,
            topic,
            payload,
            properties,
        };
        if qos == QoS::AtMostOnce {
            self.enqueue(&Packet::Publish(publish), None)?;
            return Ok(None);
        }

        let packet_id = self.session.pid.acquire_unique()?;
        publish.packet_id = Some(packet_id);
        let packet = Packet::Publish(publish);
        let expect = expected_for(qos);
        self.session.store.insert(packet_id, expect, packet.clone(), now)?;
        self.enqueue(&packet, None)?;
        Ok(Some(packet_id))
    }

    /// Publish re-using a caller-registered id, with DUP set on the wire.
    fn op_publish_with_id(
        &mut self,
        packet_id: u16,
        topic: Buffer,
        payload: Buffer,
        qos: QoS,
        retain: bool,
        properties: Properties,
        now: Instant,
    ) -> Result<(), EndpointError> {
        self.ensure_connected()?;
        validate_topic(&topic)?;
        if qos == QoS::AtMostOnce {
            return Err(EndpointError::Protocol(
                "dup publish requires qos > 0".to_string(),
            ));
        }
        if !self.session.pid.contains(packet_id) {
            self.session.pid.register(packet_id)?;
        }
        let packet = Packet::Publish(Publish {
            dup: true,
            qos,
            retain,
            packet_id: Some(packet_id),
            topic,
            payload,
            properties,
        });
        self.session
            .store
            .insert(packet_id, expected_for(qos), packet.clone(), now)?;
        self.enqueue(&packet, None)?;
        Ok(())
    }

    fn op_subscribe(
        &mut self,
        packet_id: u16,
        filters: Vec<SubscribeFilter>,
        properties: Properties,
    ) -> Result<(), EndpointError> {
        self.ensure_connected()?;
        if filters.is_empty() {
            return Err(EndpointError::InvalidTopic(String::new()));
        }
        for entry in &filters {
            if entry.filter.is_empty() {
                return Err(EndpointError::InvalidTopic(entry.filter.clone()));
            }
        }
        if !self.session.pid.contains(packet_id) {
            self.session.pid.register(packet_id)?;
        }
        self.enqueue(
            &Packet::Subscribe(Subscribe {
                packet_id,
                filters,
                properties,
            }),
            None,
        )
    }

    fn op_unsubscribe(
        &mut self,
        packet_id: u16,
        filters: Vec<String>,
        properties: Properties,
    ) -> Result<(), EndpointError> {
        self.ensure_connected()?;
        if filters.is_empty() || filters.iter().any(String::is_empty) {
            return Err(EndpointError::InvalidTopic(String::new()));
        }
        if !self.session.pid.contains(packet_id) {
            self.session.pid.register(packet_id)?;
        }
        self.enqueue(
            &Packet::Unsubscribe(Unsubscribe {
                packet_id,
                filters,
                properties,
            }),
            None,
        )
    }

    fn op_pingreq(&mut self) -> Result<(), EndpointError> {
        self.ensure_connected()?;
        self.enqueue(&Packet::PingReq, None)
    }

    /// Disconnect is a no-op when no connection is active.
    fn op_disconnect(&mut self, reason: Option<u8>) -> Result<(), EndpointError> {
        if !matches!(self.phase, Phase::Connecting | Phase::Connected) {
            return Ok(());
        }
        let disconnect = match reason {
            Some(code) if self.version.is_v5() => Disconnect::with_reason(code),
            _ => Disconnect::default(),
        };
        self.enqueue(&Packet::Disconnect(disconnect), None)?;
        self.phase = Phase::Disconnecting;
        self.close_requested = true;
        Ok(())
    }
}

fn expected_for(qos: QoS) -> ExpectedAck {
    match qos {
        QoS::AtLeastOnce => ExpectedAck::PubAck,
        _ => ExpectedAck::PubRec,
    }
}

fn validate_topic(topic: &Buffer) -> Result<(), EndpointError> {
    let name = topic
        .as_utf8()
        .ok_or_else(|| EndpointError::InvalidTopic("<non-utf8>".to_string()))?;
    if name.is_empty() || name.contains(['+', '#']) {
        return Err(EndpointError::InvalidTopic(name.to_string()));
    }
    Ok(())
}

/// Re-entrancy surface handed to packet handlers: the same operations the
/// endpoint exposes, over the same session and outbox. Packets enqueued here
/// are flushed after the handler returns, in FIFO order.
pub struct Ops<'a> {
    core: &'a mut Core,
    now: Instant,
}

impl Ops<'_> {
    pub fn publish(
        &mut self,
        topic: impl Into<Buffer>,
        payload: impl Into<Buffer>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>, EndpointError> {
        self.core
            .op_publish(topic.into(), payload.into(), qos, retain, Properties::default(), self.now)
    }

    pub fn publish_with_properties(
        &mut self,
        topic: impl Into<Buffer>,
        payload: impl Into<Buffer>,
        qos: QoS,
        retain: bool,
        properties: Properties,
    ) -> Result<Option<u16>, EndpointError> {
        self.core
            .op_publish(topic.into(), payload.into(), qos, retain, properties, self.now)
    }

    pub fn publish_dup(
        &mut self,
        packet_id: u16,
        topic: impl Into<Buffer>,
        payload: impl Into<Buffer>,
        qos: QoS,
    ) -> Result<(), EndpointError> {
        self.core.op_publish_with_id(
            packet_id,
            topic.into(),
            payload.into(),
            qos,
            false,
            Properties::default(),
            self.now,
        )
    }

    pub fn subscribe(
        &mut self,
        packet_id: u16,
        filters: Vec<SubscribeFilter>,
    ) -> Result<(), EndpointError> {
        self.core
            .op_subscribe(packet_id, filters, Properties::default())
    }

    pub fn subscribe_with_properties(
        &mut self,
        packet_id: u16,
        filters: Vec<SubscribeFilter>,
        properties: Properties,
    ) -> Result<(), EndpointError> {
        self.core.op_subscribe(packet_id, filters, properties)
    }

    pub fn unsubscribe(
        &mut self,
        packet_id: u16,
        filters: Vec<String>,
    ) -> Result<(), EndpointError> {
        self.core
            .op_unsubscribe(packet_id, filters, Properties::default())
    }

    pub fn unsubscribe_with_properties(
        &mut self,
        packet_id: u16,
        filters: Vec<String>,
        properties: Properties,
    ) -> Result<(), EndpointError> {
        self.core.op_unsubscribe(packet_id, filters, properties)
    }

    pub fn pingreq(&mut self) -> Result<(), EndpointError> {
        self.core.op_pingreq()
    }

    pub fn disconnect(&mut self) -> Result<(), EndpointError> {
        self.core.op_disconnect(None)
    }

    pub fn disconnect_with_reason(&mut self, reason: u8) -> Result<(), EndpointError> {
        self.core.op_disconnect(Some(reason))
    }

    pub fn acquire_unique_packet_id(&mut self) -> Result<u16, EndpointError> {
        Ok(self.core.session.pid.acquire_unique()?)
    }

    pub fn register_packet_id(&mut self, packet_id: u16) -> Result<(), EndpointError> {
        Ok(self.core.session.pid.register(packet_id)?)
    }

    pub fn release_packet_id(&mut self, packet_id: u16) {
        self.core.session.pid.release(packet_id);
    }
}

/// MQTT client endpoint over an established byte-stream transport.
pub struct Endpoint<T, C = SystemClock>
where
    T: AsyncRead + AsyncWrite + Unpin,
    C: Clock,
{
    transport: T,
    clock: C,
    core: Core,
    handlers: Handlers,
}

impl<T> Endpoint<T, SystemClock>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(transport: T, version: ProtocolVersion) -> Self {
        Self::with_clock(transport, version, SystemClock)
    }
}

impl<T, C> Endpoint<T, C>
where
    T: AsyncRead + AsyncWrite + Unpin,
    C: Clock,
{
    pub fn with_clock(transport: T, version: ProtocolVersion, clock: C) -> Self {
        let now = clock.now();
        Self {
            transport,
            clock,
            core: Core::new(version, now),
            handlers: Handlers::default(),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.core.version
    }

    pub fn phase(&self) -> Phase {
        self.core.phase
    }

    pub fn session(&self) -> &Session {
        &self.core.session
    }

    /// Adopt a session carried over from a previous connection, so stored
    /// packets replay when the broker reports `session_present`.
    pub fn restore_session(&mut self, session: Session) {
        self.core.session = session;
    }

    /// Extract the session for hand-off to the endpoint of a new connection.
    pub fn into_session(self) -> Session {
        self.core.session
    }

    /// Clean session flag (v3.1.1 naming).
    pub fn set_clean_session(&mut self, clean: bool) {
        self.core.session.clean_start = clean;
    }

    /// Clean start flag (v5 naming).
    pub fn set_clean_start(&mut self, clean: bool) {
        self.core.session.clean_start = clean;
    }

    pub fn acquire_unique_packet_id(&mut self) -> Result<u16, EndpointError> {
        Ok(self.core.session.pid.acquire_unique()?)
    }

    pub fn register_packet_id(&mut self, packet_id: u16) -> Result<(), EndpointError> {
        Ok(self.core.session.pid.register(packet_id)?)
    }

    pub fn release_packet_id(&mut self, packet_id: u16) {
        self.core.session.pid.release(packet_id);
    }

    // ------------------------------------------------------------------
    // Handler registration
    // ------------------------------------------------------------------

    pub fn set_connack_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, bool, u8) -> bool + Send + 'static,
    ) {
        self.handlers.connack = Some(Box::new(handler));
    }

    pub fn set_v5_connack_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, bool, u8, &Properties) -> bool + Send + 'static,
    ) {
        self.handlers.v5_connack = Some(Box::new(handler));
    }

    pub fn set_publish_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, bool, QoS, bool, Option<u16>, Buffer, Buffer) -> bool
            + Send
            + 'static,
    ) {
        self.handlers.publish = Some(Box::new(handler));
    }

    pub fn set_v5_publish_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, bool, QoS, bool, Option<u16>, Buffer, Buffer, &Properties) -> bool
            + Send
            + 'static,
    ) {
        self.handlers.v5_publish = Some(Box::new(handler));
    }

    pub fn set_puback_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, u16) -> bool + Send + 'static,
    ) {
        self.handlers.puback = Some(Box::new(handler));
    }

    pub fn set_v5_puback_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, u16, u8, &Properties) -> bool + Send + 'static,
    ) {
        self.handlers.v5_puback = Some(Box::new(handler));
    }

    pub fn set_pubrec_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, u16) -> bool + Send + 'static,
    ) {
        self.handlers.pubrec = Some(Box::new(handler));
    }

    pub fn set_v5_pubrec_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, u16, u8, &Properties) -> bool + Send + 'static,
    ) {
        self.handlers.v5_pubrec = Some(Box::new(handler));
    }

    pub fn set_pubcomp_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, u16) -> bool + Send + 'static,
    ) {
        self.handlers.pubcomp = Some(Box::new(handler));
    }

    pub fn set_v5_pubcomp_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, u16, u8, &Properties) -> bool + Send + 'static,
    ) {
        self.handlers.v5_pubcomp = Some(Box::new(handler));
    }

    pub fn set_suback_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, u16, &[u8]) -> bool + Send + 'static,
    ) {
        self.handlers.suback = Some(Box::new(handler));
    }

    pub fn set_v5_suback_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, u16, &[u8], &Properties) -> bool + Send + 'static,
    ) {
        self.handlers.v5_suback = Some(Box::new(handler));
    }

    pub fn set_unsuback_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, u16) -> bool + Send + 'static,
    ) {
        self.handlers.unsuback = Some(Box::new(handler));
    }

    pub fn set_v5_unsuback_handler(
        &mut self,
        handler: impl FnMut(&mut Ops<'_>, u16, &[u8], &Properties) -> bool + Send + 'static,
    ) {
        self.handlers.v5_unsuback = Some(Box::new(handler));
    }

    pub fn set_close_handler(&mut self, handler: impl FnMut() + Send + 'static) {
        self.handlers.close = Some(Box::new(handler));
    }

    pub fn set_error_handler(&mut self, handler: impl FnMut(&EndpointError) + Send + 'static) {
        self.handlers.error = Some(Box::new(handler));
    }

    pub fn set_pub_res_sent_handler(&mut self, handler: impl FnMut(u16) + Send + 'static) {
        self.handlers.pub_res_sent = Some(Box::new(handler));
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Send CONNECT. The CONNACK outcome arrives through the connack
    /// handler once [`Endpoint::run`] is driving the connection.
    pub async fn connect(&mut self, opts: ConnectOptions) -> Result<(), EndpointError> {
        let now = self.clock.now();
        self.core.op_connect(opts, now)?;
        info!("connecting");
        self.flush().await
    }

    /// QoS0 publishes return `None`; QoS1/2 return the allocated packet id.
    pub async fn publish(
        &mut self,
        topic: impl Into<Buffer>,
        payload: impl Into<Buffer>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>, EndpointError> {
        self.publish_with_properties(topic, payload, qos, retain, Properties::default())
            .await
    }

    pub async fn publish_with_properties(
        &mut self,
        topic: impl Into<Buffer>,
        payload: impl Into<Buffer>,
        qos: QoS,
        retain: bool,
        properties: Properties,
    ) -> Result<Option<u16>, EndpointError> {
        let now = self.clock.now();
        let packet_id =
            self.core
                .op_publish(topic.into(), payload.into(), qos, retain, properties, now)?;
        self.flush().await?;
        Ok(packet_id)
    }

    /// Publish with a caller-registered packet id and the DUP flag set.
    /// Register the id first with [`Endpoint::register_packet_id`].
    pub async fn publish_dup(
        &mut self,
        packet_id: u16,
        topic: impl Into<Buffer>,
        payload: impl Into<Buffer>,
        qos: QoS,
    ) -> Result<(), EndpointError> {
        let now = self.clock.now();
        self.core.op_publish_with_id(
            packet_id,
            topic.into(),
            payload.into(),
            qos,
            false,
            Properties::default(),
            now,
        )?;
        self.flush().await
    }

    pub async fn subscribe(
        &mut self,
        packet_id: u16,
        filters: Vec<SubscribeFilter>,
    ) -> Result<(), EndpointError> {
        self.subscribe_with_properties(packet_id, filters, Properties::default())
            .await
    }

    pub async fn subscribe_with_properties(
        &mut self,
        packet_id: u16,
        filters: Vec<SubscribeFilter>,
        properties: Properties,
    ) -> Result<(), EndpointError> {
        self.core.op_subscribe(packet_id, filters, properties)?;
        self.flush().await
    }

    pub async fn unsubscribe(
        &mut self,
        packet_id: u16,
        filters: Vec<String>,
    ) -> Result<(), EndpointError> {
        self.unsubscribe_with_properties(packet_id, filters, Properties::default())
            .await
    }

    pub async fn unsubscribe_with_properties(
        &mut self,
        packet_id: u16,
        filters: Vec<String>,
        properties: Properties,
    ) -> Result<(), EndpointError> {
        self.core.op_unsubscribe(packet_id, filters, properties)?;
        self.flush().await
    }

    pub async fn pingreq(&mut self) -> Result<(), EndpointError> {
        self.core.op_pingreq()?;
        self.flush().await
    }

    /// Send DISCONNECT and close the transport. A no-op when already
    /// disconnected.
    pub async fn disconnect(&mut self) -> Result<(), EndpointError> {
        self.disconnect_inner(None).await
    }

    /// v5 DISCONNECT with an explicit reason code.
    pub async fn disconnect_with_reason(&mut self, reason: u8) -> Result<(), EndpointError> {
        self.disconnect_inner(Some(reason)).await
    }

    async fn disconnect_inner(&mut self, reason: Option<u8>) -> Result<(), EndpointError> {
        if !matches!(self.core.phase, Phase::Connecting | Phase::Connected) {
            return Ok(());
        }
        self.core.op_disconnect(reason)?;
        self.flush().await?;
        close_clean(&mut self.transport, &mut self.core, &mut self.handlers).await
    }

    async fn flush(&mut self) -> Result<(), EndpointError> {
        flush_outbox(
            &mut self.transport,
            &self.clock,
            &mut self.core,
            &mut self.handlers,
        )
        .await
        .map_err(EndpointError::Transport)
    }

    /// Drive the connection: flush queued frames, read inbound packets,
    /// run keep-alive timers, dispatch handlers. Returns when a clean
    /// disconnect completes; protocol, transport, and timeout failures
    /// tear the connection down and propagate.
    pub async fn run(&mut self) -> Result<(), EndpointError> {
        let Self {
            transport,
            clock,
            core,
            handlers,
        } = self;

        enum Step {
            Inbound(Result<Packet, ReadError>),
            PingDue,
            Dead,
        }

        loop {
            if let Err(err) = flush_outbox(transport, clock, core, handlers).await {
                return teardown(transport, core, handlers, EndpointError::Transport(err)).await;
            }
            if core.close_requested {
                return close_clean(transport, core, handlers).await;
            }

            let now = clock.now();
            let ping_at = core.keep_alive.ping_deadline();
            let dead_at = core.keep_alive.dead_deadline();
            let version = core.version;

            let step = tokio::select! {
                r = read_packet(&mut *transport, version) => Step::Inbound(r),
                _ = clock.sleep_until(ping_at.unwrap_or(now)), if ping_at.is_some() => Step::PingDue,
                _ = clock.sleep_until(dead_at.unwrap_or(now)), if dead_at.is_some() => Step::Dead,
            };

            match step {
                Step::Inbound(Ok(packet)) => {
                    core.keep_alive.on_receive(clock.now());
                    debug!(packet = packet.name(), "received");
                    match dispatch(core, handlers, packet, clock.now()) {
                        Ok(true) => {}
                        Ok(false) => {
                            // handler requested a clean disconnect
                            if let Err(err) = core.op_disconnect(None) {
                                return teardown(transport, core, handlers, err).await;
                            }
                        }
                        Err(err) => {
                            return teardown_with_disconnect(transport, core, handlers, err).await
                        }
                    }
                }
                Step::Inbound(Err(ReadError::Io(err))) => {
                    return teardown(transport, core, handlers, EndpointError::Transport(err)).await;
                }
                Step::Inbound(Err(ReadError::Decode(err))) => {
                    return teardown_with_disconnect(transport, core, handlers, err.into()).await;
                }
                Step::PingDue => {
                    // the keep-alive contract starts at CONNECT, but PINGREQ
                    // is only legal once the connection is established
                    if core.phase == Phase::Connected {
                        if let Err(err) = core.op_pingreq() {
                            return teardown(transport, core, handlers, err).await;
                        }
                    } else {
                        core.keep_alive.on_send(clock.now());
                    }
                }
                Step::Dead => {
                    return teardown(transport, core, handlers, EndpointError::KeepAliveTimeout)
                        .await;
                }
            }
        }
    }
}

/// Write queued frames in FIFO order, then flush the transport. Response
/// notifications fire only after their frame has been written out.
async fn flush_outbox<T, C>(
    transport: &mut T,
    clock: &C,
    core: &mut Core,
    handlers: &mut Handlers,
) -> std::io::Result<()>
where
    T: AsyncWrite + Unpin,
    C: Clock,
{
    while let Some(out) = core.outbox.pop_front() {
        transport.write_all(&out.frame).await?;
        core.keep_alive.on_send(clock.now());
        if let Some(packet_id) = out.res_sent {
            if let Some(handler) = handlers.pub_res_sent.as_mut() {
                handler(packet_id);
            }
        }
    }
    transport.flush().await
}

/// Dispatch one inbound packet through the state machine. Returns the
/// handler's keep-running verdict.
fn dispatch(
    core: &mut Core,
    handlers: &mut Handlers,
    packet: Packet,
    now: Instant,
) -> Result<bool, EndpointError> {
    match packet {
        Packet::ConnAck(ack) => {
            if core.phase != Phase::Connecting {
                return Err(EndpointError::Protocol(
                    "CONNACK outside of connection establishment".to_string(),
                ));
            }
            if !connack_accepted(core.version, ack.code) {
                return Err(EndpointError::BadResponse(ack.code));
            }
            core.phase = Phase::Connected;
            if ack.session_present {
                let replay = core.session.store.replay_packets();
                if !replay.is_empty() {
                    info!(count = replay.len(), "session resumed; replaying stored packets");
                }
                for packet in &replay {
                    core.enqueue(packet, None)?;
                }
            } else {
                core.session.reset();
            }
            if let Some(Property::ServerKeepAlive(seconds)) =
                ack.properties.get(crate::protocol::PropertyId::ServerKeepAlive)
            {
                core.keep_alive.configure(*seconds, now);
            }
            let keep = match core.version {
                ProtocolVersion::V3_1_1 => match handlers.connack.as_mut() {
                    Some(handler) => {
                        let mut ops = Ops { core, now };
                        handler(&mut ops, ack.session_present, ack.code)
                    }
                    None => true,
                },
                ProtocolVersion::V5 => match handlers.v5_connack.as_mut() {
                    Some(handler) => {
                        let mut ops = Ops { core, now };
                        handler(&mut ops, ack.session_present, ack.code, &ack.properties)
                    }
                    None => true,
                },
            };
            Ok(keep)
        }

        Packet::Publish(publish) => {
            if core.phase != Phase::Connected {
                return Err(EndpointError::Protocol(
                    "PUBLISH before connection establishment".to_string(),
                ));
            }
            match publish.qos {
                QoS::AtMostOnce => Ok(invoke_publish(core, handlers, &publish, now)),
                QoS::AtLeastOnce => {
                    let packet_id = publish.packet_id.expect("decoder enforces id on qos 1");
                    let keep = invoke_publish(core, handlers, &publish, now);
                    core.enqueue(&Packet::PubAck(Ack::new(packet_id)), Some(packet_id))?;
                    Ok(keep)
                }
                QoS::ExactlyOnce => {
                    let packet_id = publish.packet_id.expect("decoder enforces id on qos 2");
                    if core.session.recv_qos2.contains(&packet_id) {
                        // duplicate delivery before PUBREL: suppress the
                        // handler, repeat the PUBREC
                        debug!(packet_id, "duplicate qos2 publish suppressed");
                        core.enqueue(&Packet::PubRec(Ack::new(packet_id)), Some(packet_id))?;
                        return Ok(true);
                    }
                    core.session.recv_qos2.insert(packet_id);
                    let keep = invoke_publish(core, handlers, &publish, now);
                    core.enqueue(&Packet::PubRec(Ack::new(packet_id)), Some(packet_id))?;
                    Ok(keep)
                }
            }
        }

        Packet::PubAck(ack) => {
            let packet_id = ack.packet_id;
            if core
                .session
                .store
                .remove(packet_id, ExpectedAck::PubAck)
                .is_none()
            {
                return Err(EndpointError::Protocol(format!(
                    "PUBACK for unknown packet id {packet_id}"
                )));
            }
            core.session.pid.release(packet_id);
            let keep = match core.version {
                ProtocolVersion::V3_1_1 => match handlers.puback.as_mut() {
                    Some(handler) => handler(&mut Ops { core, now }, packet_id),
                    None => true,
                },
                ProtocolVersion::V5 => match handlers.v5_puback.as_mut() {
                    Some(handler) => handler(
                        &mut Ops { core, now },
                        packet_id,
                        ack.reason_code,
                        &ack.properties,
                    ),
                    None => true,
                },
            };
            Ok(keep)
        }

        Packet::PubRec(ack) => {
            let packet_id = ack.packet_id;
            if !core.session.store.on_pubrec(packet_id) {
                // a repeated PUBREC means our PUBREL was lost; repeat it
                if core.session.store.expected(packet_id) == Some(ExpectedAck::PubComp) {
                    core.enqueue(&Packet::PubRel(Ack::new(packet_id)), None)?;
                    return Ok(true);
                }
                return Err(EndpointError::Protocol(format!(
                    "PUBREC for unknown packet id {packet_id}"
                )));
            }
            core.enqueue(&Packet::PubRel(Ack::new(packet_id)), None)?;
            let keep = match core.version {
                ProtocolVersion::V3_1_1 => match handlers.pubrec.as_mut() {
                    Some(handler) => handler(&mut Ops { core, now }, packet_id),
                    None => true,
                },
                ProtocolVersion::V5 => match handlers.v5_pubrec.as_mut() {
                    Some(handler) => handler(
                        &mut Ops { core, now },
                        packet_id,
                        ack.reason_code,
                        &ack.properties,
                    ),
                    None => true,
                },
            };
            Ok(keep)
        }

        Packet::PubRel(ack) => {
            // receiver-side release: the transaction is complete, the
            // duplicate-suppression entry can go
            core.session.recv_qos2.remove(&ack.packet_id);
            core.enqueue(&Packet::PubComp(Ack::new(ack.packet_id)), None)?;
            Ok(true)
        }

        Packet::PubComp(ack) => {
            let packet_id = ack.packet_id;
            if core
                .session
                .store
                .remove(packet_id, ExpectedAck::PubComp)
                .is_none()
            {
                return Err(EndpointError::Protocol(format!(
                    "PUBCOMP for unknown packet id {packet_id}"
                )));
            }
            core.session.pid.release(packet_id);
            let keep = match core.version {
                ProtocolVersion::V3_1_1 => match handlers.pubcomp.as_mut() {
                    Some(handler) => handler(&mut Ops { core, now }, packet_id),
                    None => true,
                },
                ProtocolVersion::V5 => match handlers.v5_pubcomp.as_mut() {
                    Some(handler) => handler(
                        &mut Ops { core, now },
                        packet_id,
                        ack.reason_code,
                        &ack.properties,
                    ),
                    None => true,
                },
            };
            Ok(keep)
        }

        Packet::SubAck(suback) => {
            let packet_id = suback.packet_id;
            if !core.session.pid.contains(packet_id) {
                return Err(EndpointError::Protocol(format!(
                    "SUBACK for unknown packet id {packet_id}"
                )));
            }
            core.session.pid.release(packet_id);
            let keep = match core.version {
                ProtocolVersion::V3_1_1 => match handlers.suback.as_mut() {
                    Some(handler) => {
                        handler(&mut Ops { core, now }, packet_id, &suback.return_codes)
                    }
                    None => true,
                },
                ProtocolVersion::V5 => match handlers.v5_suback.as_mut() {
                    Some(handler) => handler(
                        &mut Ops { core, now },
                        packet_id,
                        &suback.return_codes,
                        &suback.properties,
                    ),
                    None => true,
                },
            };
            Ok(keep)
        }

        Packet::UnsubAck(unsuback) => {
            let packet_id = unsuback.packet_id;
            if !core.session.pid.contains(packet_id) {
                return Err(EndpointError::Protocol(format!(
                    "UNSUBACK for unknown packet id {packet_id}"
                )));
            }
            core.session.pid.release(packet_id);
            let keep = match core.version {
                ProtocolVersion::V3_1_1 => match handlers.unsuback.as_mut() {
                    Some(handler) => handler(&mut Ops { core, now }, packet_id),
                    None => true,
                },
                ProtocolVersion::V5 => match handlers.v5_unsuback.as_mut() {
                    Some(handler) => handler(
                        &mut Ops { core, now },
                        packet_id,
                        &unsuback.reason_codes,
                        &unsuback.properties,
                    ),
                    None => true,
                },
            };
            Ok(keep)
        }

        Packet::PingResp => Ok(true),

        // brokers do not ping clients; answer anyway rather than tearing
        // the connection down over it
        Packet::PingReq => {
            core.enqueue(&Packet::PingResp, None)?;
            Ok(true)
        }

        Packet::Disconnect(disconnect) => {
            warn!(reason = disconnect.reason_code, "server-initiated disconnect");
            core.phase = Phase::Disconnected;
            core.close_requested = true;
            Ok(true)
        }

        Packet::Auth(auth) => {
            debug!(reason = auth.reason_code, "AUTH exchange ignored");
            Ok(true)
        }

        Packet::Connect(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_) => {
            Err(EndpointError::Protocol(format!(
                "server-only packet {} received",
                packet.name()
            )))
        }
    }
}

fn invoke_publish(
    core: &mut Core,
    handlers: &mut Handlers,
    publish: &Publish,
    now: Instant,
) -> bool {
    // the broker-provided DUP bit is informational only; the handler always
    // sees is_dup == false
    match core.version {
        ProtocolVersion::V3_1_1 => match handlers.publish.as_mut() {
            Some(handler) => handler(
                &mut Ops { core, now },
                false,
                publish.qos,
                publish.retain,
                publish.packet_id,
                publish.topic.clone(),
                publish.payload.clone(),
            ),
            None => true,
        },
        ProtocolVersion::V5 => match handlers.v5_publish.as_mut() {
            Some(handler) => handler(
                &mut Ops { core, now },
                false,
                publish.qos,
                publish.retain,
                publish.packet_id,
                publish.topic.clone(),
                publish.payload.clone(),
                &publish.properties,
            ),
            None => true,
        },
    }
}

/// Failure teardown preceded by a best-effort v5 DISCONNECT carrying the
/// mapped reason code.
async fn teardown_with_disconnect<T>(
    transport: &mut T,
    core: &mut Core,
    handlers: &mut Handlers,
    err: EndpointError,
) -> Result<(), EndpointError>
where
    T: AsyncWrite + Unpin,
{
    if core.version.is_v5() && matches!(core.phase, Phase::Connecting | Phase::Connected) {
        if let Some(reason) = err.disconnect_reason() {
            let packet = Packet::Disconnect(Disconnect::with_reason(reason));
            if let Ok(frame) = encode_packet(&packet, core.version) {
                let _ = transport.write_all(&frame).await;
                let _ = transport.flush().await;
            }
        }
    }
    teardown(transport, core, handlers, err).await
}

/// Failure teardown: close the transport, report through error and close
/// handlers, propagate the error.
async fn teardown<T>(
    transport: &mut T,
    core: &mut Core,
    handlers: &mut Handlers,
    err: EndpointError,
) -> Result<(), EndpointError>
where
    T: AsyncWrite + Unpin,
{
    let _ = transport.shutdown().await;
    core.phase = Phase::Disconnected;
    core.close_requested = false;
    core.outbox.clear();
    warn!(error = %err, "endpoint torn down");
    if let Some(handler) = handlers.error.as_mut() {
        handler(&err);
    }
    if let Some(handler) = handlers.close.as_mut() {
        handler();
    }
    Err(err)
}

/// Clean shutdown after a requested disconnect: the outbox has already been
/// flushed, so the DISCONNECT frame is on the wire.
async fn close_clean<T>(
    transport: &mut T,
    core: &mut Core,
    handlers: &mut Handlers,
) -> Result<(), EndpointError>
where
    T: AsyncWrite + Unpin,
{
    let _ = transport.shutdown().await;
    core.phase = Phase::Disconnected;
    core.close_requested = false;
    info!("disconnected");
    if let Some(handler) = handlers.close.as_mut() {
        handler();
    }
    Ok(())
}
