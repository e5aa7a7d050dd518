#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: protocol dispatch is inherently branchy
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Handler slots are boxed closures with wide signatures
#![allow(clippy::type_complexity)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Struct field patterns
#![allow(clippy::struct_excessive_bools)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_lossless)]
// Control flow style
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::if_not_else)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
// Option/Result patterns
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::unnecessary_wraps)]
// Type defaults
#![allow(clippy::default_trait_access)]
// Iteration style
#![allow(clippy::explicit_iter_loop)]
// Closure style
#![allow(clippy::redundant_closure_for_method_calls)]
// Unit patterns
#![allow(clippy::ignored_unit_patterns)]
// Large types
#![allow(clippy::large_enum_variant)]
#![allow(clippy::result_large_err)]
// Async functions that may not await yet
#![allow(clippy::unused_async)]

//! Photon - asynchronous MQTT v3.1.1 / v5.0 client protocol engine.
//!
//! The crate translates publish/subscribe intent into wire-conformant MQTT
//! packet sequences over any async byte-stream transport, tracks in-flight
//! QoS state across reconnects, and surfaces inbound packets through
//! registered handlers.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::buffer` - Byte views over shared, reference-counted backing
//! - `core::config` - Connect options and transport configuration
//! - `core::time` - Deterministic time sourcing
//!
//! ## Protocol
//! - `protocol::packet` - The packet model for both versions
//! - `protocol::decode` / `protocol::encode` - Wire codec
//! - `protocol::properties` - v5 property TLV codec
//! - `protocol::reason` - Return and reason codes
//!
//! ## Session
//! - `session::pid` - Packet identifier allocation
//! - `session::store` - Retention and replay of unacknowledged packets
//!
//! ## Endpoint
//! - `endpoint` - The connection state machine and QoS protocols
//! - `endpoint::handlers` - Per-packet-kind handler registration
//!
//! ## Networking
//! - `net` - TCP / TLS / WebSocket transport dialing

// Core infrastructure
pub mod core;

// Wire protocol
pub mod protocol;

// Session state
pub mod session;

// Endpoint state machine
pub mod endpoint;

// Transports
pub mod net;

// Re-exports for convenience
pub use self::core::buffer::{Buffer, BufferError};
pub use self::core::config::{
    ConnectOptions, TlsOptions, TransportConfig, TransportScheme, Will,
};
pub use self::core::time::{Clock, SystemClock};
pub use endpoint::{Endpoint, EndpointError, Ops, Phase};
pub use net::Transport;
pub use protocol::{
    Packet, Properties, Property, PropertyId, ProtocolVersion, QoS, SubscribeFilter,
};
pub use session::{PacketIdRegistry, Session, SessionError, Store};
