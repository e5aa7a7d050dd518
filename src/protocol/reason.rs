//! Wire-level status codes for both protocol versions.

use super::packet::ProtocolVersion;

/// MQTT 3.1.1 CONNACK return codes and the SUBACK failure marker.
pub struct ReturnCodes;

impl ReturnCodes {
    pub const ACCEPTED: u8 = 0x00;
    pub const UNACCEPTABLE_PROTOCOL_VERSION: u8 = 0x01;
    pub const IDENTIFIER_REJECTED: u8 = 0x02;
    pub const SERVER_UNAVAILABLE: u8 = 0x03;
    pub const BAD_CREDENTIALS: u8 = 0x04;
    pub const NOT_AUTHORIZED: u8 = 0x05;
    pub const SUBACK_FAILURE: u8 = 0x80;
}

/// MQTT 5 reason codes the engine emits or inspects.
pub struct ReasonCodes;

impl ReasonCodes {
    pub const SUCCESS: u8 = 0x00;
    pub const NORMAL_DISCONNECTION: u8 = 0x00;
    pub const GRANTED_QOS_0: u8 = 0x00;
    pub const GRANTED_QOS_1: u8 = 0x01;
    pub const GRANTED_QOS_2: u8 = 0x02;
    pub const NO_MATCHING_SUBSCRIBERS: u8 = 0x10;
    pub const UNSPECIFIED: u8 = 0x80;
    pub const MALFORMED_PACKET: u8 = 0x81;
    pub const PROTOCOL_ERROR: u8 = 0x82;
    pub const NOT_AUTHORIZED: u8 = 0x87;
    pub const KEEP_ALIVE_TIMEOUT: u8 = 0x8D;
    pub const PACKET_ID_IN_USE: u8 = 0x91;
    pub const PACKET_ID_NOT_FOUND: u8 = 0x92;
}

/// Whether a CONNACK code accepts the connection. v3.1.1 defines a closed
/// set of return codes where only `ACCEPTED` succeeds; v5 classifies by the
/// failure threshold.
pub fn connack_accepted(version: ProtocolVersion, code: u8) -> bool {
    match version {
        ProtocolVersion::V3_1_1 => code == ReturnCodes::ACCEPTED,
        ProtocolVersion::V5 => !is_failure(code),
    }
}

/// v5 reason codes at or above 0x80 signal failure.
pub fn is_failure(code: u8) -> bool {
    code >= 0x80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connack_acceptance_is_version_aware() {
        assert!(connack_accepted(
            ProtocolVersion::V3_1_1,
            ReturnCodes::ACCEPTED
        ));
        assert!(!connack_accepted(
            ProtocolVersion::V3_1_1,
            ReturnCodes::NOT_AUTHORIZED
        ));
        assert!(!connack_accepted(
            ProtocolVersion::V3_1_1,
            ReturnCodes::BAD_CREDENTIALS
        ));
        assert!(connack_accepted(ProtocolVersion::V5, ReasonCodes::SUCCESS));
        assert!(!connack_accepted(
            ProtocolVersion::V5,
            ReasonCodes::NOT_AUTHORIZED
        ));
        assert!(!connack_accepted(
            ProtocolVersion::V5,
            ReasonCodes::UNSPECIFIED
        ));
    }

    #[test]
    fn failure_threshold_splits_granted_qos_from_errors() {
        assert!(!is_failure(ReasonCodes::GRANTED_QOS_2));
        assert!(!is_failure(ReasonCodes::NO_MATCHING_SUBSCRIBERS));
        assert!(is_failure(ReturnCodes::SUBACK_FAILURE));
        assert!(is_failure(ReasonCodes::MALFORMED_PACKET));
    }
}
