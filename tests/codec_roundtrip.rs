//! Codec round-trip coverage: decode(encode(p)) == p for every packet type
//! on both protocol versions, plus the malformed-input rejections the
//! decoder owes the state machine.

use photon::core::config::Will;
use photon::protocol::{
    decode_packet, encode_packet, read_packet, Ack, Auth, ConnAck, Connect, DecodeError,
    Disconnect, Packet, Properties, Property, ProtocolVersion, Publish, QoS, ReturnCodes, SubAck,
    Subscribe, SubscribeFilter, UnsubAck, Unsubscribe,
};
use photon::Buffer;

use bytes::Bytes;

async fn round_trip(packet: Packet, version: ProtocolVersion) -> Packet {
    let frame = encode_packet(&packet, version).unwrap();
    let mut cursor = frame.as_ref();
    let decoded = read_packet(&mut cursor, version).await.unwrap();
    assert!(cursor.is_empty(), "decoder must consume the whole frame");
    assert_eq!(
        encode_packet(&decoded, version).unwrap(),
        frame,
        "re-encode must be byte-identical"
    );
    assert_eq!(decoded, packet);
    decoded
}

#[tokio::test]
async fn connect_round_trips() {
    let connect = Connect {
        client_id: "cid1".to_string(),
        keep_alive: 30,
        clean_start: true,
        will: None,
        username: None,
        password: None,
        properties: Properties::default(),
    };
    round_trip(Packet::Connect(connect.clone()), ProtocolVersion::V3_1_1).await;

    let full = Connect {
        will: Some(
            Will::new("will/topic", b"gone".to_vec())
                .with_qos(QoS::AtLeastOnce)
                .with_retain(true),
        ),
        username: Some("user".to_string()),
        password: Some(b"pass".to_vec()),
        properties: Properties::new()
            .with(Property::SessionExpiryInterval(120))
            .with(Property::UserProperty("origin".into(), "test".into())),
        ..connect
    };
    round_trip(Packet::Connect(full.clone()), ProtocolVersion::V5).await;
    round_trip(
        Packet::Connect(Connect {
            properties: Properties::default(),
            will: Some(Will::new("w", b"x".to_vec())),
            ..full
        }),
        ProtocolVersion::V3_1_1,
    )
    .await;
}

#[tokio::test]
async fn connack_round_trips() {
    round_trip(
        Packet::ConnAck(ConnAck {
            session_present: true,
            code: 0,
            properties: Properties::default(),
        }),
        ProtocolVersion::V3_1_1,
    )
    .await;
    round_trip(
        Packet::ConnAck(ConnAck {
            session_present: false,
            code: 0,
            properties: Properties::new()
                .with(Property::ServerKeepAlive(45))
                .with(Property::AssignedClientIdentifier("assigned".into())),
        }),
        ProtocolVersion::V5,
    )
    .await;
}

#[tokio::test]
async fn publish_round_trips() {
    round_trip(
        Packet::Publish(Publish::new("topic1", "topic1_contents", QoS::AtMostOnce, false)),
        ProtocolVersion::V3_1_1,
    )
    .await;

    let mut qos1 = Publish::new("topic1", "payload", QoS::AtLeastOnce, true);
    qos1.packet_id = Some(7);
    round_trip(Packet::Publish(qos1), ProtocolVersion::V3_1_1).await;

    let mut qos2 = Publish::new("a/b/c", Buffer::from_static(b"\x00\x01\x02"), QoS::ExactlyOnce, false);
    qos2.packet_id = Some(0x1234);
    qos2.dup = true;
    qos2.properties = Properties::new()
        .with(Property::PayloadFormatIndicator(0))
        .with(Property::UserProperty("k".into(), "v".into()));
    round_trip(Packet::Publish(qos2), ProtocolVersion::V5).await;

    // empty payload is a valid publish
    round_trip(
        Packet::Publish(Publish::new("t", Buffer::default(), QoS::AtMostOnce, false)),
        ProtocolVersion::V3_1_1,
    )
    .await;
}

#[tokio::test]
async fn ack_round_trips() {
    for make in [
        Packet::PubAck as fn(Ack) -> Packet,
        Packet::PubRec,
        Packet::PubRel,
        Packet::PubComp,
    ] {
        round_trip(make(Ack::new(42)), ProtocolVersion::V3_1_1).await;
        round_trip(make(Ack::new(42)), ProtocolVersion::V5).await;
        round_trip(
            make(Ack {
                packet_id: 42,
                reason_code: 0x10,
                properties: Properties::new().with(Property::ReasonString("no takers".into())),
            }),
            ProtocolVersion::V5,
        )
        .await;
    }
}

#[tokio::test]
async fn subscribe_round_trips() {
    round_trip(
        Packet::Subscribe(Subscribe {
            packet_id: 3,
            filters: vec![
                SubscribeFilter::new("topic1", QoS::ExactlyOnce),
                SubscribeFilter::new("a/+/b", QoS::AtMostOnce),
            ],
            properties: Properties::default(),
        }),
        ProtocolVersion::V3_1_1,
    )
    .await;

    let mut nl = SubscribeFilter::new("topic1", QoS::AtLeastOnce);
    nl.no_local = true;
    nl.retain_as_published = true;
    nl.retain_handling = 2;
    round_trip(
        Packet::Subscribe(Subscribe {
            packet_id: 9,
            filters: vec![nl],
            properties: Properties::new().with(Property::SubscriptionIdentifier(11)),
        }),
        ProtocolVersion::V5,
    )
    .await;
}

#[tokio::test]
async fn suback_unsuback_round_trips() {
    round_trip(
        Packet::SubAck(SubAck {
            packet_id: 3,
            return_codes: vec![2, ReturnCodes::SUBACK_FAILURE],
            properties: Properties::default(),
        }),
        ProtocolVersion::V3_1_1,
    )
    .await;
    round_trip(
        Packet::SubAck(SubAck {
            packet_id: 3,
            return_codes: vec![1, 0x80],
            properties: Properties::new().with(Property::ReasonString("partial".into())),
        }),
        ProtocolVersion::V5,
    )
    .await;
    round_trip(
        Packet::Unsubscribe(Unsubscribe {
            packet_id: 4,
            filters: vec!["topic1".to_string(), "other".to_string()],
            properties: Properties::default(),
        }),
        ProtocolVersion::V3_1_1,
    )
    .await;
    round_trip(
        Packet::UnsubAck(UnsubAck {
            packet_id: 4,
            reason_codes: Vec::new(),
            properties: Properties::default(),
        }),
        ProtocolVersion::V3_1_1,
    )
    .await;
    round_trip(
        Packet::UnsubAck(UnsubAck {
            packet_id: 4,
            reason_codes: vec![0, 0x11],
            properties: Properties::default(),
        }),
        ProtocolVersion::V5,
    )
    .await;
}

#[tokio::test]
async fn control_packets_round_trip() {
    round_trip(Packet::PingReq, ProtocolVersion::V3_1_1).await;
    round_trip(Packet::PingResp, ProtocolVersion::V5).await;
    round_trip(Packet::Disconnect(Disconnect::default()), ProtocolVersion::V3_1_1).await;
    round_trip(Packet::Disconnect(Disconnect::default()), ProtocolVersion::V5).await;
    round_trip(
        Packet::Disconnect(Disconnect {
            reason_code: 0x8D,
            properties: Properties::new().with(Property::ReasonString("keep alive".into())),
        }),
        ProtocolVersion::V5,
    )
    .await;
    round_trip(Packet::Auth(Auth::default()), ProtocolVersion::V5).await;
    round_trip(
        Packet::Auth(Auth {
            reason_code: 0x18,
            properties: Properties::new()
                .with(Property::AuthenticationMethod("SCRAM-SHA-1".into()))
                .with(Property::AuthenticationData(Buffer::from_static(b"nonce"))),
        }),
        ProtocolVersion::V5,
    )
    .await;
}

#[test]
fn oversized_remaining_length_rejected() {
    // five continuation bytes can never be a valid VBI
    let frame = [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
    let rt = tokio::runtime::Runtime::new().unwrap();
    let err = rt
        .block_on(read_packet(&mut &frame[..], ProtocolVersion::V3_1_1))
        .unwrap_err();
    assert!(matches!(
        err,
        photon::protocol::ReadError::Decode(DecodeError::MalformedVarInt)
    ));
}

#[test]
fn auth_rejected_on_v3() {
    assert_eq!(
        decode_packet(0xF0, Bytes::new(), ProtocolVersion::V3_1_1),
        Err(DecodeError::AuthRequiresV5)
    );
    assert_eq!(
        encode_packet(&Packet::Auth(Auth::default()), ProtocolVersion::V3_1_1),
        Err(photon::protocol::EncodeError::AuthRequiresV5)
    );
}

#[test]
fn connect_reserved_flag_rejected() {
    // hand-built CONNECT body with reserved flag bit 0 set
    let mut body = vec![0x00, 0x04];
    body.extend_from_slice(b"MQTT");
    body.push(4); // protocol level
    body.push(0x03); // clean session + reserved bit
    body.extend_from_slice(&[0x00, 0x3C]); // keep alive
    body.extend_from_slice(&[0x00, 0x01, b'c']);
    assert_eq!(
        decode_packet(0x10, Bytes::from(body), ProtocolVersion::V3_1_1),
        Err(DecodeError::InvalidConnectFlags(0x03))
    );
}
