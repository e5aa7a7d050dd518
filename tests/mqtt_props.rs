//! v5 property codec behavior at the packet level.

use bytes::Bytes;
use photon::protocol::{
    decode_packet, encode_packet, Ack, ConnAck, DecodeError, Disconnect, Packet, Properties,
    Property, PropertyId, ProtocolVersion, Publish, QoS,
};

#[test]
fn subscribe_parses_subscription_identifier() {
    // SUBSCRIBE variable header + payload: packet id 10, properties len 2
    // (0x0B = subscription id 7), one filter "a/b" at qos1
    let mut body = Vec::new();
    body.extend_from_slice(&10u16.to_be_bytes());
    body.push(2);
    body.push(0x0B);
    body.push(7);
    body.extend_from_slice(&3u16.to_be_bytes());
    body.extend_from_slice(b"a/b");
    body.push(0x01);

    let parsed = decode_packet(0x82, Bytes::from(body), ProtocolVersion::V5).unwrap();
    let Packet::Subscribe(subscribe) = parsed else {
        panic!("expected SUBSCRIBE");
    };
    assert_eq!(subscribe.packet_id, 10);
    assert_eq!(
        subscribe.properties.get(PropertyId::SubscriptionIdentifier),
        Some(&Property::SubscriptionIdentifier(7))
    );
    assert_eq!(subscribe.filters.len(), 1);
    assert_eq!(subscribe.filters[0].qos, QoS::AtLeastOnce);
}

#[test]
fn publish_user_properties_symmetric() {
    let mut publish = Publish::new("topic1", "topic1_contents", QoS::AtMostOnce, false);
    publish.properties = Properties::new()
        .with(Property::UserProperty("k1".into(), "v1".into()))
        .with(Property::UserProperty("k1".into(), "v2".into()));

    let frame = encode_packet(&Packet::Publish(publish.clone()), ProtocolVersion::V5).unwrap();
    let decoded = decode_packet(frame[0], frame.slice(2..), ProtocolVersion::V5).unwrap();
    let Packet::Publish(echo) = decoded else {
        panic!("expected PUBLISH");
    };
    let pairs: Vec<_> = echo.properties.user_properties().collect();
    assert_eq!(pairs, vec![("k1", "v1"), ("k1", "v2")]);
    assert_eq!(echo, publish);
}

#[test]
fn connack_encodes_server_keep_alive() {
    let frame = encode_packet(
        &Packet::ConnAck(ConnAck {
            session_present: false,
            code: 0,
            properties: Properties::new().with(Property::ServerKeepAlive(30)),
        }),
        ProtocolVersion::V5,
    )
    .unwrap();
    assert!(
        frame.contains(&0x13),
        "expected server keep-alive property in CONNACK frame"
    );
}

#[test]
fn disconnect_encodes_reason_string() {
    let frame = encode_packet(
        &Packet::Disconnect(Disconnect {
            reason_code: 0,
            properties: Properties::new().with(Property::ReasonString("bye".into())),
        }),
        ProtocolVersion::V5,
    )
    .unwrap();
    assert!(
        frame.contains(&0x1F),
        "expected reason string property in DISCONNECT frame"
    );
}

#[test]
fn duplicate_topic_alias_rejected() {
    let mut publish = Publish::new("t", "x", QoS::AtMostOnce, false);
    publish.properties = Properties::new()
        .with(Property::TopicAlias(1))
        .with(Property::TopicAlias(2));
    // the encoder writes what it is given; the decoder enforces uniqueness
    let frame = encode_packet(&Packet::Publish(publish), ProtocolVersion::V5).unwrap();
    assert_eq!(
        decode_packet(frame[0], frame.slice(2..), ProtocolVersion::V5),
        Err(DecodeError::DuplicateProperty(0x23))
    );
}

#[test]
fn ack_reason_and_properties_round_trip() {
    let ack = Ack {
        packet_id: 77,
        reason_code: 0x10,
        properties: Properties::new().with(Property::ReasonString("no matching subscribers".into())),
    };
    let frame = encode_packet(&Packet::PubAck(ack.clone()), ProtocolVersion::V5).unwrap();
    let decoded = decode_packet(frame[0], frame.slice(2..), ProtocolVersion::V5).unwrap();
    assert_eq!(decoded, Packet::PubAck(ack));
}

#[test]
fn v3_frames_carry_no_properties() {
    let mut publish = Publish::new("topic1", "x", QoS::AtLeastOnce, false);
    publish.packet_id = Some(5);
    let v3 = encode_packet(&Packet::Publish(publish.clone()), ProtocolVersion::V3_1_1).unwrap();
    let v5 = encode_packet(&Packet::Publish(publish), ProtocolVersion::V5).unwrap();
    // the v5 frame is exactly one property-length byte longer
    assert_eq!(v5.len(), v3.len() + 1);
}
