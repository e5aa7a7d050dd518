//! Session persistence across reconnects: DUP replay with preserved packet
//! ids, PUBREL continuation for half-finished QoS2 transactions, and
//! receiver-side QoS2 duplicate suppression.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWriteExt, DuplexStream};

use photon::protocol::{
    encode_packet, read_packet, Ack, ConnAck, Packet, Properties, ProtocolVersion, Publish,
};
use photon::{ConnectOptions, Endpoint, EndpointError, QoS};

type Trace = Arc<Mutex<Vec<&'static str>>>;

fn trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(trace: &Trace, event: &'static str) {
    trace.lock().unwrap().push(event);
}

async fn send(io: &mut DuplexStream, packet: Packet, version: ProtocolVersion) {
    io.write_all(&encode_packet(&packet, version).unwrap())
        .await
        .unwrap();
}

async fn recv(io: &mut DuplexStream, version: ProtocolVersion) -> Packet {
    read_packet(io, version).await.unwrap()
}

fn connack(session_present: bool) -> Packet {
    Packet::ConnAck(ConnAck {
        session_present,
        code: 0,
        properties: Properties::default(),
    })
}

#[tokio::test]
async fn stored_publishes_replay_with_dup_after_resume() {
    const V: ProtocolVersion = ProtocolVersion::V3_1_1;

    // First connection: a QoS1 and a QoS2 publish go out, the QoS2 exchange
    // reaches PUBREL, then the broker vanishes.
    let (client_io, mut broker) = tokio::io::duplex(4096);
    let broker_task = tokio::spawn(async move {
        let Packet::Connect(_) = recv(&mut broker, V).await else {
            panic!("expected CONNECT");
        };
        send(&mut broker, connack(false), V).await;

        let Packet::Publish(p1) = recv(&mut broker, V).await else {
            panic!("expected first PUBLISH");
        };
        assert_eq!(p1.qos, QoS::AtLeastOnce);
        let qos1_id = p1.packet_id.unwrap();

        let Packet::Publish(p2) = recv(&mut broker, V).await else {
            panic!("expected second PUBLISH");
        };
        assert_eq!(p2.qos, QoS::ExactlyOnce);
        let qos2_id = p2.packet_id.unwrap();
        assert_ne!(qos1_id, qos2_id);

        send(&mut broker, Packet::PubRec(Ack::new(qos2_id)), V).await;
        let Packet::PubRel(rel) = recv(&mut broker, V).await else {
            panic!("expected PUBREL");
        };
        assert_eq!(rel.packet_id, qos2_id);
        // connection drops here
        (qos1_id, qos2_id)
    });

    let mut ep = Endpoint::new(client_io, V);
    let events = trace();

    let t = events.clone();
    ep.set_connack_handler(move |ops, session_present, _code| {
        record(&t, "connack");
        assert!(!session_present);
        ops.publish("topic1", "m1", QoS::AtLeastOnce, false).unwrap();
        ops.publish("topic1", "m2", QoS::ExactlyOnce, false).unwrap();
        true
    });
    let t = events.clone();
    ep.set_pubrec_handler(move |_ops, _pid| {
        record(&t, "pubrec");
        true
    });

    ep.connect(ConnectOptions::new("cid1")).await.unwrap();
    let err = ep.run().await.unwrap_err();
    assert!(matches!(err, EndpointError::Transport(_)));
    let (qos1_id, qos2_id) = broker_task.await.unwrap();

    let session = ep.into_session();
    assert_eq!(session.store.len(), 2);

    // Second connection: the broker reports a preserved session; the QoS1
    // publish replays with DUP and its original id, the half-finished QoS2
    // transaction continues from PUBREL, not from PUBLISH.
    let (client_io, mut broker) = tokio::io::duplex(4096);
    let broker_task = tokio::spawn(async move {
        let Packet::Connect(connect) = recv(&mut broker, V).await else {
            panic!("expected CONNECT");
        };
        assert!(!connect.clean_start);
        send(&mut broker, connack(true), V).await;

        let Packet::Publish(replayed) = recv(&mut broker, V).await else {
            panic!("expected replayed PUBLISH");
        };
        assert!(replayed.dup, "replay must set DUP");
        assert_eq!(replayed.packet_id, Some(qos1_id));
        assert_eq!(replayed.payload, "m1");

        let Packet::PubRel(rel) = recv(&mut broker, V).await else {
            panic!("expected replayed PUBREL");
        };
        assert_eq!(rel.packet_id, qos2_id);

        send(&mut broker, Packet::PubAck(Ack::new(qos1_id)), V).await;
        send(&mut broker, Packet::PubComp(Ack::new(qos2_id)), V).await;

        let Packet::Disconnect(_) = recv(&mut broker, V).await else {
            panic!("expected DISCONNECT");
        };
    });

    let mut ep = Endpoint::new(client_io, V);
    ep.restore_session(session);

    let events = trace();
    let t = events.clone();
    let done = Arc::new(AtomicUsize::new(0));
    let d = done.clone();
    ep.set_puback_handler(move |ops, _pid| {
        record(&t, "puback");
        if d.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            ops.disconnect().unwrap();
        }
        true
    });
    let t = events.clone();
    let d = done.clone();
    ep.set_pubcomp_handler(move |ops, _pid| {
        record(&t, "pubcomp");
        if d.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            ops.disconnect().unwrap();
        }
        true
    });

    ep.connect(ConnectOptions::new("cid1").with_clean_start(false))
        .await
        .unwrap();
    ep.run().await.unwrap();
    broker_task.await.unwrap();

    assert_eq!(events.lock().unwrap().as_slice(), ["puback", "pubcomp"]);
    assert!(ep.session().store.is_empty());
    assert!(ep.session().pid.is_empty());
}

#[tokio::test]
async fn qos2_duplicate_delivery_suppressed() {
    const V: ProtocolVersion = ProtocolVersion::V3_1_1;
    let (client_io, mut broker) = tokio::io::duplex(4096);

    let pubrec_count = Arc::new(AtomicUsize::new(0));
    let seen = pubrec_count.clone();
    let broker_task = tokio::spawn(async move {
        let Packet::Connect(_) = recv(&mut broker, V).await else {
            panic!("expected CONNECT");
        };
        send(&mut broker, connack(false), V).await;

        let mut publish = Publish::new("topic1", "once", QoS::ExactlyOnce, false);
        publish.packet_id = Some(9);
        send(&mut broker, Packet::Publish(publish.clone()), V).await;

        let Packet::PubRec(rec) = recv(&mut broker, V).await else {
            panic!("expected PUBREC");
        };
        assert_eq!(rec.packet_id, 9);
        seen.fetch_add(1, Ordering::SeqCst);

        // duplicate delivery before PUBREL
        publish.dup = true;
        send(&mut broker, Packet::Publish(publish), V).await;

        let Packet::PubRec(rec) = recv(&mut broker, V).await else {
            panic!("expected repeated PUBREC");
        };
        assert_eq!(rec.packet_id, 9);
        seen.fetch_add(1, Ordering::SeqCst);

        send(&mut broker, Packet::PubRel(Ack::new(9)), V).await;
        let Packet::PubComp(comp) = recv(&mut broker, V).await else {
            panic!("expected PUBCOMP");
        };
        assert_eq!(comp.packet_id, 9);

        // release the client
        send(
            &mut broker,
            Packet::Publish(Publish::new("done", "", QoS::AtMostOnce, false)),
            V,
        )
        .await;

        let Packet::Disconnect(_) = recv(&mut broker, V).await else {
            panic!("expected DISCONNECT");
        };
    });

    let mut ep = Endpoint::new(client_io, V);
    let delivered = Arc::new(AtomicUsize::new(0));
    let res_sent = Arc::new(AtomicUsize::new(0));

    let d = delivered.clone();
    ep.set_publish_handler(move |ops, is_dup, _qos, _retain, _pid, topic, _payload| {
        if topic == "done" {
            ops.disconnect().unwrap();
            return true;
        }
        assert!(!is_dup);
        d.fetch_add(1, Ordering::SeqCst);
        true
    });
    let r = res_sent.clone();
    ep.set_pub_res_sent_handler(move |packet_id| {
        assert_eq!(packet_id, 9);
        r.fetch_add(1, Ordering::SeqCst);
    });

    ep.connect(ConnectOptions::new("cid1")).await.unwrap();
    ep.run().await.unwrap();
    broker_task.await.unwrap();

    // exactly one handler delivery for the duplicated packet id
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    // but a PUBREC went out for each delivery
    assert_eq!(pubrec_count.load(Ordering::SeqCst), 2);
    assert_eq!(res_sent.load(Ordering::SeqCst), 2);
    assert!(ep.session().recv_qos2.is_empty());
}

#[tokio::test]
async fn unexpected_ack_is_a_protocol_error() {
    const V: ProtocolVersion = ProtocolVersion::V3_1_1;
    let (client_io, mut broker) = tokio::io::duplex(4096);

    let broker_task = tokio::spawn(async move {
        let Packet::Connect(_) = recv(&mut broker, V).await else {
            panic!("expected CONNECT");
        };
        send(&mut broker, connack(false), V).await;
        // an ack for an id that was never published
        send(&mut broker, Packet::PubAck(Ack::new(41)), V).await;
        // client tears down; swallow anything until EOF
        while read_packet(&mut broker, V).await.is_ok() {}
    });

    let mut ep = Endpoint::new(client_io, V);
    let errors = Arc::new(AtomicUsize::new(0));
    let e = errors.clone();
    ep.set_error_handler(move |err| {
        assert!(matches!(err, EndpointError::Protocol(_)));
        e.fetch_add(1, Ordering::SeqCst);
    });

    ep.connect(ConnectOptions::new("cid1")).await.unwrap();
    let err = ep.run().await.unwrap_err();
    assert!(matches!(err, EndpointError::Protocol(_)));
    broker_task.await.unwrap();
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dup_publish_with_conflicting_store_entry_is_rejected() {
    const V: ProtocolVersion = ProtocolVersion::V3_1_1;
    let (client_io, mut broker) = tokio::io::duplex(4096);

    let broker_task = tokio::spawn(async move {
        let Packet::Connect(_) = recv(&mut broker, V).await else {
            panic!("expected CONNECT");
        };
        send(&mut broker, connack(false), V).await;
        let Packet::Publish(_) = recv(&mut broker, V).await else {
            panic!("expected PUBLISH");
        };
        let Packet::Disconnect(_) = recv(&mut broker, V).await else {
            panic!("expected DISCONNECT");
        };
    });

    let mut ep = Endpoint::new(client_io, V);
    ep.set_connack_handler(move |ops, _sp, _code| {
        ops.register_packet_id(11).unwrap();
        ops.publish_dup(11, "topic1", "m", QoS::AtLeastOnce).unwrap();
        // the id already tracks an in-flight publish
        assert!(matches!(
            ops.publish_dup(11, "topic1", "m", QoS::AtLeastOnce),
            Err(EndpointError::PacketIdConflict(11))
        ));
        ops.disconnect().unwrap();
        true
    });

    ep.connect(ConnectOptions::new("cid1")).await.unwrap();
    ep.run().await.unwrap();
    broker_task.await.unwrap();
}
