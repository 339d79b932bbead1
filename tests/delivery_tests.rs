//! End-to-end delivery against a loopback receiver.

mod test_utils;

use std::{
    net::{Ipv4Addr, TcpListener},
    time::Duration,
};

use femtoforward::{
    ChunkBuilder, ChunkOutcome, Compression, EventTime, DeliveryError, DeliveryState, ForwardOutputBuilder, HeartbeatType,
    ServerBuilder, commit_channel,
    test_support::{AckMode, ForwardReceiver, ReceiverOptions},
};
use logtest::Logger;
use rstest::rstest;
use serde_json::json;
use serial_test::serial;
use test_utils::{chunk, output_for, receiver, record, wait_until};

const RECV: Duration = Duration::from_secs(5);

fn receiver_with(mode: AckMode) -> ForwardReceiver {
    ForwardReceiver::start(ReceiverOptions::default().with_ack_mode(mode)).expect("start receiver")
}

fn closed_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
    listener.local_addr().expect("addr").port()
}

#[rstest]
#[case::text(Compression::Text)]
#[case::gzip(Compression::Gzip)]
fn records_arrive_in_order(receiver: ForwardReceiver, #[case] compress: Compression) {
    let output = output_for(&receiver)
        .with_compress(compress)
        .build()
        .expect("build output");
    let chunk = chunk("test", &[json!({"a": 1}), json!({"a": 2})]);

    output.write(&chunk).expect("delivered");

    let message = receiver.recv_timeout(RECV).expect("message received");
    assert_eq!(message.tag, "test");
    assert!(message.packed);
    assert_eq!(message.is_compressed(), compress == Compression::Gzip);
    let records: Vec<_> = message.entries.into_iter().map(|(_, r)| r).collect();
    assert_eq!(records, vec![record(json!({"a": 1})), record(json!({"a": 2}))]);
    assert!(message.options.chunk.is_none());
}

#[rstest]
#[case::caller_built(false)]
#[case::output_built(true)]
fn time_as_integer_reaches_the_wire(receiver: ForwardReceiver, #[case] from_output: bool) {
    let output = output_for(&receiver)
        .time_as_integer(true)
        .build()
        .expect("build output");
    let mut builder = if from_output {
        output.chunk_builder("int")
    } else {
        ChunkBuilder::new("int")
    };
    builder
        .push(EventTime::new(100, 5), &record(json!({"a": 1})))
        .expect("encode event");
    let chunk = builder.build();

    output.write(&chunk).expect("delivered");

    let message = receiver.recv_timeout(RECV).expect("message received");
    assert_eq!(message.entries[0].0, EventTime::new(100, 0));
    assert_eq!(message.entries[0].1, record(json!({"a": 1})));
}

#[rstest]
fn extension_times_keep_nanoseconds_by_default(receiver: ForwardReceiver) {
    let output = output_for(&receiver).build().expect("build output");
    let mut builder = output.chunk_builder("ext");
    builder
        .push(EventTime::new(100, 5), &record(json!({"a": 1})))
        .expect("encode event");

    output.write(&builder.build()).expect("delivered");

    let message = receiver.recv_timeout(RECV).expect("message received");
    assert_eq!(message.entries[0].0, EventTime::new(100, 5));
}

#[rstest]
fn many_records_round_trip(receiver: ForwardReceiver) {
    let output = output_for(&receiver).build().expect("build output");
    let values: Vec<_> = (0..500).map(|i| json!({"seq": i, "msg": "hello"})).collect();
    output.write(&chunk("bulk", &values)).expect("delivered");

    let message = receiver.recv_timeout(RECV).expect("message received");
    let seqs: Vec<i64> = message
        .entries
        .iter()
        .filter_map(|(_, r)| r.get("seq").and_then(|v| v.as_i64()))
        .collect();
    assert_eq!(seqs, (0..500).collect::<Vec<_>>());
}

#[rstest]
fn matching_ack_commits_exactly_once() {
    let receiver = receiver_with(AckMode::Respond);
    let output = output_for(&receiver)
        .require_ack_response(true)
        .with_ack_response_timeout_ms(5_000)
        .build()
        .expect("build output");
    let chunk = chunk("acked", &[json!({"a": 1})]);
    let (handle, rx) = commit_channel();

    assert_eq!(output.deliver(&chunk, handle), DeliveryState::AwaitingAck);

    let message = receiver.recv_timeout(RECV).expect("message received");
    assert_eq!(message.options.chunk, Some(chunk.id().to_base64()));
    assert!(rx.recv_timeout(RECV).expect("outcome").is_committed());
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(output.pending_acks(), 0);
    assert!(output.nodes()[0].available());
}

#[rstest]
#[serial]
fn silent_node_times_out_once_and_is_detached() {
    let mut logger = Logger::start();
    let receiver = receiver_with(AckMode::Ignore);
    let output = output_for(&receiver)
        .require_ack_response(true)
        .with_ack_response_timeout_ms(300)
        .build()
        .expect("build output");
    let (handle, rx) = commit_channel();

    output.deliver(&chunk("slow", &[json!({"a": 1})]), handle);

    match rx.recv_timeout(RECV).expect("outcome") {
        ChunkOutcome::RolledBack(DeliveryError::AckTimeout { .. }) => {}
        other => panic!("expected ack timeout, got {other:?}"),
    }
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    assert!(!output.nodes()[0].available());

    let messages: Vec<String> = std::iter::from_fn(|| logger.pop())
        .map(|r| r.args().to_owned())
        .collect();
    assert!(
        messages
            .iter()
            .any(|m| m.contains("failed to flush the buffer chunk, timeout to commit."))
    );
    assert!(
        messages
            .iter()
            .any(|m| m.contains("no response from node. regard it as unavailable."))
    );
}

#[rstest]
fn disconnect_rolls_back_before_the_deadline() {
    let receiver = receiver_with(AckMode::Disconnect);
    let output = output_for(&receiver)
        .require_ack_response(true)
        .with_ack_response_timeout_ms(30_000)
        .build()
        .expect("build output");
    let (handle, rx) = commit_channel();

    output.deliver(&chunk("dropped", &[json!({"a": 1})]), handle);

    assert!(matches!(
        rx.recv_timeout(RECV).expect("outcome"),
        ChunkOutcome::RolledBack(DeliveryError::Disconnected { .. })
    ));
    assert!(!output.nodes()[0].available());
}

#[rstest]
fn mismatched_ack_rolls_back() {
    let receiver = receiver_with(AckMode::Mismatch);
    let output = output_for(&receiver)
        .require_ack_response(true)
        .build()
        .expect("build output");

    let err = output
        .write(&chunk("mismatch", &[json!({"a": 1})]))
        .unwrap_err();
    assert!(matches!(err, DeliveryError::AckMismatch { .. }), "{err}");
}

#[rstest]
fn refused_connection_vetoes_the_node() {
    let output = ForwardOutputBuilder::new()
        .add_server(ServerBuilder::new("127.0.0.1").with_port(closed_port()))
        .with_heartbeat_type(HeartbeatType::None)
        .with_connect_timeout_ms(500)
        .build()
        .expect("build output");
    let chunk = chunk("lost", &[json!({"a": 1})]);

    assert!(matches!(
        output.write(&chunk),
        Err(DeliveryError::Connect { .. })
    ));
    assert!(!output.nodes()[0].available());
    assert!(matches!(
        output.write(&chunk),
        Err(DeliveryError::NoAvailableNode)
    ));
}

#[rstest]
fn standby_takes_over_from_a_dead_primary(receiver: ForwardReceiver) {
    let output = ForwardOutputBuilder::new()
        .add_server(ServerBuilder::new("127.0.0.1").with_port(closed_port()))
        .add_server(
            ServerBuilder::new("127.0.0.1")
                .with_port(receiver.port())
                .standby(true),
        )
        .with_heartbeat_type(HeartbeatType::None)
        .with_connect_timeout_ms(500)
        .build()
        .expect("build output");
    let chunk = chunk("failover", &[json!({"a": 1})]);

    assert!(output.write(&chunk).is_err());
    output.write(&chunk).expect("standby accepts");
    assert_eq!(
        receiver.recv_timeout(RECV).map(|m| m.tag),
        Some("failover".to_owned())
    );
}

#[rstest]
fn closing_rolls_back_pending_acks() {
    let receiver = receiver_with(AckMode::Ignore);
    let output = output_for(&receiver)
        .require_ack_response(true)
        .with_ack_response_timeout_ms(60_000)
        .build()
        .expect("build output");
    let (handle, rx) = commit_channel();
    output.deliver(&chunk("pending", &[json!({"a": 1})]), handle);
    assert!(wait_until(RECV, || receiver.recv_timeout(Duration::ZERO).is_some()));

    output.close();

    assert!(matches!(
        rx.recv_timeout(RECV).expect("outcome"),
        ChunkOutcome::RolledBack(DeliveryError::Closed)
    ));
    assert_eq!(output.pending_acks(), 0);
}

#[rstest]
fn empty_chunks_commit_without_sending(receiver: ForwardReceiver) {
    let output = output_for(&receiver).build().expect("build output");
    output.write(&chunk("empty", &[])).expect("committed");
    assert!(receiver.recv_timeout(Duration::from_millis(200)).is_none());
}
