//! Heartbeat strategies driving node availability.

mod test_utils;

use std::{
    net::{Ipv4Addr, TcpListener},
    time::Duration,
};

use femtoforward::{
    Acceptor, ForwardOutputBuilder, HeartbeatType, ServerBuilder,
    test_support::{ForwardReceiver, ReceiverOptions},
};
use rstest::rstest;
use test_utils::{receiver, wait_until};

const WAIT: Duration = Duration::from_secs(5);

fn heartbeating(port: u16, kind: HeartbeatType) -> ForwardOutputBuilder {
    ForwardOutputBuilder::new()
        .add_server(ServerBuilder::new("127.0.0.1").with_port(port))
        .with_heartbeat_type(kind)
        .with_heartbeat_interval_ms(50)
        .with_send_timeout_ms(1_000)
}

#[rstest]
fn tcp_heartbeats_feed_the_detector(receiver: ForwardReceiver) {
    let output = heartbeating(receiver.port(), HeartbeatType::Tcp)
        .build()
        .expect("build output");
    assert!(output.is_running());
    assert!(wait_until(WAIT, || receiver.connections() >= 3));
    assert!(wait_until(WAIT, || output.node_statuses()[0].sample_size >= 3));
    assert!(output.nodes()[0].available());
}

#[rstest]
fn tcp_heartbeats_authenticate() {
    let receiver = ForwardReceiver::start(
        ReceiverOptions::default().with_acceptor(Acceptor::new("in.localhost", "secret")),
    )
    .expect("start receiver");
    let output = heartbeating(receiver.port(), HeartbeatType::Tcp)
        .with_security("out.localhost", "secret")
        .build()
        .expect("build output");
    assert!(wait_until(WAIT, || output.node_statuses()[0].sample_size >= 3));
    assert_eq!(receiver.handshake_failures(), 0);
}

#[rstest]
fn udp_heartbeats_send_a_null_byte_and_count_replies() {
    let receiver =
        ForwardReceiver::start(ReceiverOptions::default().with_udp()).expect("start receiver");
    let output = heartbeating(receiver.port(), HeartbeatType::Udp)
        .build()
        .expect("build output");
    assert!(wait_until(WAIT, || receiver.udp_pings() >= 3));
    assert!(wait_until(WAIT, || output.node_statuses()[0].sample_size >= 3));
    assert_eq!(receiver.connections(), 0);
}

#[rstest]
fn heartbeat_none_sends_nothing(receiver: ForwardReceiver) {
    let output = heartbeating(receiver.port(), HeartbeatType::None)
        .build()
        .expect("build output");
    assert!(!output.is_running());
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(receiver.connections(), 0);
    assert_eq!(output.node_statuses()[0].sample_size, 1);
}

#[rstest]
fn unreachable_node_is_detached_after_the_hard_timeout() {
    let port = {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let output = heartbeating(port, HeartbeatType::Tcp)
        .with_hard_timeout_ms(300)
        .build()
        .expect("build output");
    assert!(wait_until(WAIT, || !output.nodes()[0].available()));
}

#[rstest]
fn vetoed_node_recovers_through_heartbeats(receiver: ForwardReceiver) {
    let output = heartbeating(receiver.port(), HeartbeatType::Tcp)
        .with_recover_wait_ms(200)
        .build()
        .expect("build output");
    output.nodes()[0].disable("simulated write failure");
    assert!(!output.nodes()[0].available());
    assert!(wait_until(WAIT, || output.nodes()[0].available()));
}
