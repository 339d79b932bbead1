//! Fixtures pairing a loopback [`ForwardReceiver`] with outputs pointed at it.

use std::{
    thread,
    time::{Duration, Instant},
};

use femtoforward::{
    Chunk, ChunkBuilder, EventTime, ForwardOutputBuilder, HeartbeatType, Record, ServerBuilder,
    test_support::ForwardReceiver,
};
use rstest::fixture;
use serde_json::Value;

/// Build a record from a JSON object literal.
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("records must be objects, got {other}"),
    }
}

/// A chunk holding `records` in order, one second apart.
pub fn chunk(tag: &str, records: &[Value]) -> Chunk {
    let mut builder = ChunkBuilder::new(tag);
    for (i, value) in records.iter().enumerate() {
        builder
            .push(EventTime::new(1_700_000_000 + i as u32, 0), &record(value.clone()))
            .expect("encode event");
    }
    builder.build()
}

/// A receiver that answers acks.
#[fixture]
pub fn receiver() -> ForwardReceiver {
    ForwardReceiver::start_default().expect("start receiver")
}

/// Builder with short timeouts and no heartbeats, pointed at `receiver`.
pub fn output_for(receiver: &ForwardReceiver) -> ForwardOutputBuilder {
    ForwardOutputBuilder::new()
        .add_server(ServerBuilder::new("127.0.0.1").with_port(receiver.port()))
        .with_heartbeat_type(HeartbeatType::None)
        .with_heartbeat_interval_ms(50)
        .with_send_timeout_ms(2_000)
}

/// Poll `predicate` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
