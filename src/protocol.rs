//! Forward protocol framing.
//!
//! Chunks are sent in *PackedForward* mode: `[tag, bin(events), options]`
//! where `events` is a concatenated MessagePack stream of `[time, record]`
//! pairs, optionally gzip compressed (*CompressedPackedForward*). Event times
//! are either plain integers or the `EventTime` extension (type 0, eight
//! bytes: big-endian seconds then nanoseconds).
//!
//! The decoding half accepts *Forward*, *PackedForward*,
//! *CompressedPackedForward* and *Message* modes so a receiver can be built on
//! the same types.

use std::{
    borrow::Cow,
    fmt,
    io::{self, Cursor, Read, Write},
    str::FromStr,
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use chrono::{DateTime, Utc};
use flate2::{Compression as GzLevel, read::MultiGzDecoder, write::GzEncoder};
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, SeqAccess, Visitor},
};
use serde_bytes::{ByteBuf, Bytes};

/// A structured log record.
pub type Record = serde_json::Map<String, serde_json::Value>;

const EVENT_TIME_EXT_TYPE: i8 = 0;
// rmp-serde encodes newtype structs with this name as MessagePack extensions.
const MSGPACK_EXT_STRUCT_NAME: &str = "_ExtStruct";

/// Payload compression applied to the event stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    #[default]
    Text,
    Gzip,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Text => "text",
            Compression::Gzip => "gzip",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Compression::Text),
            "gzip" => Ok(Compression::Gzip),
            other => Err(format!("unknown compress mode {other:?}")),
        }
    }
}

/// Second-resolution timestamp with a nanosecond fraction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventTime {
    seconds: u32,
    nanos: u32,
}

impl EventTime {
    pub const fn new(seconds: u32, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert a UTC timestamp, saturating outside the `u32` second range.
    pub fn from_datetime(datetime: DateTime<Utc>) -> Self {
        let seconds = datetime.timestamp().clamp(0, i64::from(u32::MAX)) as u32;
        Self::new(seconds, datetime.timestamp_subsec_nanos())
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn nanos(&self) -> u32 {
        self.nanos
    }

    fn to_ext_bytes(self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&self.seconds.to_be_bytes());
        bytes[4..].copy_from_slice(&self.nanos.to_be_bytes());
        bytes
    }

    fn from_ext<E: de::Error>(ext_type: i8, data: &[u8]) -> Result<Self, E> {
        if ext_type != EVENT_TIME_EXT_TYPE {
            return Err(E::custom(format!("unexpected extension type {ext_type}")));
        }
        let data: [u8; 8] = data
            .try_into()
            .map_err(|_| E::invalid_length(data.len(), &"8 bytes of EventTime"))?;
        let (seconds, nanos) = data.split_at(4);
        Ok(Self::new(
            u32::from_be_bytes(seconds.try_into().map_err(E::custom)?),
            u32::from_be_bytes(nanos.try_into().map_err(E::custom)?),
        ))
    }
}

impl Serialize for EventTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = self.to_ext_bytes();
        serializer.serialize_newtype_struct(
            MSGPACK_EXT_STRUCT_NAME,
            &(EVENT_TIME_EXT_TYPE, Bytes::new(&bytes)),
        )
    }
}

impl<'de> Deserialize<'de> for EventTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(EventTimeVisitor)
    }
}

struct EventTimeVisitor;

impl<'de> Visitor<'de> for EventTimeVisitor {
    type Value = EventTime;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an integer timestamp or an EventTime extension")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<EventTime, E> {
        let seconds = u32::try_from(value).map_err(E::custom)?;
        Ok(EventTime::new(seconds, 0))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<EventTime, E> {
        let seconds = u32::try_from(value).map_err(E::custom)?;
        Ok(EventTime::new(seconds, 0))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<EventTime, E> {
        if !(0.0..=f64::from(u32::MAX)).contains(&value) {
            return Err(E::custom(format!("timestamp {value} out of range")));
        }
        let seconds = value.trunc();
        let nanos = ((value - seconds) * 1e9).round() as u32;
        Ok(EventTime::new(seconds as u32, nanos.min(999_999_999)))
    }

    fn visit_newtype_struct<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> Result<EventTime, D::Error> {
        let (ext_type, data) = <(i8, ByteBuf)>::deserialize(deserializer)?;
        EventTime::from_ext(ext_type, &data)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<EventTime, A::Error> {
        let ext_type: i8 = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let data: ByteBuf = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        EventTime::from_ext(ext_type, &data)
    }
}

/// Time written either as the extension type or as integer seconds.
struct WireTime {
    time: EventTime,
    as_integer: bool,
}

impl Serialize for WireTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.as_integer {
            serializer.serialize_u32(self.time.seconds)
        } else {
            self.time.serialize(serializer)
        }
    }
}

/// Opaque identifier echoed back by the destination in its ack.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId([u8; 16]);

impl ChunkId {
    /// Generate a random identifier.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Wire representation used in the `chunk` option and the ack.
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({self})")
    }
}

/// A tagged batch of serialised events ready for delivery.
#[derive(Clone, Debug)]
pub struct Chunk {
    id: ChunkId,
    tag: String,
    events: Vec<u8>,
    size: usize,
    integer_times: bool,
}

impl Chunk {
    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Number of events in the chunk.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Raw MessagePack event stream.
    pub fn events(&self) -> &[u8] {
        &self.events
    }

    /// Decode the events back into `(time, record)` pairs.
    pub fn entries(&self) -> io::Result<Vec<(EventTime, Record)>> {
        decode_event_stream(&self.events)
    }

    /// Whether event times are encoded as integer seconds.
    pub fn has_integer_times(&self) -> bool {
        self.integer_times
    }

    /// Re-encode the events with integer-second times, keeping the id.
    pub fn with_integer_times(&self) -> io::Result<Chunk> {
        let mut builder = ChunkBuilder::new(self.tag.clone()).time_as_integer(true);
        for (time, record) in self.entries()? {
            builder.push(time, &record)?;
        }
        Ok(Chunk {
            id: self.id,
            ..builder.build()
        })
    }
}

/// Accumulates events for one tag into a [`Chunk`].
#[derive(Debug)]
pub struct ChunkBuilder {
    tag: String,
    events: Vec<u8>,
    size: usize,
    time_as_integer: bool,
}

impl ChunkBuilder {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            events: Vec::with_capacity(256),
            size: 0,
            time_as_integer: false,
        }
    }

    /// Encode times as integer seconds instead of the `EventTime` extension.
    pub fn time_as_integer(mut self, enabled: bool) -> Self {
        self.time_as_integer = enabled;
        self
    }

    /// Append one event.
    pub fn push(&mut self, time: EventTime, record: &Record) -> io::Result<()> {
        let time = WireTime {
            time,
            as_integer: self.time_as_integer,
        };
        rmp_serde::encode::write_named(&mut self.events, &(time, record))
            .map_err(io::Error::other)?;
        self.size += 1;
        Ok(())
    }

    /// Chaining variant of [`push`](Self::push).
    pub fn with_event(mut self, time: EventTime, record: &Record) -> io::Result<Self> {
        self.push(time, record)?;
        Ok(self)
    }

    pub fn build(self) -> Chunk {
        Chunk {
            id: ChunkId::generate(),
            tag: self.tag,
            events: self.events,
            size: self.size,
            integer_times: self.time_as_integer,
        }
    }
}

/// Options map trailing every forward message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed: Option<String>,
}

/// Acknowledgement returned by the destination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub ack: String,
}

/// Encode a chunk as a PackedForward (or CompressedPackedForward) message.
pub fn encode_packed_forward(
    chunk: &Chunk,
    compression: Compression,
    require_ack: bool,
) -> io::Result<Vec<u8>> {
    let events: Cow<'_, [u8]> = match compression {
        Compression::Text => Cow::Borrowed(chunk.events()),
        Compression::Gzip => Cow::Owned(gzip(chunk.events())?),
    };
    let options = MessageOptions {
        size: Some(chunk.size() as u64),
        chunk: require_ack.then(|| chunk.id().to_base64()),
        compressed: (compression == Compression::Gzip).then(|| "gzip".to_owned()),
    };
    rmp_serde::to_vec_named(&(chunk.tag(), Bytes::new(&events), &options))
        .map_err(io::Error::other)
}

/// A decoded forward message.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardMessage {
    pub tag: String,
    pub entries: Vec<(EventTime, Record)>,
    pub options: MessageOptions,
    /// Whether the events arrived as a packed binary stream.
    pub packed: bool,
}

impl ForwardMessage {
    /// The ack expected by the sender, when one was requested.
    pub fn ack(&self) -> Option<AckResponse> {
        self.options
            .chunk
            .clone()
            .map(|chunk| AckResponse { ack: chunk })
    }

    pub fn is_compressed(&self) -> bool {
        self.options.compressed.as_deref() == Some("gzip")
    }
}

/// Read one forward message from a stream.
pub fn read_message<R: Read>(reader: R) -> io::Result<ForwardMessage> {
    let raw: RawMessage = rmp_serde::from_read(reader).map_err(decode_error)?;
    raw.into_message()
}

/// Decode one forward message from a byte slice.
pub fn decode_message(bytes: &[u8]) -> io::Result<ForwardMessage> {
    read_message(Cursor::new(bytes))
}

/// Decode a concatenated `[time, record]` MessagePack stream.
pub fn decode_event_stream(bytes: &[u8]) -> io::Result<Vec<(EventTime, Record)>> {
    let mut cursor = Cursor::new(bytes);
    let mut entries = Vec::new();
    while (cursor.position() as usize) < bytes.len() {
        let entry: (EventTime, Record) =
            rmp_serde::from_read(&mut cursor).map_err(decode_error)?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Map decode failures to I/O errors, preserving the kind of transport errors
/// so callers can tell a timeout from a closed connection.
pub(crate) fn decode_error(err: rmp_serde::decode::Error) -> io::Error {
    use rmp_serde::decode::Error;
    match err {
        Error::InvalidMarkerRead(io) | Error::InvalidDataRead(io) => io,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

pub(crate) fn gzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), GzLevel::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub(crate) fn gunzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    MultiGzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

enum Body {
    Packed(Vec<u8>),
    Entries(Vec<(EventTime, Record)>),
    Time(EventTime),
}

impl<'de> Deserialize<'de> for Body {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(BodyVisitor)
    }
}

struct BodyVisitor;

impl<'de> Visitor<'de> for BodyVisitor {
    type Value = Body;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a packed event stream, an entry array or an event time")
    }

    fn visit_bytes<E: de::Error>(self, value: &[u8]) -> Result<Body, E> {
        Ok(Body::Packed(value.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, value: Vec<u8>) -> Result<Body, E> {
        Ok(Body::Packed(value))
    }

    // Some senders pack the event stream into a str.
    fn visit_str<E: de::Error>(self, value: &str) -> Result<Body, E> {
        Ok(Body::Packed(value.as_bytes().to_vec()))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Body, A::Error> {
        let mut entries = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(entry) = seq.next_element::<(EventTime, Record)>()? {
            entries.push(entry);
        }
        Ok(Body::Entries(entries))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Body, E> {
        EventTimeVisitor.visit_u64(value).map(Body::Time)
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Body, E> {
        EventTimeVisitor.visit_i64(value).map(Body::Time)
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<Body, E> {
        EventTimeVisitor.visit_f64(value).map(Body::Time)
    }

    fn visit_newtype_struct<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> Result<Body, D::Error> {
        EventTimeVisitor
            .visit_newtype_struct(deserializer)
            .map(Body::Time)
    }
}

struct RawMessage {
    tag: String,
    body: Body,
    record: Option<Record>,
    options: Option<MessageOptions>,
}

impl RawMessage {
    fn into_message(self) -> io::Result<ForwardMessage> {
        let options = self.options.unwrap_or_default();
        let (entries, packed) = match self.body {
            Body::Entries(entries) => (entries, false),
            Body::Time(time) => {
                let record = self.record.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "message mode without record")
                })?;
                (vec![(time, record)], false)
            }
            Body::Packed(bytes) => {
                let stream = if options.compressed.as_deref() == Some("gzip") {
                    gunzip(&bytes)?
                } else {
                    bytes
                };
                (decode_event_stream(&stream)?, true)
            }
        };
        Ok(ForwardMessage {
            tag: self.tag,
            entries,
            options,
            packed,
        })
    }
}

impl<'de> Deserialize<'de> for RawMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(RawMessageVisitor)
    }
}

struct RawMessageVisitor;

impl<'de> Visitor<'de> for RawMessageVisitor {
    type Value = RawMessage;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a forward protocol message array")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<RawMessage, A::Error> {
        let tag: String = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let body: Body = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        let record = match body {
            Body::Time(_) => Some(
                seq.next_element::<Record>()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?,
            ),
            _ => None,
        };
        let options = seq.next_element::<Option<MessageOptions>>()?.flatten();
        Ok(RawMessage {
            tag,
            body,
            record,
            options,
        })
    }
}
