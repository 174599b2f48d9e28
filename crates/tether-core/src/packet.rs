use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u16(self.0)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VersionVisitor;

        impl<'de> Visitor<'de> for VersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u16::try_from(value)
                    .map(ProtocolVersion)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!("negative protocol version: {value}")));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value
                    .trim()
                    .trim_start_matches('v')
                    .parse::<u16>()
                    .map(ProtocolVersion)
                    .map_err(|err| E::custom(format!("invalid protocol version '{value}': {err}")))
            }
        }

        deserializer.deserialize_any(VersionVisitor)
    }
}

/// Command vocabulary shared by the hub and its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Ping,
    Pong,
    NewData,
    NewDataAck,
    Subscribe,
    SubscribeAck,
    Publish,
    PublishAck,
    Error,
}

impl Command {
    /// The command a well-behaved peer answers this request with.
    pub fn response(self) -> Option<Command> {
        match self {
            Command::Ping => Some(Command::Pong),
            Command::NewData => Some(Command::NewDataAck),
            Command::Subscribe => Some(Command::SubscribeAck),
            Command::Publish => Some(Command::PublishAck),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::NewData => "new_data",
            Command::NewDataAck => "new_data_ack",
            Command::Subscribe => "subscribe",
            Command::SubscribeAck => "subscribe_ack",
            Command::Publish => "publish",
            Command::PublishAck => "publish_ack",
            Command::Error => "error",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request or response on the wire.
///
/// Responses echo the `seq` of the request they answer, which lets a reader
/// discard answers to rounds it already gave up on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Packet {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub command: Command,
    #[serde(default)]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
}

impl Packet {
    pub fn new(command: Command, seq: u64) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            command,
            seq,
            topic: None,
            data: String::new(),
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Builds the answer to `self`, carrying the same sequence number.
    pub fn reply(&self, command: Command) -> Packet {
        Packet::new(command, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("stream io failed: {0}")]
    Io(#[from] io::Error),
    #[error("stream closed by peer")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Encodes `packet` as one line and flushes it.
pub async fn send_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), PacketError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(packet, DEFAULT_MAX_FRAME_BYTES)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next packet, skipping blank lines.
///
/// A line that does not decode is returned as an error rather than skipped:
/// to the caller a garbage answer is a failed round, not noise. A line longer
/// than `max_frame_bytes` is rejected as soon as the limit is crossed, before
/// its newline arrives.
pub async fn read_packet<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Packet, PacketError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut pending = Vec::new();
    read_packet_buffered(reader, &mut pending, max_frame_bytes).await
}

/// Like [`read_packet`], but bytes of an unfinished line are kept in
/// `pending`, so dropping the future part-way through a line loses nothing
/// and the next call resumes where this one stopped.
pub async fn read_packet_buffered<R>(
    reader: &mut R,
    pending: &mut Vec<u8>,
    max_frame_bytes: usize,
) -> Result<Packet, PacketError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    loop {
        read_line_capped(reader, pending, max_frame_bytes).await?;
        let line = std::mem::take(pending);
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        return Ok(decode_frame(&line, max_frame_bytes)?);
    }
}

async fn read_line_capped<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max_frame_bytes: usize,
) -> Result<(), PacketError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    // Room for the trailing "\r\n"; decode_frame applies the exact limit.
    let cap = max_frame_bytes.saturating_add(2);
    loop {
        let (used, done, oversized) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                if line.is_empty() {
                    return Err(PacketError::Closed);
                }
                return Ok(());
            }
            let (used, done) = match available.iter().position(|b| *b == b'\n') {
                Some(idx) => (idx + 1, true),
                None => (available.len(), false),
            };
            let oversized = line.len() + used > cap;
            if !oversized {
                line.extend_from_slice(&available[..used]);
            }
            (used, done, oversized)
        };
        reader.consume(used);
        if oversized {
            // Dropped, like the pending buffer of a frame decoder.
            let size = line.len() + used;
            line.clear();
            return Err(FrameError::OversizedFrame {
                size,
                max: max_frame_bytes,
            }
            .into());
        }
        if done {
            return Ok(());
        }
    }
}

/// Checks that `packet` carries `expected`.
///
/// On mismatch, when a writer is supplied, the peer is told what was expected
/// through an `Error` packet. Failing to deliver that notice does not change
/// the verdict.
pub async fn command_ok<W>(packet: &Packet, expected: Command, writer: Option<&mut W>) -> bool
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if packet.command == expected {
        return true;
    }
    if let Some(writer) = writer {
        let notice = packet
            .reply(Command::Error)
            .with_data(format!("expected {expected}, got {}", packet.command));
        if let Err(err) = send_packet(writer, &notice).await {
            debug!(event = "command_error_notice_failed", error = %err);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, BufReader};

    #[test]
    fn packet_wire_shape_is_snake_case_ndjson() {
        let packet = Packet::new(Command::NewDataAck, 7);
        let frame = encode_frame(&packet, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let text = String::from_utf8(frame).expect("utf8");
        assert_eq!(text, "{\"version\":1,\"command\":\"new_data_ack\",\"seq\":7}\n");

        let publish = Packet::new(Command::Publish, 2)
            .with_topic("prices")
            .with_data("42");
        let frame = encode_frame(&publish, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let decoded: Packet = decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, publish);
    }

    #[test]
    fn version_field_accepts_string_number_and_missing() {
        let string_version: Packet =
            serde_json::from_str(r#"{"version":"v1","command":"ping","seq":1}"#)
                .expect("parse string version");
        assert_eq!(string_version.version, ProtocolVersion(1));

        let numeric_version: Packet =
            serde_json::from_str(r#"{"version":1,"command":"ping"}"#).expect("parse numeric");
        assert_eq!(numeric_version.version, ProtocolVersion(1));
        assert_eq!(numeric_version.seq, 0);

        let missing_version: Packet =
            serde_json::from_str(r#"{"command":"pong","seq":3}"#).expect("parse missing");
        assert_eq!(missing_version.version, ProtocolVersion::CURRENT);

        assert!(serde_json::from_str::<Packet>(r#"{"version":-1,"command":"ping"}"#).is_err());
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let packet = Packet::new(Command::NewData, 1).with_data("x".repeat(128));
        let result = encode_frame(&packet, 64);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }

    #[test]
    fn responses_pair_with_requests() {
        assert_eq!(Command::Ping.response(), Some(Command::Pong));
        assert_eq!(Command::NewData.response(), Some(Command::NewDataAck));
        assert_eq!(Command::Pong.response(), None);
        let reply = Packet::new(Command::Ping, 11).reply(Command::Pong);
        assert_eq!(reply.seq, 11);
        assert_eq!(reply.command, Command::Pong);
    }

    #[tokio::test]
    async fn read_packet_skips_blank_lines_and_reports_garbage() {
        let (client, server) = duplex(1024);
        let (_, mut client_writer) = tokio::io::split(client);
        let (server_reader, _server_writer) = tokio::io::split(server);
        let mut reader = BufReader::new(server_reader);

        client_writer.write_all(b"\n  \n").await.expect("blank");
        send_packet(&mut client_writer, &Packet::new(Command::Pong, 4))
            .await
            .expect("send");
        client_writer.write_all(b"not json\n").await.expect("garbage");
        drop(client_writer);

        let packet = read_packet(&mut reader, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("first packet");
        assert_eq!(packet.command, Command::Pong);
        assert_eq!(packet.seq, 4);

        let garbage = read_packet(&mut reader, DEFAULT_MAX_FRAME_BYTES).await;
        assert!(matches!(garbage, Err(PacketError::Frame(FrameError::Decode(_)))));
    }

    #[tokio::test]
    async fn read_packet_rejects_unterminated_line_past_limit() {
        let (mut client, server) = duplex(4096);
        let mut reader = BufReader::new(server);
        tokio::spawn(async move {
            let chunk = vec![b'x'; 4096];
            for _ in 0..128 {
                if client.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            client
        });

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            read_packet(&mut reader, 64),
        )
        .await
        .expect("rejected without waiting for a newline");
        assert!(matches!(
            result,
            Err(PacketError::Frame(FrameError::OversizedFrame { max: 64, .. }))
        ));
    }

    #[tokio::test]
    async fn buffered_read_resumes_after_cancellation() {
        let (mut client, server) = duplex(1024);
        let mut reader = BufReader::new(server);
        let mut pending = Vec::new();

        client
            .write_all(br#"{"command":"pong","#)
            .await
            .expect("first half");
        let cut = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            read_packet_buffered(&mut reader, &mut pending, DEFAULT_MAX_FRAME_BYTES),
        )
        .await;
        assert!(cut.is_err());
        assert!(!pending.is_empty());

        client
            .write_all(b"\"seq\":3}\n")
            .await
            .expect("second half");
        let packet = read_packet_buffered(&mut reader, &mut pending, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("whole packet");
        assert_eq!(packet.command, Command::Pong);
        assert_eq!(packet.seq, 3);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn read_packet_reports_closed_stream() {
        let (client, server) = duplex(64);
        drop(client);
        let mut reader = BufReader::new(server);
        let result = read_packet(&mut reader, DEFAULT_MAX_FRAME_BYTES).await;
        assert!(matches!(result, Err(PacketError::Closed)));
    }

    #[tokio::test]
    async fn command_ok_notifies_peer_on_mismatch() {
        let (client, server) = duplex(1024);
        let mut server = server;
        let mut client = BufReader::new(client);

        let pong = Packet::new(Command::Pong, 9);
        assert!(command_ok(&pong, Command::Pong, Some(&mut server)).await);
        assert!(!command_ok(&pong, Command::NewDataAck, Some(&mut server)).await);
        assert!(!command_ok::<tokio::io::DuplexStream>(&pong, Command::Ping, None).await);
        drop(server);

        let notice = read_packet(&mut client, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("error notice");
        assert_eq!(notice.command, Command::Error);
        assert_eq!(notice.seq, 9);
        assert_eq!(notice.data, "expected new_data_ack, got pong");
        let eof = read_packet(&mut client, DEFAULT_MAX_FRAME_BYTES).await;
        assert!(matches!(eof, Err(PacketError::Closed)));
    }
}
