//! Client side of the hub protocol.
//!
//! A subscriber performs [`subscribe`] once and then hands its stream to
//! [`respond`], which keeps the hub's liveness checks satisfied and passes
//! every delivered message to a callback. Publishers use [`Publisher`].

use crate::packet::{read_packet, send_packet, Command, Packet, PacketError, DEFAULT_MAX_FRAME_BYTES};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("hub answered {command}: {detail}")]
    Rejected { command: Command, detail: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RespondSummary {
    pub pings: u64,
    pub messages: u64,
}

/// Sends the subscribe handshake for `topic` and waits for the hub to accept it.
pub async fn subscribe<R, W>(reader: &mut R, writer: &mut W, topic: &str) -> Result<(), ClientError>
where
    R: AsyncBufRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let request = Packet::new(Command::Subscribe, 1).with_topic(topic);
    send_packet(writer, &request).await?;
    let response = read_packet(reader, DEFAULT_MAX_FRAME_BYTES).await?;
    if response.command != Command::SubscribeAck {
        return Err(ClientError::Rejected {
            command: response.command,
            detail: response.data,
        });
    }
    Ok(())
}

/// Answers PING with PONG and NEW_DATA with NEW_DATA_ACK until the hub hangs up.
///
/// Undecodable lines are dropped. A clean EOF ends the loop with the totals.
pub async fn respond<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    mut on_message: F,
) -> Result<RespondSummary, PacketError>
where
    R: AsyncBufRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(String),
{
    let mut summary = RespondSummary::default();
    loop {
        let packet = match read_packet(reader, DEFAULT_MAX_FRAME_BYTES).await {
            Ok(packet) => packet,
            Err(PacketError::Closed) => return Ok(summary),
            Err(PacketError::Frame(err)) => {
                debug!(event = "responder_decode_error", error = %err);
                continue;
            }
            Err(err) => return Err(err),
        };
        match packet.command {
            Command::Ping => {
                summary.pings += 1;
                send_packet(writer, &packet.reply(Command::Pong)).await?;
            }
            Command::NewData => {
                summary.messages += 1;
                let ack = packet.reply(Command::NewDataAck);
                on_message(packet.data);
                send_packet(writer, &ack).await?;
            }
            other => {
                warn!(event = "responder_unexpected_command", command = %other, seq = packet.seq);
            }
        }
    }
}

/// Publishing end of a hub connection.
pub struct Publisher<R, W> {
    reader: R,
    writer: W,
    seq: u64,
}

impl<R, W> Publisher<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            seq: 0,
        }
    }

    /// Publishes `message` on `topic`, returning how many subscribers acknowledged it.
    pub async fn publish(&mut self, topic: &str, message: &str) -> Result<u64, ClientError> {
        self.seq += 1;
        let request = Packet::new(Command::Publish, self.seq)
            .with_topic(topic)
            .with_data(message);
        send_packet(&mut self.writer, &request).await?;
        let response = read_packet(&mut self.reader, DEFAULT_MAX_FRAME_BYTES).await?;
        if response.command != Command::PublishAck {
            return Err(ClientError::Rejected {
                command: response.command,
                detail: response.data,
            });
        }
        response
            .data
            .trim()
            .parse::<u64>()
            .map_err(|err| ClientError::Rejected {
                command: response.command,
                detail: format!("invalid delivered count '{}': {err}", response.data),
            })
    }
}
