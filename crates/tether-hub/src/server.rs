use crate::broker::{Broker, BrokerConfig};
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tether_core::{
    command_ok, read_packet, send_packet, Command, Packet, PacketError, CURRENT_PROTOCOL_VERSION,
};
use tokio::{
    io::BufReader,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::watch,
};
use tracing::{debug, info, warn};

pub type TcpBroker = Broker<BufReader<OwnedReadHalf>, OwnedWriteHalf>;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub handshake_timeout: Duration,
    pub broker: BrokerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            broker: BrokerConfig::default(),
        }
    }
}

/// Accepts subscriber and publisher connections and feeds them to one broker.
pub struct Hub {
    config: ServerConfig,
    broker: Arc<TcpBroker>,
    conn_counter: AtomicU64,
}

impl Hub {
    pub fn new(config: ServerConfig) -> Self {
        let broker = Arc::new(TcpBroker::new(config.broker.clone()));
        Self {
            config,
            broker,
            conn_counter: AtomicU64::new(0),
        }
    }

    pub fn broker(&self) -> &Arc<TcpBroker> {
        &self.broker
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    /// Runs the accept loop until `shutdown` flips to true, then closes every
    /// subscription.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let local_addr = listener.local_addr()?;
        let keepalive = self.broker.clone().spawn_keepalive(shutdown.clone());
        info!(
            event = "hub_listening",
            addr = %local_addr,
            handshake_timeout_ms = self.config.handshake_timeout.as_millis() as u64
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, addr)) => {
                            let hub = self.clone();
                            tokio::spawn(async move {
                                hub.handle_connection(stream, addr).await;
                            });
                        }
                        Err(err) => {
                            warn!(event = "hub_accept_error", error = %err);
                        }
                    }
                }
            }
        }

        let closed = self.broker.shutdown().await;
        let _ = keepalive.await;
        info!(event = "hub_stop", closed_subscriptions = closed);
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if !addr.ip().is_loopback() {
            warn!(event = "hub_remote_rejected", remote = %addr);
            return;
        }
        let conn_id = self.next_conn_id();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let handshake = tokio::time::timeout(
            self.config.handshake_timeout,
            read_packet(&mut reader, self.config.broker.subscription.max_frame_bytes),
        )
        .await;
        let first = match handshake {
            Ok(Ok(packet)) => packet,
            Ok(Err(err)) => {
                warn!(event = "handshake_read_error", conn_id = %conn_id, remote = %addr, error = %err);
                return;
            }
            Err(_) => {
                warn!(event = "handshake_timeout", conn_id = %conn_id, remote = %addr);
                return;
            }
        };

        if first.version.0 > CURRENT_PROTOCOL_VERSION {
            warn!(
                event = "unsupported_version",
                conn_id = %conn_id,
                remote = %addr,
                version = first.version.0
            );
            reject(&mut writer, &first, "unsupported protocol version").await;
            return;
        }

        match first.command {
            Command::Subscribe => {
                let Some(topic) = packet_topic(&first) else {
                    reject(&mut writer, &first, "subscribe requires a topic").await;
                    return;
                };
                if let Err(err) = send_packet(&mut writer, &first.reply(Command::SubscribeAck)).await {
                    warn!(event = "handshake_write_error", conn_id = %conn_id, error = %err);
                    return;
                }
                info!(event = "handshake_ok", conn_id = %conn_id, remote = %addr, role = "subscriber", topic = %topic);
                self.broker.subscribe(&topic, &conn_id, reader, writer).await;
            }
            Command::Publish => {
                info!(event = "handshake_ok", conn_id = %conn_id, remote = %addr, role = "publisher");
                self.serve_publisher(&conn_id, reader, writer, first).await;
            }
            _ => {
                command_ok(&first, Command::Subscribe, Some(&mut writer)).await;
                warn!(
                    event = "unexpected_handshake",
                    conn_id = %conn_id,
                    remote = %addr,
                    command = %first.command
                );
            }
        }
    }

    async fn serve_publisher(
        &self,
        conn_id: &str,
        mut reader: BufReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
        first: Packet,
    ) {
        let max_frame_bytes = self.config.broker.subscription.max_frame_bytes;
        let mut next = Some(first);
        loop {
            let packet = match next.take() {
                Some(packet) => packet,
                None => match read_packet(&mut reader, max_frame_bytes).await {
                    Ok(packet) => packet,
                    Err(PacketError::Closed) => break,
                    Err(PacketError::Frame(err)) => {
                        warn!(event = "publisher_decode_error", conn_id = conn_id, error = %err);
                        continue;
                    }
                    Err(err) => {
                        warn!(event = "publisher_read_error", conn_id = conn_id, error = %err);
                        break;
                    }
                },
            };

            if !command_ok(&packet, Command::Publish, Some(&mut writer)).await {
                debug!(event = "publisher_ignored_command", conn_id = conn_id, command = %packet.command);
                continue;
            }
            let Some(topic) = packet_topic(&packet) else {
                reject(&mut writer, &packet, "publish requires a topic").await;
                continue;
            };

            let report = self.broker.publish(&topic, &packet.data).await;
            let ack = packet
                .reply(Command::PublishAck)
                .with_data(report.delivered.to_string());
            if let Err(err) = send_packet(&mut writer, &ack).await {
                warn!(event = "publisher_write_error", conn_id = conn_id, error = %err);
                break;
            }
        }
        info!(event = "publisher_disconnected", conn_id = conn_id);
    }
}

fn packet_topic(packet: &Packet) -> Option<String> {
    packet
        .topic
        .as_deref()
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .map(str::to_string)
}

async fn reject(writer: &mut OwnedWriteHalf, packet: &Packet, reason: &str) {
    let notice = packet.reply(Command::Error).with_data(reason);
    if let Err(err) = send_packet(writer, &notice).await {
        debug!(event = "reject_write_error", error = %err);
    }
}
