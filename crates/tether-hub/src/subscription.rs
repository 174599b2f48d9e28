use chrono::{DateTime, Utc};
use std::{
    cmp::Ordering as CmpOrdering,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        OnceLock,
    },
    time::Duration,
};
use tether_core::{
    command_ok, encode_frame, read_packet_buffered, Command, FrameError, LivenessState, Packet,
    PacketError, DEFAULT_MAX_FRAME_BYTES,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{watch, Mutex},
};
use tracing::{debug, info, warn};

/// Idle seconds after which a subscription is due for a ping.
pub const PING_PONG_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const IDLE_SLOT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    pub ping_pong_timeout: Duration,
    /// Upper bound on one request/response exchange, write included.
    pub response_timeout: Duration,
    pub idle_slot: Duration,
    pub max_frame_bytes: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            ping_pong_timeout: PING_PONG_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            idle_slot: IDLE_SLOT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathCause {
    Requested,
    PingExhausted,
    DeliveryFailed,
}

impl DeathCause {
    pub fn as_str(self) -> &'static str {
        match self {
            DeathCause::Requested => "requested",
            DeathCause::PingExhausted => "ping_exhausted",
            DeathCause::DeliveryFailed => "delivery_failed",
        }
    }
}

/// Outcome of a failed request/response exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("subscription is dead")]
    Dead,
    #[error("transport failed: {0}")]
    Transport(#[source] io::Error),
    #[error("stream closed by peer")]
    Closed,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Malformed(#[source] FrameError),
    #[error("expected {expected}, got {actual}")]
    Protocol { expected: Command, actual: Command },
}

impl ExchangeError {
    /// True when the stream can no longer carry another round.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExchangeError::Dead | ExchangeError::Transport(_) | ExchangeError::Closed
        )
    }
}

impl From<PacketError> for ExchangeError {
    fn from(err: PacketError) -> Self {
        match err {
            PacketError::Io(err) => ExchangeError::Transport(err),
            PacketError::Closed => ExchangeError::Closed,
            PacketError::Frame(err) => ExchangeError::Malformed(err),
        }
    }
}

struct Stream<R, W> {
    reader: BufReader<R>,
    writer: W,
    last_seq: u64,
    /// Encoded bytes not yet accepted by the writer. A round cut short by the
    /// response timeout leaves its unsent tail here, and the next round
    /// finishes it first so the peer never sees a torn line.
    outbox: Vec<u8>,
    /// Start of a response line whose remainder had not arrived when the
    /// previous round timed out.
    inbox: Vec<u8>,
}

impl<R, W> Stream<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn flush_outbox(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            let written = self.writer.write(&self.outbox).await?;
            if written == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.outbox.drain(..written);
        }
        self.writer.flush().await
    }

    async fn exchange(
        &mut self,
        request: &Packet,
        max_frame_bytes: usize,
    ) -> Result<Packet, ExchangeError> {
        let frame = encode_frame(request, max_frame_bytes).map_err(ExchangeError::Malformed)?;
        self.outbox.extend_from_slice(&frame);
        self.flush_outbox().await.map_err(ExchangeError::Transport)?;
        loop {
            let response =
                read_packet_buffered(&mut self.reader, &mut self.inbox, max_frame_bytes).await?;
            // seq 0 marks a peer that does not echo sequence numbers.
            if response.seq != 0 && response.seq < request.seq {
                debug!(
                    event = "stale_response_skipped",
                    command = %response.command,
                    seq = response.seq,
                    expected_seq = request.seq
                );
                continue;
            }
            return Ok(response);
        }
    }
}

/// Server-side state of one subscriber on one topic.
///
/// The stream halves are owned exclusively and sit behind a single async
/// mutex, so at most one exchange is on the wire at a time. Everything else
/// is atomic and readable without awaiting.
pub struct Subscription<R, W> {
    topic: String,
    connection_id: Option<String>,
    config: SubscriptionConfig,
    created_at: DateTime<Utc>,
    stream: Mutex<Stream<R, W>>,
    idle_secs: AtomicU64,
    misses: AtomicU8,
    alive: AtomicBool,
    idle_started: AtomicBool,
    cause: OnceLock<DeathCause>,
    dead_tx: watch::Sender<bool>,
}

impl<R, W> Subscription<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(topic: impl Into<String>, reader: R, writer: W) -> Self {
        let (dead_tx, _) = watch::channel(false);
        Self {
            topic: topic.into(),
            connection_id: None,
            config: SubscriptionConfig::default(),
            created_at: Utc::now(),
            stream: Mutex::new(Stream {
                reader: BufReader::new(reader),
                writer,
                last_seq: 0,
                outbox: Vec::new(),
                inbox: Vec::new(),
            }),
            idle_secs: AtomicU64::new(0),
            misses: AtomicU8::new(LivenessState::Fresh.misses()),
            alive: AtomicBool::new(true),
            idle_started: AtomicBool::new(false),
            cause: OnceLock::new(),
            dead_tx,
        }
    }

    pub fn with_config(mut self, config: SubscriptionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn elapsed_idle_secs(&self) -> u64 {
        self.idle_secs.load(Ordering::SeqCst)
    }

    pub fn liveness_state(&self) -> LivenessState {
        LivenessState::from_misses(self.misses.load(Ordering::SeqCst))
    }

    pub fn timed_out(&self) -> bool {
        self.elapsed_idle_secs() > self.config.ping_pong_timeout.as_secs()
    }

    pub fn is_dead(&self) -> bool {
        !self.alive.load(Ordering::SeqCst)
    }

    pub fn death_cause(&self) -> Option<DeathCause> {
        self.cause.get().copied()
    }

    /// Orders by accumulated idle time; the stalest subscription sorts last.
    pub fn cmp_staleness(&self, other: &Self) -> CmpOrdering {
        self.elapsed_idle_secs().cmp(&other.elapsed_idle_secs())
    }

    /// Resolves once the subscription has died.
    pub async fn wait_dead(&self) {
        let mut rx = self.dead_tx.subscribe();
        let _ = rx.wait_for(|dead| *dead).await;
    }

    /// The idle timer. Run exactly once per subscription as a background task;
    /// later calls return immediately.
    pub async fn start_idle(&self) {
        if self.idle_started.swap(true, Ordering::SeqCst) {
            warn!(
                event = "idle_loop_already_running",
                topic = %self.topic,
                conn_id = self.connection_id().unwrap_or_default()
            );
            return;
        }

        let mut dead_rx = self.dead_tx.subscribe();
        while !self.is_dead() {
            tokio::select! {
                _ = tokio::time::sleep(self.config.idle_slot) => {
                    if self.is_dead() {
                        break;
                    }
                    self.idle_secs.fetch_add(1, Ordering::SeqCst);
                }
                _ = dead_rx.changed() => break,
            }
        }
        // Only reached once dead; the cause recorded earlier stands.
        self.die();
    }

    /// Probes the subscriber once.
    ///
    /// A PONG clears both the idle timer and the miss count. Anything else is
    /// one failed round: a wrong or undecodable answer, no answer within the
    /// response timeout, or a broken stream. The third in a row kills the
    /// subscription.
    pub async fn ping(&self) {
        if self.is_dead() {
            return;
        }
        match self.send_request(Command::Ping, "").await {
            Ok(_) => {
                if self.is_dead() {
                    return;
                }
                self.idle_secs.store(0, Ordering::SeqCst);
                self.reset_liveness();
                debug!(event = "pong_received", topic = %self.topic, conn_id = self.connection_id().unwrap_or_default());
            }
            Err(ExchangeError::Dead) => {}
            Err(err) => {
                let keep_alive = self.record_failed_round();
                warn!(
                    event = "ping_failed_round",
                    topic = %self.topic,
                    conn_id = self.connection_id().unwrap_or_default(),
                    liveness = %self.liveness_state(),
                    keep_alive,
                    transport = err.is_fatal(),
                    error = %err
                );
                if !keep_alive {
                    self.terminate(DeathCause::PingExhausted);
                }
            }
        }
    }

    /// Delivers one message and waits for its acknowledgement.
    ///
    /// Only the idle timer is reset on success; the miss count is left to
    /// the ping path. Any failure kills the subscription.
    pub async fn new_data(&self, message: &str) -> bool {
        if self.is_dead() {
            return false;
        }
        match self.send_request(Command::NewData, message).await {
            Ok(_) => {
                self.idle_secs.store(0, Ordering::SeqCst);
                true
            }
            Err(ExchangeError::Dead) => false,
            Err(err) => {
                warn!(
                    event = "delivery_failed",
                    topic = %self.topic,
                    conn_id = self.connection_id().unwrap_or_default(),
                    error = %err
                );
                self.terminate(DeathCause::DeliveryFailed);
                false
            }
        }
    }

    /// One request/response round on the wire, bounded by the response timeout.
    ///
    /// The answer must carry the command `command` expects; on mismatch the
    /// peer is told through an `Error` packet.
    pub async fn send_request(&self, command: Command, data: &str) -> Result<Packet, ExchangeError> {
        if self.is_dead() {
            return Err(ExchangeError::Dead);
        }
        let mut stream = self.stream.lock().await;
        if self.is_dead() {
            return Err(ExchangeError::Dead);
        }

        stream.last_seq += 1;
        let request = Packet::new(command, stream.last_seq).with_data(data);
        let deadline = self.config.response_timeout;
        let response = match tokio::time::timeout(
            deadline,
            stream.exchange(&request, self.config.max_frame_bytes),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ExchangeError::Timeout(deadline)),
        };

        if let Some(expected) = command.response() {
            if !command_ok(&response, expected, Some(&mut stream.outbox)).await {
                // Best effort; an unsent remainder goes out ahead of the next round.
                let _ = tokio::time::timeout(deadline, stream.flush_outbox()).await;
                return Err(ExchangeError::Protocol {
                    expected,
                    actual: response.command,
                });
            }
        }
        Ok(response)
    }

    /// Marks the subscription dead. Safe to call any number of times.
    ///
    /// The stream is left open; see [`Subscription::close`].
    pub fn die(&self) {
        self.terminate(DeathCause::Requested);
    }

    /// Shuts down the write half so the peer observes EOF.
    pub async fn close(&self) -> io::Result<()> {
        let mut stream = self.stream.lock().await;
        stream.writer.shutdown().await
    }

    fn reset_liveness(&self) {
        let _ = self
            .misses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |misses| {
                let mut state = LivenessState::from_misses(misses);
                state.reset();
                Some(state.misses())
            });
    }

    fn record_failed_round(&self) -> bool {
        let mut keep_alive = true;
        let _ = self
            .misses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |misses| {
                let mut state = LivenessState::from_misses(misses);
                keep_alive = state.advance();
                Some(state.misses())
            });
        keep_alive
    }

    /// Returns true for the single call that actually killed the subscription.
    fn terminate(&self, cause: DeathCause) -> bool {
        if self.cause.set(cause).is_err() {
            return false;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.dead_tx.send_replace(true);
        let lifetime_ms = (Utc::now() - self.created_at).num_milliseconds();
        info!(
            event = "subscription_died",
            topic = %self.topic,
            conn_id = self.connection_id().unwrap_or_default(),
            cause = cause.as_str(),
            idle_secs = self.elapsed_idle_secs(),
            liveness = %self.liveness_state(),
            lifetime_ms
        );
        true
    }
}
