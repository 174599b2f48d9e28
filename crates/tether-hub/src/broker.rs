use crate::subscription::{Subscription, SubscriptionConfig};
use futures_util::future::join_all;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{watch, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub topic: String,
    pub conn_id: String,
}

impl SubscriptionKey {
    pub fn new(topic: impl Into<String>, conn_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            conn_id: conn_id.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub subscription: SubscriptionConfig,
    pub sweep_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscription: SubscriptionConfig::default(),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub reaped: usize,
}

/// Registry of live subscriptions keyed by topic and connection.
///
/// The broker owns the sockets handed to it: it is the only component that
/// closes a subscription's stream, which it does when reaping.
pub struct Broker<R, W> {
    config: BrokerConfig,
    subscriptions: RwLock<HashMap<SubscriptionKey, Arc<Subscription<R, W>>>>,
}

impl<R, W> Broker<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Registers a subscriber and starts its idle loop.
    ///
    /// An existing subscription under the same key is killed and closed first.
    pub async fn subscribe(
        &self,
        topic: &str,
        conn_id: &str,
        reader: R,
        writer: W,
    ) -> Arc<Subscription<R, W>> {
        let key = SubscriptionKey::new(topic, conn_id);
        let subscription = Arc::new(
            Subscription::new(topic, reader, writer)
                .with_config(self.config.subscription.clone())
                .with_connection_id(conn_id),
        );

        let previous = self
            .subscriptions
            .write()
            .await
            .insert(key.clone(), subscription.clone());
        if let Some(previous) = previous {
            warn!(event = "subscription_replaced", topic = %key.topic, conn_id = %key.conn_id);
            previous.die();
            close_stream(&key, &previous).await;
        }

        let idle = subscription.clone();
        tokio::spawn(async move {
            idle.start_idle().await;
        });

        info!(event = "subscription_created", topic = %key.topic, conn_id = %key.conn_id);
        subscription
    }

    pub async fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        let removed = self.subscriptions.write().await.remove(key);
        let Some(subscription) = removed else {
            return false;
        };
        subscription.die();
        close_stream(key, &subscription).await;
        info!(event = "subscription_removed", topic = %key.topic, conn_id = %key.conn_id);
        true
    }

    /// Delivers `message` to every live subscription on exactly `topic`.
    ///
    /// Subscriptions that fail delivery die and are reaped before returning.
    pub async fn publish(&self, topic: &str, message: &str) -> PublishReport {
        let targets = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|(key, sub)| key.topic == topic && !sub.is_dead())
                .map(|(_, sub)| sub.clone())
                .collect::<Vec<_>>()
        };

        let outcomes = join_all(targets.iter().map(|sub| sub.new_data(message))).await;
        let mut report = PublishReport::default();
        for delivered in outcomes {
            if delivered {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.failed > 0 {
            self.reap_dead().await;
        }
        debug!(
            event = "publish_fanout",
            topic = topic,
            delivered = report.delivered,
            failed = report.failed
        );
        report
    }

    /// One keepalive pass: ping every timed-out subscription, stalest first,
    /// then reap whatever died.
    pub async fn sweep(&self) -> SweepReport {
        let mut due = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .values()
                .filter(|sub| !sub.is_dead() && sub.timed_out())
                .cloned()
                .collect::<Vec<_>>()
        };
        due.sort_by(|a, b| b.cmp_staleness(a));

        join_all(due.iter().map(|sub| sub.ping())).await;
        let reaped = self.reap_dead().await;
        SweepReport {
            pinged: due.len(),
            reaped,
        }
    }

    /// Removes dead subscriptions from the map and closes their streams.
    pub async fn reap_dead(&self) -> usize {
        let dead = {
            let mut subscriptions = self.subscriptions.write().await;
            let keys = subscriptions
                .iter()
                .filter(|(_, sub)| sub.is_dead())
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            keys.into_iter()
                .filter_map(|key| subscriptions.remove(&key).map(|sub| (key, sub)))
                .collect::<Vec<_>>()
        };

        for (key, subscription) in &dead {
            close_stream(key, subscription).await;
            info!(
                event = "subscription_reaped",
                topic = %key.topic,
                conn_id = %key.conn_id,
                cause = subscription.death_cause().map(|cause| cause.as_str()).unwrap_or_default()
            );
        }
        dead.len()
    }

    pub fn spawn_keepalive(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let tick = std::cmp::max(Duration::from_millis(100), self.config.sweep_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = self.sweep().await;
                        if report.pinged > 0 || report.reaped > 0 {
                            debug!(event = "keepalive_sweep", pinged = report.pinged, reaped = report.reaped);
                        }
                    }
                }
            }
        })
    }

    /// Kills and closes every subscription.
    pub async fn shutdown(&self) -> usize {
        let drained = self
            .subscriptions
            .write()
            .await
            .drain()
            .collect::<Vec<_>>();
        for (key, subscription) in &drained {
            subscription.die();
            close_stream(key, subscription).await;
        }
        drained.len()
    }

    pub async fn len(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscriptions.read().await.is_empty()
    }

    pub async fn topic_count(&self, topic: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .keys()
            .filter(|key| key.topic == topic)
            .count()
    }

    pub async fn get(&self, key: &SubscriptionKey) -> Option<Arc<Subscription<R, W>>> {
        self.subscriptions.read().await.get(key).cloned()
    }
}

async fn close_stream<R, W>(key: &SubscriptionKey, subscription: &Arc<Subscription<R, W>>)
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    if let Err(err) = subscription.close().await {
        debug!(
            event = "subscription_close_error",
            topic = %key.topic,
            conn_id = %key.conn_id,
            error = %err
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::DeathCause;
    use tether_core::{client::respond, read_packet, DEFAULT_MAX_FRAME_BYTES};
    use tokio::io::{duplex, split, BufReader, DuplexStream, ReadHalf, WriteHalf};

    type TestBroker = Broker<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    struct Peer {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    async fn attach(broker: &TestBroker, topic: &str, conn_id: &str) -> Peer {
        let (hub, client) = duplex(16 * 1024);
        let (hub_reader, hub_writer) = split(hub);
        let (client_reader, client_writer) = split(client);
        broker.subscribe(topic, conn_id, hub_reader, hub_writer).await;
        Peer {
            reader: BufReader::new(client_reader),
            writer: client_writer,
        }
    }

    fn spawn_responder(mut peer: Peer) -> JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut received = Vec::new();
            let _ = respond(&mut peer.reader, &mut peer.writer, |msg| received.push(msg)).await;
            received
        })
    }

    fn spawn_silent(mut peer: Peer) -> JoinHandle<usize> {
        tokio::spawn(async move {
            let mut seen = 0;
            while read_packet(&mut peer.reader, DEFAULT_MAX_FRAME_BYTES).await.is_ok() {
                seen += 1;
            }
            seen
        })
    }

    #[tokio::test]
    async fn publish_reaches_only_exact_topic() {
        let broker = TestBroker::new(BrokerConfig::default());
        let a1 = spawn_responder(attach(&broker, "prices", "conn-1").await);
        let a2 = spawn_responder(attach(&broker, "prices", "conn-2").await);
        let b = spawn_responder(attach(&broker, "prices/eu", "conn-3").await);
        assert_eq!(broker.len().await, 3);
        assert_eq!(broker.topic_count("prices").await, 2);

        let report = broker.publish("prices", "42").await;
        assert_eq!(report, PublishReport { delivered: 2, failed: 0 });
        assert_eq!(broker.publish("weather", "rain").await, PublishReport::default());

        assert_eq!(broker.shutdown().await, 3);
        assert!(broker.is_empty().await);
        assert_eq!(a1.await.expect("join"), vec!["42".to_string()]);
        assert_eq!(a2.await.expect("join"), vec!["42".to_string()]);
        assert!(b.await.expect("join").is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_is_counted_and_reaped() {
        let broker = TestBroker::new(BrokerConfig::default());
        let _live = spawn_responder(attach(&broker, "prices", "conn-live").await);
        let gone = attach(&broker, "prices", "conn-gone").await;
        drop(gone);

        let report = broker.publish("prices", "42").await;
        assert_eq!(report, PublishReport { delivered: 1, failed: 1 });
        assert_eq!(broker.len().await, 1);
        assert!(broker
            .get(&SubscriptionKey::new("prices", "conn-gone"))
            .await
            .is_none());
        assert!(broker
            .get(&SubscriptionKey::new("prices", "conn-live"))
            .await
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_pings_timed_out_and_reaps_exhausted() {
        let mut config = BrokerConfig::default();
        config.subscription.ping_pong_timeout = Duration::from_secs(2);
        config.subscription.response_timeout = Duration::from_secs(1);
        let broker = TestBroker::new(config);
        let _responsive = spawn_responder(attach(&broker, "prices", "conn-ok").await);
        let silent = spawn_silent(attach(&broker, "prices", "conn-silent").await);

        assert_eq!(broker.sweep().await, SweepReport::default());

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let first = broker.sweep().await;
        assert_eq!(first, SweepReport { pinged: 2, reaped: 0 });

        let ok = broker
            .get(&SubscriptionKey::new("prices", "conn-ok"))
            .await
            .expect("responsive subscription");
        let quiet = broker
            .get(&SubscriptionKey::new("prices", "conn-silent"))
            .await
            .expect("silent subscription");
        assert!(!quiet.is_dead());

        let mut reaped = 0;
        for _ in 0..2 {
            reaped += broker.sweep().await.reaped;
        }
        assert_eq!(reaped, 1);
        assert!(quiet.is_dead());
        assert_eq!(quiet.death_cause(), Some(DeathCause::PingExhausted));
        assert!(!ok.is_dead());
        assert_eq!(broker.len().await, 1);

        drop(quiet);
        assert_eq!(silent.await.expect("join"), 3);
    }

    #[tokio::test]
    async fn resubscribe_replaces_and_closes_previous() {
        let broker = TestBroker::new(BrokerConfig::default());
        let old = spawn_silent(attach(&broker, "prices", "conn-1").await);
        let first = broker
            .get(&SubscriptionKey::new("prices", "conn-1"))
            .await
            .expect("first");

        let _new = spawn_responder(attach(&broker, "prices", "conn-1").await);
        assert_eq!(broker.len().await, 1);
        assert!(first.is_dead());
        assert_eq!(old.await.expect("join"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_closes_stream() {
        let broker = TestBroker::new(BrokerConfig::default());
        let peer = spawn_responder(attach(&broker, "prices", "conn-1").await);
        let key = SubscriptionKey::new("prices", "conn-1");

        assert!(broker.unsubscribe(&key).await);
        assert!(!broker.unsubscribe(&key).await);
        assert!(peer.await.expect("join").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_task_stops_on_shutdown_signal() {
        let broker = Arc::new(TestBroker::new(BrokerConfig::default()));
        let (tx, rx) = watch::channel(false);
        let handle = broker.clone().spawn_keepalive(rx);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!handle.is_finished());

        tx.send(true).expect("signal");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("keepalive stopped")
            .expect("join");
    }
}
