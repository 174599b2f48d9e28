//! Server side of the tether hub: per-subscriber keepalive and delivery,
//! the subscription registry, and the loopback TCP front end.

pub mod broker;
pub mod server;
pub mod subscription;

pub use broker::{Broker, BrokerConfig, PublishReport, SubscriptionKey, SweepReport};
pub use server::{Hub, ServerConfig, TcpBroker};
pub use subscription::{
    DeathCause, ExchangeError, Subscription, SubscriptionConfig, PING_PONG_TIMEOUT,
};
