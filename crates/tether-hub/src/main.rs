use anyhow::{bail, Context, Result};
use clap::Parser;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tether_hub::{Hub, ServerConfig, SubscriptionConfig};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_ADDR: &str = "127.0.0.1:42100";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    debug: bool,
    log_dir: String,
    server: ServerConfig,
}

#[derive(Parser, Debug)]
#[command(name = "tether-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Idle seconds before a subscriber is pinged.
    #[arg(long, default_value_t = 10)]
    ping_pong_timeout: u64,
    /// Seconds to wait for a PONG or NEW_DATA_ACK.
    #[arg(long, default_value_t = 5)]
    response_timeout: u64,
    #[arg(long, default_value_t = 1)]
    sweep_interval: u64,
    #[arg(long, default_value_t = 5)]
    handshake_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config(Args::parse());
    init_logging(&config);
    if let Err(err) = run(config).await {
        error!(event = "hub_error", error = %format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid addr '{}'", config.addr))?;
    if !addr.ip().is_loopback() {
        bail!("refusing to bind non-loopback addr {addr}");
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(
        event = "hub_start",
        addr = %addr,
        ping_pong_timeout_secs = config.server.broker.subscription.ping_pong_timeout.as_secs(),
        response_timeout_secs = config.server.broker.subscription.response_timeout.as_secs()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown_signal");
        let _ = shutdown_tx.send(true);
    });

    let hub = Arc::new(Hub::new(config.server));
    hub.serve(listener, shutdown_rx)
        .await
        .context("hub accept loop")
}

fn load_config(args: Args) -> Config {
    let addr = resolve_addr(&args.addr);
    let debug = args.debug || env_true("TETHER_HUB_DEBUG");
    let log_dir = resolve_log_dir(&args.log_dir);

    let mut server = ServerConfig {
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        ..ServerConfig::default()
    };
    server.broker.sweep_interval = Duration::from_secs(args.sweep_interval);
    server.broker.subscription = SubscriptionConfig {
        ping_pong_timeout: Duration::from_secs(args.ping_pong_timeout),
        response_timeout: Duration::from_secs(args.response_timeout.max(1)),
        ..SubscriptionConfig::default()
    };

    Config {
        addr,
        debug,
        log_dir,
        server,
    }
}

fn init_logging(config: &Config) {
    let level = match std::env::var("TETHER_LOG_LEVEL") {
        _ if config.debug => "debug".to_string(),
        Ok(level) if !level.trim().is_empty() => level,
        _ => "info".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file = open_log_file(&config.log_dir).unwrap_or_else(|err| {
        eprintln!("log_file_error: {err}");
        None
    });
    let make_writer = BoxMakeWriter::new(move || TeeWriter {
        stdout: io::stdout(),
        file: file.clone(),
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .try_init();
}

/// Copies every log line to stdout and, when configured, the log file.
struct TeeWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<File>>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<Option<Arc<Mutex<File>>>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("tether-hub.log"))?;
    Ok(Some(Arc::new(Mutex::new(file))))
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    match std::env::var("TETHER_HUB_ADDR") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => DEFAULT_ADDR.to_string(),
    }
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    std::env::var("TETHER_LOG_DIR").unwrap_or_default()
}
