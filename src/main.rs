mod client;
#[cfg(test)]
mod test_server;

use anyhow::Context;
use config::Config as CConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::client::{Client, ConsoleHandler};

const CONFIG_FILE: &str = "config.toml";

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::new(CONFIG_FILE).context("Error loading config")?;
    init_logging(&config.log_level);

    // A failed or slow connect is not recovered from: the error ends the process.
    let handler = ConsoleHandler::new(&config.server_url);
    let client = tokio::time::timeout(
        config.connect_timeout,
        Client::connect(&config.server_url, &config.namespace, handler),
    )
    .await
    .with_context(|| format!("Timed out connecting to {}", config.server_url))??;

    // The ctrl_c watcher only exists once connected, so an interrupt during the connect
    // still kills the process the default way.
    let (exit_tx, mut exit_rx) = mpsc::channel(1);
    spawn_exit_signal(exit_tx);

    let mut rng = StdRng::from_entropy();
    run_loop(&client, &config, &mut rng, &mut exit_rx).await?;
    shutdown(client, config.shutdown_timeout).await
}

fn init_logging(level: &str) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
struct Config {
    log_level: String,
    server_url: String,
    namespace: String,
    event: String,
    emit_period: Duration,
    connect_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Config {
    fn new(path: &str) -> anyhow::Result<Self> {
        let config = CConfig::builder()
            .add_source(config::File::with_name(path).required(false))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            server_url: "http://localhost:3000".to_string(),
            namespace: "/".to_string(),
            event: "data_from_python".to_string(),
            emit_period: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
struct Payload {
    value: f64,
}

impl Payload {
    // The standard distribution for f64 samples the half-open range [0, 1).
    fn random(rng: &mut impl Rng) -> Self {
        Self { value: rng.gen() }
    }
}

// Only exercised by hand: tests drive run_loop through its exit channel instead.
fn spawn_exit_signal(exit_tx: mpsc::Sender<()>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(_) => {
                tracing::debug!("Tokio's ctrl_c signal received");
                let _ = exit_tx.send(()).await;
            }
            Err(err) => {
                // The OS refused to register the handler, ctrl_c keeps its default behavior.
                tracing::debug!("{}", err);
            }
        }
    });
}

trait Emitter {
    async fn emit(&self, event: &str, payload: &Payload) -> anyhow::Result<()>;
}

impl Emitter for Client {
    async fn emit(&self, event: &str, payload: &Payload) -> anyhow::Result<()> {
        Client::emit(self, event, payload).await
    }
}

// Emits one payload per period until the exit signal arrives. The exit signal is watched
// during the emit as well, so a write stuck on a dead peer cannot swallow ctrl_c.
async fn run_loop(
    emitter: &impl Emitter,
    config: &Config,
    rng: &mut impl Rng,
    exit_rx: &mut mpsc::Receiver<()>,
) -> anyhow::Result<()> {
    loop {
        let payload = Payload::random(rng);
        tokio::select! {
            _ = exit_rx.recv() => break,
            result = emitter.emit(&config.event, &payload) => {
                result.with_context(|| format!("Error emitting {}", config.event))?
            }
        }
        tracing::debug!("Emitted {} [value={}]", config.event, payload.value);

        tokio::select! {
            _ = exit_rx.recv() => break,
            _ = tokio::time::sleep(config.emit_period) => {}
        }
    }
    Ok(())
}

async fn shutdown(client: Client, grace: Duration) -> anyhow::Result<()> {
    tracing::info!("Shutting down");
    tokio::time::timeout(grace, client.disconnect())
        .await
        .context("Timed out disconnecting")?
}
