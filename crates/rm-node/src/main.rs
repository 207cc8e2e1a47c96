//! # RM Node
//!
//! Hosts a client and a server [`RmEngine`] on one [`LoopbackNetwork`].
//!
//! ## Startup Sequence
//!
//! 1. Load engine configuration (`RM_*`) and node settings (`RM_NODE_*`)
//! 2. Create both engines and register the server endpoint
//! 3. Start the Sender, Invoker and Polling Manager of each engine
//! 4. Create the client sequence and stream messages into it
//!
//! ## Shutdown Sequence
//!
//! 1. Ctrl+C (or the last message) stops the producer
//! 2. Terminate the client sequence and wait for it to drain
//! 3. Stop the worker threads of both engines

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rm_engine::{
    CreateSequenceRequest, Delivery, DeliveryError, EndpointReference, LoopbackNetwork,
    MessageDeliverer, ReliableMessagingApi, RmConfig, RmEngine, SendOptions,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const SERVER_ADDRESS: &str = "loop://rm-node/server";

/// Node-level settings layered on top of [`RmConfig`].
#[derive(Clone, Debug)]
struct NodeConfig {
    /// Messages to send before terminating (0 = until Ctrl+C).
    messages: u64,
    send_interval: Duration,
    /// Upper bound on waiting for outstanding acknowledgements at shutdown.
    drain_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            messages: 10,
            send_interval: Duration::from_millis(1000),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Load node settings from environment.
fn load_config() -> Result<NodeConfig> {
    let mut config = NodeConfig::default();

    if let Ok(raw) = std::env::var("RM_NODE_MESSAGES") {
        config.messages = raw
            .parse()
            .with_context(|| format!("RM_NODE_MESSAGES is not a number: {}", raw))?;
    }
    if let Ok(raw) = std::env::var("RM_NODE_SEND_INTERVAL_MS") {
        let ms: u64 = raw
            .parse()
            .with_context(|| format!("RM_NODE_SEND_INTERVAL_MS is not a number: {}", raw))?;
        config.send_interval = Duration::from_millis(ms.max(1));
    }
    if let Ok(raw) = std::env::var("RM_NODE_DRAIN_TIMEOUT_MS") {
        let ms: u64 = raw
            .parse()
            .with_context(|| format!("RM_NODE_DRAIN_TIMEOUT_MS is not a number: {}", raw))?;
        config.drain_timeout = Duration::from_millis(ms);
    }

    Ok(config)
}

/// Application endpoint of the server engine.
struct LoggingDeliverer;

impl MessageDeliverer for LoggingDeliverer {
    fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        info!(
            "[rm-node] Delivered {} #{}: {}",
            delivery.sequence_id,
            delivery.message_number,
            String::from_utf8_lossy(&delivery.envelope.payload)
        );
        Ok(())
    }
}

/// Client and server engines plus the producer's shutdown channel.
struct RmNode {
    config: NodeConfig,
    client: RmEngine,
    server: RmEngine,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RmNode {
    fn new(engine_config: RmConfig, config: NodeConfig) -> Result<Self> {
        let network = LoopbackNetwork::new();
        let client = RmEngine::new(
            engine_config.clone(),
            Arc::new(network.transport()),
            Arc::new(LoggingDeliverer),
        )
        .context("Failed to create client engine")?;
        let server = RmEngine::new(
            engine_config,
            Arc::new(network.transport()),
            Arc::new(LoggingDeliverer),
        )
        .context("Failed to create server engine")?;
        network.register(SERVER_ADDRESS, server.context());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config,
            client,
            server,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Start both engines and open the client sequence.
    async fn start(&self) -> Result<String> {
        info!("===========================================");
        info!("  RM Node v{}", env!("CARGO_PKG_VERSION"));
        info!("  Server endpoint: {}", SERVER_ADDRESS);
        info!("===========================================");

        self.server.start().context("Failed to start server workers")?;
        self.client.start().context("Failed to start client workers")?;

        let request = CreateSequenceRequest::new(EndpointReference::new(SERVER_ADDRESS));
        let sequence = self
            .client
            .create_sequence(request)
            .await
            .context("Failed to create sequence")?;
        info!("[rm-node] Opened sequence {}", sequence);
        Ok(sequence)
    }

    /// Send one message per interval until the quota or a shutdown signal.
    fn spawn_producer(&self, sequence: String) -> JoinHandle<Result<u64>> {
        let client = self.client.clone();
        let config = self.config.clone();
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.send_interval);
            let mut sent = 0u64;
            while config.messages == 0 || sent < config.messages {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        info!("[rm-node] Producer shutdown signal received");
                        break;
                    }
                }
                let last_message = config.messages != 0 && sent + 1 == config.messages;
                let options = SendOptions {
                    last_message,
                    ..SendOptions::default()
                };
                let payload = format!("message {}", sent + 1).into_bytes();
                let number = client.send(&sequence, payload, options).await?;
                sent += 1;
                info!("[rm-node] Queued #{} on {}", number, sequence);
            }
            Ok(sent)
        })
    }

    fn signal_shutdown(&self) {
        if let Err(e) = self.shutdown_tx.send(true) {
            error!("Failed to send shutdown signal: {}", e);
        }
    }

    /// Terminate the sequence, wait for it to drain and stop the workers.
    async fn shutdown(&self, sequence: &str) -> Result<()> {
        info!("Initiating graceful shutdown...");

        if let Err(e) = self.client.terminate_sequence(sequence).await {
            warn!("[rm-node] Could not terminate {}: {}", sequence, e);
        }
        match self
            .client
            .wait_until_completed(sequence, self.config.drain_timeout)
            .await
        {
            Ok(report) => info!(
                "[rm-node] Sequence {} finished: {:?}, acknowledged {}",
                sequence, report.status, report.acknowledged
            ),
            Err(e) => warn!("[rm-node] Sequence {} did not drain: {}", sequence, e),
        }
        if let Ok(Some((reason, at))) = self.client.last_send_error(sequence).await {
            warn!("[rm-node] Last send error at {}: {}", at, reason);
        }

        self.client.stop().context("Failed to stop client workers")?;
        self.server.stop().context("Failed to stop server workers")?;
        info!("Shutdown complete");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_env("RM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load configuration
    let engine_config = RmConfig::from_env().context("Invalid RM_* configuration")?;
    let node_config = load_config()?;

    let node = RmNode::new(engine_config, node_config)?;
    let sequence = node.start().await?;
    let mut producer = node.spawn_producer(sequence.clone());

    info!("Node is running. Press Ctrl+C to stop.");
    let sent = tokio::select! {
        joined = &mut producer => joined??,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            node.signal_shutdown();
            producer.await??
        }
    };
    info!("[rm-node] Producer sent {} messages", sent);

    node.shutdown(&sequence).await
}
