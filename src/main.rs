//! Gossipnet node: transport bring-up binary.
//!
//! Binds the endpoint, dials the configured peers, and logs every verified
//! gossip payload that reaches the dispatcher. Block and batch processing
//! live outside the transport; this binary only proves the wiring.

use clap::Parser;
use gossipnet::{
    AcceptAll, Dispatcher, GossipMessage, NetConfig, NetworkService, NotifyQueue, Readiness,
};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "gossipnet", version, about = "Gossipnet: validator gossip transport")]
struct Args {
    /// Endpoint to bind, e.g. 127.0.0.1:8800
    #[arg(short, long, default_value = "127.0.0.1:8800")]
    endpoint: String,

    /// Peer endpoints to dial (repeatable)
    #[arg(short, long = "peer")]
    peers: Vec<String>,

    /// Identity announced to peers (defaults to hostname-pid)
    #[arg(short, long)]
    identity: Option<String>,
}

/// Dispatcher that logs verified gossip instead of processing blocks.
#[derive(Default)]
struct LoggingDispatcher {
    queue: Mutex<Option<Arc<NotifyQueue<GossipMessage>>>>,
    ready: Mutex<Option<Readiness>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher for LoggingDispatcher {
    fn set_incoming_msg_queue(&self, queue: Arc<NotifyQueue<GossipMessage>>) {
        *self.queue.lock().unwrap_or_else(|e| e.into_inner()) = Some(queue);
    }

    fn set_ready_signal(&self, ready: Readiness) {
        *self.ready.lock().unwrap_or_else(|e| e.into_inner()) = Some(ready);
    }

    fn start(&self) {
        let Some(queue) = self.queue.lock().unwrap_or_else(|e| e.into_inner()).clone() else {
            error!("dispatcher started without a queue");
            return;
        };
        let ready = self.ready.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let worker = tokio::spawn(async move {
            if let Some(ready) = ready {
                ready.wait().await;
            }
            loop {
                let message = queue.pop().await;
                info!(
                    content_type = %message.content_type,
                    bytes = message.content.len(),
                    "gossip message dispatched"
                );
            }
        });
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);
    }

    fn stop(&self) {
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            worker.abort();
        }
    }

    fn on_block_request(&self, block_id: &str) {
        info!(block_id, "block requested");
    }

    fn on_block_received(&self, block: Vec<u8>) {
        info!(bytes = block.len(), "block received");
    }

    fn on_batch_received(&self, batch: Vec<u8>) {
        info!(bytes = batch.len(), "batch received");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gossipnet=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!("Gossipnet v{} | endpoint: {}", VERSION, args.endpoint);
    if !args.peers.is_empty() {
        info!("Peers: {:?}", args.peers);
    }

    let config = NetConfig {
        endpoint: args.endpoint,
        peers: args.peers,
        identity: args.identity.map(String::into_bytes),
    };

    let service = match NetworkService::start(
        config,
        Arc::new(LoggingDispatcher::default()),
        Arc::new(AcceptAll),
    )
    .await
    {
        Ok(service) => service,
        Err(e) => {
            error!("failed to start network service: {}", e);
            return;
        }
    };

    info!(
        "Gossipnet running on {} as {}",
        service.local_addr(),
        String::from_utf8_lossy(service.identity())
    );

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    service.stop().await;
}
