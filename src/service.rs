//! Composition root: the network service a validator embeds.
//!
//! Owns the server endpoint, the outbound peer connections, the peer
//! registry, the handler table, and the verification pipeline. Inbound
//! gossip flows `handler → inbound queue → verification stage → outbound
//! queue → dispatcher`; the dispatcher itself is an external collaborator
//! reached through the [`Dispatcher`] trait.

use crate::connection::PeerConnection;
use crate::endpoint::ServerEndpoint;
use crate::future::PendingReply;
use crate::handler::{
    AckHandler, GossipMessageHandler, Handler, HandlerContext, HandlerTable, PeerRegisterHandler,
    PeerUnregisterHandler, PingHandler,
};
use crate::link::LinkError;
use crate::peers::PeerRegistry;
use crate::queue::{NotifyQueue, ReadySignal, Readiness, readiness};
use crate::serde_safe;
use crate::types::{Envelope, GossipMessage, PeerIdentity, local_identity, message_type};
use crate::verifier::{PayloadVerifier, VerificationStage};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Downstream dispatcher contract. The block/batch processing behind it is
/// out of scope for the transport.
pub trait Dispatcher: Send + Sync {
    fn set_incoming_msg_queue(&self, queue: Arc<NotifyQueue<GossipMessage>>);
    fn set_ready_signal(&self, ready: Readiness);
    fn start(&self);
    fn stop(&self);
    fn on_block_request(&self, block_id: &str);
    fn on_block_received(&self, block: Vec<u8>);
    fn on_batch_received(&self, batch: Vec<u8>);
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("failed to bind endpoint {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("no connection to peer {0}")]
    UnknownPeer(String),
}

#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Address the server endpoint binds to.
    pub endpoint: String,
    /// Peer endpoints to dial at startup.
    pub peers: Vec<String>,
    /// Identity announced on outbound links; `"<hostname>-<pid>"` when
    /// unset.
    pub identity: Option<PeerIdentity>,
}

impl NetConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), peers: Vec::new(), identity: None }
    }
}

pub struct NetworkService {
    identity: PeerIdentity,
    handlers: Arc<HandlerTable>,
    peers: Arc<PeerRegistry>,
    inbound: Arc<NotifyQueue<GossipMessage>>,
    outbound: Arc<NotifyQueue<GossipMessage>>,
    endpoint: ServerEndpoint,
    stage: VerificationStage,
    dispatcher: Arc<dyn Dispatcher>,
    ready: Readiness,
    // Flipped once startup completes; kept for the service's lifetime.
    ready_signal: ReadySignal,
}

impl NetworkService {
    /// Build and start the whole transport: bind the endpoint, register
    /// the built-in handlers, wire the dispatcher and verification stage,
    /// and dial the configured peer list. Readiness is signalled only
    /// after every owned worker is running.
    pub async fn start(
        config: NetConfig,
        dispatcher: Arc<dyn Dispatcher>,
        verifier: Arc<dyn PayloadVerifier>,
    ) -> Result<Self, NetError> {
        debug!("initializing network service");
        let identity = config.identity.clone().unwrap_or_else(local_identity);
        let peers = Arc::new(PeerRegistry::new());
        let inbound = Arc::new(NotifyQueue::new());
        let outbound = Arc::new(NotifyQueue::new());

        let handlers = Arc::new(HandlerTable::new());
        let ctx = HandlerContext { peers: peers.clone(), inbound: inbound.clone() };
        handlers.insert(message_type::REGISTER, Arc::new(PeerRegisterHandler::new(ctx.clone())));
        handlers.insert(message_type::UNREGISTER, Arc::new(PeerUnregisterHandler::new(ctx.clone())));
        handlers.insert(message_type::GOSSIP, Arc::new(GossipMessageHandler::new(ctx)));
        handlers.insert(message_type::PING, Arc::new(PingHandler));
        handlers.insert(message_type::ACK, Arc::new(AckHandler));

        let endpoint = ServerEndpoint::bind(&config.endpoint, handlers.clone())
            .await
            .map_err(|source| NetError::Bind { addr: config.endpoint.clone(), source })?;

        let (ready_signal, ready) = readiness();
        dispatcher.set_incoming_msg_queue(outbound.clone());
        dispatcher.set_ready_signal(ready.clone());
        dispatcher.start();
        let stage = VerificationStage::start(inbound.clone(), outbound.clone(), verifier);

        let service = Self {
            identity,
            handlers,
            peers,
            inbound,
            outbound,
            endpoint,
            stage,
            dispatcher,
            ready,
            ready_signal,
        };

        for peer in &config.peers {
            if let Err(e) = service.add_peer(peer).await {
                warn!(peer = %peer, error = %e, "failed to connect to configured peer");
            }
        }

        service.ready_signal.set_ready();
        Ok(service)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Peers that have registered with us.
    pub fn peer_registry(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    /// Resolves once every owned worker is running.
    pub fn ready(&self) -> Readiness {
        self.ready.clone()
    }

    pub fn register_handler(&self, message_type: &str, handler: Arc<dyn Handler>) {
        self.handlers.insert(message_type, handler);
    }

    /// Dial a peer and add it to the broadcast fan-out set.
    pub async fn add_peer(&self, url: &str) -> Result<(), NetError> {
        let connection =
            PeerConnection::connect(url, self.identity.clone(), self.handlers.clone()).await?;
        self.endpoint.add_connection(Arc::new(connection));
        Ok(())
    }

    /// Fan a message out to every currently connected peer. Returns one
    /// pending reply per peer; dropping them is fine for fire-and-forget.
    pub fn broadcast_message(&self, message_type: &str, content: Vec<u8>) -> Vec<PendingReply> {
        self.endpoint.broadcast(message_type, content)
    }

    /// Send to one connected peer, addressed by the URL it was dialed on.
    pub fn send_to(
        &self,
        url: &str,
        message_type: &str,
        content: Vec<u8>,
    ) -> Result<PendingReply, NetError> {
        let connection = self
            .endpoint
            .connection_to(url)
            .ok_or_else(|| NetError::UnknownPeer(url.to_string()))?;
        Ok(connection.send(Envelope::new(message_type, String::new(), content))?)
    }

    pub fn connection_count(&self) -> usize {
        self.endpoint.connection_count()
    }

    /// Feed an application payload into the verification pipeline, as the
    /// gossip handler does for remote messages.
    pub fn post_inbound(&self, message: GossipMessage) {
        self.inbound.put(message);
    }

    /// Tear down in reverse dependency order: verification stage,
    /// dispatcher, outbound connections (best-effort unregister), then the
    /// endpoint, which drains its send queue before closing sockets.
    /// In-flight futures resolve as `Cancelled`.
    pub async fn stop(self) {
        debug!("stopping network service");
        self.stage.stop().await;
        self.dispatcher.stop();
        self.outbound.notify();
        self.endpoint.stop().await;
    }
}

// =============================================================================
// LOOPBACK NETWORK
// =============================================================================

/// Application-level messages a network hands to the dispatcher.
#[derive(Debug, Clone)]
pub enum AppMessage {
    BlockRequest { block_id: String },
    Block { block: Vec<u8> },
    Batch { batch: Vec<u8> },
}

/// Wire container for a batch payload fed through [`LoopbackNetwork::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchList {
    pub batches: Vec<Vec<u8>>,
}

/// Socketless stand-in for the transport: feeds application messages
/// straight into a dispatcher. Useful for exercising dispatcher logic
/// without peers.
pub struct LoopbackNetwork {
    dispatcher: Arc<dyn Dispatcher>,
}

impl LoopbackNetwork {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn send_message(&self, message: AppMessage) {
        match message {
            AppMessage::BlockRequest { block_id } => self.dispatcher.on_block_request(&block_id),
            AppMessage::Block { block } => self.dispatcher.on_block_received(block),
            AppMessage::Batch { batch } => self.dispatcher.on_batch_received(batch),
        }
    }

    /// Decode a serialized [`BatchList`] and hand each batch over.
    pub fn load(&self, data: &[u8]) -> Result<(), postcard::Error> {
        let list: BatchList = serde_safe::from_bytes(data)?;
        for batch in list.batches {
            self.dispatcher.on_batch_received(batch);
        }
        Ok(())
    }
}
