//! Message-type demultiplexer and the built-in gossip handlers.
//!
//! An envelope that fails reply correlation is routed here: the table maps
//! its `message_type` to a handler, falling back to the default handler
//! for unknown types. Handlers reply through a [`Responder`] that writes
//! back along the link the envelope arrived on.
//!
//! Handlers get their collaborators through an explicit [`HandlerContext`]
//! at construction time instead of a back-reference to the service.

use crate::peers::PeerRegistry;
use crate::queue::NotifyQueue;
use crate::serde_safe;
use crate::types::{
    AckStatus, Envelope, GossipMessage, NetworkAcknowledgement, PeerRegisterRequest,
    PeerUnregisterRequest, PingRequest, message_type,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Write-back half handed to a handler along with each envelope. Wraps the
/// enqueue function of the originating link's ordered send path.
pub struct Responder {
    send: Box<dyn Fn(Envelope) + Send + Sync>,
}

impl Responder {
    pub fn new(send: impl Fn(Envelope) + Send + Sync + 'static) -> Self {
        Self { send: Box::new(send) }
    }

    pub fn send(&self, envelope: Envelope) {
        (self.send)(envelope);
    }
}

pub trait Handler: Send + Sync {
    fn handle(&self, envelope: Envelope, responder: &Responder);
}

/// Shared collaborators for the built-in handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub peers: Arc<PeerRegistry>,
    pub inbound: Arc<NotifyQueue<GossipMessage>>,
}

/// `message_type` → handler, with a default slot for unknown types.
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    default: Arc<dyn Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default: Arc::new(DefaultHandler),
        }
    }

    pub fn insert(&self, message_type: &str, handler: Arc<dyn Handler>) {
        debug!(message_type, "adding handler");
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message_type.to_string(), handler);
    }

    pub fn get(&self, message_type: &str) -> Arc<dyn Handler> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(message_type)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

fn ack_for(original: &Envelope) -> Envelope {
    let content =
        serde_safe::to_bytes(&NetworkAcknowledgement { status: AckStatus::Ok }).unwrap_or_default();
    Envelope::reply_to(original, message_type::ACK, content)
}

/// Log-and-drop for unknown message types.
pub struct DefaultHandler;

impl Handler for DefaultHandler {
    fn handle(&self, envelope: Envelope, _responder: &Responder) {
        warn!(message_type = %envelope.message_type, "dropping message of unknown type");
    }
}

/// `gossip/register`: record the peer and ack.
pub struct PeerRegisterHandler {
    ctx: HandlerContext,
}

impl PeerRegisterHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

impl Handler for PeerRegisterHandler {
    fn handle(&self, envelope: Envelope, responder: &Responder) {
        let request: PeerRegisterRequest = match serde_safe::from_bytes(&envelope.content) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed register payload");
                return;
            }
        };
        self.ctx.peers.register(&envelope.sender, &request.identity);
        responder.send(ack_for(&envelope));
    }
}

/// `gossip/unregister`: forget the peer and ack.
pub struct PeerUnregisterHandler {
    ctx: HandlerContext,
}

impl PeerUnregisterHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

impl Handler for PeerUnregisterHandler {
    fn handle(&self, envelope: Envelope, responder: &Responder) {
        let request: PeerUnregisterRequest = match serde_safe::from_bytes(&envelope.content) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed unregister payload");
                return;
            }
        };
        self.ctx.peers.unregister(&envelope.sender, &request.identity);
        responder.send(ack_for(&envelope));
    }
}

/// `gossip/msg`: feed the payload to the verification pipeline and ack.
pub struct GossipMessageHandler {
    ctx: HandlerContext,
}

impl GossipMessageHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

impl Handler for GossipMessageHandler {
    fn handle(&self, envelope: Envelope, responder: &Responder) {
        let message: GossipMessage = match serde_safe::from_bytes(&envelope.content) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping malformed gossip payload");
                return;
            }
        };
        debug!(
            sender = %String::from_utf8_lossy(&envelope.sender),
            content_type = %message.content_type,
            "gossip message received"
        );
        self.ctx.inbound.put(message);
        responder.send(ack_for(&envelope));
    }
}

/// `gossip/ack` with no live future: the request side already discarded
/// its pending reply (fire-and-forget broadcast), so the ack is spent.
pub struct AckHandler;

impl Handler for AckHandler {
    fn handle(&self, envelope: Envelope, _responder: &Responder) {
        debug!(
            correlation_id = %envelope.correlation_id,
            "ack without pending future"
        );
    }
}

/// `gossip/ping`: ack immediately, no state change.
pub struct PingHandler;

impl Handler for PingHandler {
    fn handle(&self, envelope: Envelope, responder: &Responder) {
        if let Err(e) = serde_safe::from_bytes::<PingRequest>(&envelope.content) {
            warn!(error = %e, "dropping malformed ping payload");
            return;
        }
        responder.send(ack_for(&envelope));
    }
}
