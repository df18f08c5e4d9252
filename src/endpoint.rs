//! Inbound listener multiplexing many peer links behind one socket.
//!
//! Every accepted link announces an identity in its first frame; the
//! endpoint records a route for it and stamps the identity onto each
//! inbound envelope. Outbound envelopes carry the routing identity in
//! their `sender` field and drain through an endpoint-wide send queue to
//! the matching per-link writer. Broadcast fan-out snapshots the outbound
//! connection list at enqueue time, so peers added later never see an
//! earlier broadcast.

use crate::connection::PeerConnection;
use crate::future::{FutureRegistry, PendingReply, ReplyError};
use crate::handler::{HandlerTable, Responder};
use crate::link::{FramedLink, LinkSender, ReceiveContext};
use crate::types::{Envelope, PeerIdentity, generate_correlation_id};
use crate::wire;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Links that never announce themselves are dropped after this long.
const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

struct BroadcastJob {
    message_type: String,
    content: Vec<u8>,
    /// Connection list snapshot with one pre-registered correlation id per
    /// target.
    targets: Vec<(Arc<PeerConnection>, String)>,
}

struct InboundLink {
    link: FramedLink,
    reader: JoinHandle<()>,
}

type Routes = Arc<RwLock<HashMap<PeerIdentity, LinkSender>>>;

pub struct ServerEndpoint {
    local_addr: SocketAddr,
    futures: Arc<FutureRegistry>,
    routes: Routes,
    send_tx: mpsc::UnboundedSender<Envelope>,
    broadcast_tx: mpsc::UnboundedSender<BroadcastJob>,
    connections: Arc<RwLock<Vec<Arc<PeerConnection>>>>,
    inbound_links: Arc<Mutex<Vec<InboundLink>>>,
    /// Per-link setup tasks awaiting the identity announcement.
    setup_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept_task: JoinHandle<()>,
    send_task: JoinHandle<()>,
    broadcast_task: JoinHandle<()>,
}

impl ServerEndpoint {
    /// Bind the listener and start the accept, send, and broadcast
    /// workers. Returns once the socket is bound, so producers observing
    /// this endpoint never race its startup.
    pub async fn bind(addr: &str, handlers: Arc<HandlerTable>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "network endpoint listening");

        let futures = Arc::new(FutureRegistry::new());
        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let inbound_links = Arc::new(Mutex::new(Vec::new()));
        let setup_tasks = Arc::new(Mutex::new(Vec::new()));
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            handlers,
            futures.clone(),
            routes.clone(),
            send_tx.clone(),
            inbound_links.clone(),
            setup_tasks.clone(),
        ));
        let send_task = tokio::spawn(send_loop(send_rx, routes.clone()));
        let broadcast_task = tokio::spawn(broadcast_loop(broadcast_rx));

        Ok(Self {
            local_addr,
            futures,
            routes,
            send_tx,
            broadcast_tx,
            connections: Arc::new(RwLock::new(Vec::new())),
            inbound_links,
            setup_tasks,
            accept_task,
            send_task,
            broadcast_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Add an outbound connection to the broadcast fan-out set.
    pub fn add_connection(&self, connection: Arc<PeerConnection>) {
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(connection);
    }

    pub fn connection_to(&self, url: &str) -> Option<Arc<PeerConnection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.url() == url)
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Enqueue a broadcast and return one pending reply per current
    /// outbound peer, each with its own correlation id.
    pub fn broadcast(&self, message_type: &str, content: Vec<u8>) -> Vec<PendingReply> {
        let connections: Vec<Arc<PeerConnection>> = self
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut replies = Vec::with_capacity(connections.len());
        let mut targets = Vec::with_capacity(connections.len());
        for connection in connections {
            let correlation_id = generate_correlation_id();
            match connection.register_future(correlation_id.clone()) {
                Ok(reply) => {
                    replies.push(reply);
                    targets.push((connection, correlation_id));
                }
                Err(e) => {
                    warn!(peer = connection.url(), error = %e, "skipping broadcast target");
                }
            }
        }

        let job = BroadcastJob { message_type: message_type.to_string(), content, targets };
        if self.broadcast_tx.send(job).is_err() {
            warn!("broadcast dropped, endpoint stopped");
            return Vec::new();
        }
        replies
    }

    /// Stop accepting, drain the send and broadcast queues, flush and
    /// close every link, and cancel whatever is still pending.
    pub async fn stop(self) {
        debug!("stopping network endpoint");
        self.accept_task.abort();
        for task in self.setup_tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }

        let connections: Vec<Arc<PeerConnection>> = {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            connections.drain(..).collect()
        };
        for connection in connections {
            connection.stop().await;
        }

        // Readers stop first so nothing new lands on the send queue, then
        // the drainers run the queues dry, then writers flush out.
        let links: Vec<InboundLink> = {
            let mut links = self.inbound_links.lock().unwrap_or_else(|e| e.into_inner());
            links.drain(..).collect()
        };
        for link in &links {
            link.reader.abort();
        }

        drop(self.broadcast_tx);
        let _ = self.broadcast_task.await;
        drop(self.send_tx);
        let _ = self.send_task.await;

        for InboundLink { link, .. } in links {
            link.close().await;
        }
        self.routes.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.futures.fail_all(ReplyError::Cancelled);
    }
}

async fn accept_loop(
    listener: TcpListener,
    handlers: Arc<HandlerTable>,
    futures: Arc<FutureRegistry>,
    routes: Routes,
    send_tx: mpsc::UnboundedSender<Envelope>,
    inbound_links: Arc<Mutex<Vec<InboundLink>>>,
    setup_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(%remote, "inbound link accepted");

        let handlers = handlers.clone();
        let futures = futures.clone();
        let routes = routes.clone();
        let send_tx = send_tx.clone();
        let inbound_links = inbound_links.clone();
        let setup = tokio::spawn(async move {
            let (mut read_half, write_half) = stream.into_split();
            let identity = match tokio::time::timeout(HELLO_TIMEOUT, wire::read_hello(&mut read_half)).await {
                Ok(Ok(identity)) => identity,
                Ok(Err(e)) => {
                    warn!(%remote, error = %e, "dropping link without identity announcement");
                    return;
                }
                Err(_) => {
                    warn!(%remote, "dropping link, identity announcement timed out");
                    return;
                }
            };
            info!(
                peer = %String::from_utf8_lossy(&identity),
                %remote,
                "peer link established"
            );

            let link = FramedLink::start(write_half);
            let link_sender = link.sender();
            routes
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(identity.clone(), link_sender.clone());

            let reader = {
                let ctx = ReceiveContext { futures, handlers };
                let responder = Responder::new(move |envelope| {
                    if send_tx.send(envelope).is_err() {
                        warn!("response dropped, endpoint send queue closed");
                    }
                });
                tokio::spawn(async move {
                    if let Err(e) = ctx.run(&mut read_half, Some(&identity), &responder).await {
                        debug!(peer = %String::from_utf8_lossy(&identity), error = %e, "inbound link closed");
                    }
                    // Drop the route unless a newer link took the identity.
                    let mut routes = routes.write().unwrap_or_else(|e| e.into_inner());
                    if routes.get(&identity).is_some_and(|s| s.same_channel(&link_sender)) {
                        routes.remove(&identity);
                    }
                })
            };
            inbound_links
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(InboundLink { link, reader });
        });
        let mut setup_tasks = setup_tasks.lock().unwrap_or_else(|e| e.into_inner());
        setup_tasks.retain(|task| !task.is_finished());
        setup_tasks.push(setup);
    }
}

/// Drain the endpoint send queue, routing each envelope by its sender
/// identity to the matching per-link writer.
async fn send_loop(mut rx: mpsc::UnboundedReceiver<Envelope>, routes: Routes) {
    while let Some(envelope) = rx.recv().await {
        let route = routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&envelope.sender)
            .cloned();
        match route {
            Some(route) => {
                debug!(
                    message_type = %envelope.message_type,
                    peer = %String::from_utf8_lossy(&envelope.sender),
                    "sending envelope"
                );
                if route.send(envelope).is_err() {
                    warn!("outbound envelope dropped, link closed");
                }
            }
            None => {
                warn!(
                    peer = %String::from_utf8_lossy(&envelope.sender),
                    "no route for outbound envelope"
                );
            }
        }
    }
}

/// Drain the broadcast queue. Each job already carries its target snapshot
/// and per-target correlation ids; iteration order within one job is the
/// snapshot order.
async fn broadcast_loop(mut rx: mpsc::UnboundedReceiver<BroadcastJob>) {
    while let Some(job) = rx.recv().await {
        debug!(
            message_type = %job.message_type,
            peers = job.targets.len(),
            "broadcasting to connected peers"
        );
        for (connection, correlation_id) in job.targets {
            let envelope = Envelope::new(&job.message_type, correlation_id.clone(), job.content.clone());
            if let Err(e) = connection.send_raw(envelope) {
                warn!(peer = connection.url(), error = %e, "broadcast send failed");
                connection.fail_future(&correlation_id, ReplyError::PeerUnreachable);
            }
        }
    }
}
