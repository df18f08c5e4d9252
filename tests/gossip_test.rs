//! End-to-end gossip transport tests over loopback TCP.
//!
//! Run with: cargo test --test gossip_test

use gossipnet::{
    AcceptAll, Dispatcher, Envelope, GossipMessage, NetConfig, NetworkService,
    NetworkAcknowledgement, AckStatus, NotifyQueue, PeerRegisterRequest, PendingReply, PingRequest,
    Readiness, ReplyError, generate_correlation_id, message_type, to_bytes, from_bytes, wire,
};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

/// Dispatcher that drains the outbound queue into a vector.
#[derive(Default)]
struct CollectingDispatcher {
    queue: Mutex<Option<Arc<NotifyQueue<GossipMessage>>>>,
    received: Arc<Mutex<Vec<GossipMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CollectingDispatcher {
    fn received(&self) -> Vec<GossipMessage> {
        self.received.lock().unwrap().clone()
    }
}

impl Dispatcher for CollectingDispatcher {
    fn set_incoming_msg_queue(&self, queue: Arc<NotifyQueue<GossipMessage>>) {
        *self.queue.lock().unwrap() = Some(queue);
    }

    fn set_ready_signal(&self, _ready: Readiness) {}

    fn start(&self) {
        let queue = self.queue.lock().unwrap().clone().expect("queue wired before start");
        let received = self.received.clone();
        let worker = tokio::spawn(async move {
            loop {
                let message = queue.pop().await;
                received.lock().unwrap().push(message);
            }
        });
        *self.worker.lock().unwrap() = Some(worker);
    }

    fn stop(&self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }

    fn on_block_request(&self, _block_id: &str) {}
    fn on_block_received(&self, _block: Vec<u8>) {}
    fn on_batch_received(&self, _batch: Vec<u8>) {}
}

async fn start_service(
    identity: &[u8],
    peers: Vec<String>,
) -> (NetworkService, Arc<CollectingDispatcher>) {
    let dispatcher = Arc::new(CollectingDispatcher::default());
    let config = NetConfig {
        endpoint: "127.0.0.1:0".to_string(),
        peers,
        identity: Some(identity.to_vec()),
    };
    let service = NetworkService::start(config, dispatcher.clone(), Arc::new(AcceptAll))
        .await
        .expect("service starts");
    (service, dispatcher)
}

async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Hand-rolled client speaking the wire protocol directly, for asserting
/// exact server-side behavior. Buffers coalesced envelope lists.
struct RawPeer {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    pending: VecDeque<Envelope>,
}

impl RawPeer {
    async fn connect(addr: &str, identity: &[u8]) -> Self {
        let stream = TcpStream::connect(addr).await.expect("dial server");
        let (read, mut write) = stream.into_split();
        wire::write_hello(&mut write, &identity.to_vec()).await.expect("announce identity");
        Self { read, write, pending: VecDeque::new() }
    }

    async fn send(&mut self, envelope: Envelope) {
        wire::write_envelopes(&mut self.write, &gossipnet::EnvelopeList::single(envelope))
            .await
            .expect("send envelope");
    }

    async fn recv_one(&mut self) -> Envelope {
        if let Some(envelope) = self.pending.pop_front() {
            return envelope;
        }
        let list = tokio::time::timeout(Duration::from_secs(2), wire::read_envelopes(&mut self.read))
            .await
            .expect("reply within deadline")
            .expect("readable frame");
        self.pending.extend(list);
        self.pending.pop_front().expect("non-empty list")
    }
}

fn register_envelope(identity: &[u8]) -> Envelope {
    Envelope::new(
        message_type::REGISTER,
        generate_correlation_id(),
        to_bytes(&PeerRegisterRequest { identity: identity.to_vec() }).unwrap(),
    )
}

#[tokio::test]
async fn register_is_acked_and_recorded() {
    let (server, _dispatcher) = start_service(b"server", vec![]).await;
    let addr = server.local_addr().to_string();

    let mut peer = RawPeer::connect(&addr, b"peer-A").await;
    let request = register_envelope(b"peer-A");
    let correlation_id = request.correlation_id.clone();
    peer.send(request).await;

    let ack = peer.recv_one().await;
    assert_eq!(ack.message_type, message_type::ACK);
    assert_eq!(ack.correlation_id, correlation_id);
    let status: NetworkAcknowledgement = from_bytes(&ack.content).unwrap();
    assert_eq!(status.status, AckStatus::Ok);

    assert!(server.peer_registry().contains(b"peer-A"));
    server.stop().await;
}

#[tokio::test]
async fn duplicate_register_deduplicates_but_acks_both() {
    let (server, _dispatcher) = start_service(b"server", vec![]).await;
    let addr = server.local_addr().to_string();

    let mut peer = RawPeer::connect(&addr, b"peer-A").await;

    let first = register_envelope(b"peer-A");
    let second = register_envelope(b"peer-A");
    let first_id = first.correlation_id.clone();
    let second_id = second.correlation_id.clone();
    peer.send(first).await;
    let first_ack = peer.recv_one().await;
    peer.send(second).await;
    let second_ack = peer.recv_one().await;

    assert_eq!(first_ack.correlation_id, first_id);
    assert_eq!(second_ack.correlation_id, second_id);
    assert_eq!(server.peer_registry().records(b"peer-A").len(), 1);
    server.stop().await;
}

#[tokio::test]
async fn configured_peer_registers_on_connect() {
    let (server, _sd) = start_service(b"server", vec![]).await;
    let addr = server.local_addr().to_string();

    let (client, _cd) = start_service(b"peer-A", vec![addr]).await;

    assert!(
        wait_for(|| server.peer_registry().contains(b"peer-A"), Duration::from_secs(2)).await,
        "server never recorded the registration"
    );

    client.stop().await;
    // Teardown sends a best-effort unregister.
    assert!(
        wait_for(|| !server.peer_registry().contains(b"peer-A"), Duration::from_secs(2)).await,
        "server kept the registration after unregister"
    );
    server.stop().await;
}

#[tokio::test]
async fn broadcast_reaches_every_connected_peer() {
    let (peer_b, dispatcher_b) = start_service(b"peer-B", vec![]).await;
    let (peer_c, dispatcher_c) = start_service(b"peer-C", vec![]).await;
    let (hub, _hd) = start_service(
        b"hub",
        vec![peer_b.local_addr().to_string(), peer_c.local_addr().to_string()],
    )
    .await;
    assert_eq!(hub.connection_count(), 2);

    let payload = to_bytes(&GossipMessage {
        content: b"hello".to_vec(),
        content_type: "demo".into(),
    })
    .unwrap();
    let replies = hub.broadcast_message(message_type::GOSSIP, payload);
    assert_eq!(replies.len(), 2);

    // Every target acked under its own correlation id.
    let mut ids = HashSet::new();
    for reply in replies {
        ids.insert(reply.correlation_id().to_string());
        let ack = reply.wait(Duration::from_secs(2)).await.expect("broadcast acked");
        assert_eq!(ack.message_type, message_type::ACK);
    }
    assert_eq!(ids.len(), 2);

    // Both peers dispatched the payload.
    for dispatcher in [&dispatcher_b, &dispatcher_c] {
        assert!(
            wait_for(|| dispatcher.received().len() == 1, Duration::from_secs(2)).await,
            "peer did not dispatch the broadcast"
        );
        assert_eq!(dispatcher.received()[0].content, b"hello");
    }

    hub.stop().await;
    peer_b.stop().await;
    peer_c.stop().await;
}

#[tokio::test]
async fn concurrent_pings_resolve_by_correlation() {
    let (server, _sd) = start_service(b"server", vec![]).await;
    let addr = server.local_addr().to_string();
    let (client, _cd) = start_service(b"peer-A", vec![addr.clone()]).await;

    let ping = to_bytes(&PingRequest).unwrap();
    let replies: Vec<PendingReply> = (0..100)
        .map(|_| client.send_to(&addr, message_type::PING, ping.clone()).expect("send ping"))
        .collect();

    let ids: HashSet<String> =
        replies.iter().map(|r| r.correlation_id().to_string()).collect();
    assert_eq!(ids.len(), 100);

    for reply in replies {
        let ack = reply.wait(Duration::from_secs(5)).await.expect("ping acked");
        assert_eq!(ack.message_type, message_type::ACK);
        let status: NetworkAcknowledgement = from_bytes(&ack.content).unwrap();
        assert_eq!(status.status, AckStatus::Ok);
    }

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn pipeline_preserves_order_to_dispatcher() {
    let (service, dispatcher) = start_service(b"solo", vec![]).await;

    for i in 0..20u8 {
        service.post_inbound(GossipMessage { content: vec![i], content_type: "seq".into() });
    }

    assert!(
        wait_for(|| dispatcher.received().len() == 20, Duration::from_secs(2)).await,
        "dispatcher did not see all items"
    );
    let received = dispatcher.received();
    for (i, message) in received.iter().enumerate() {
        assert_eq!(message.content, vec![i as u8]);
    }

    service.stop().await;
}

#[tokio::test]
async fn stop_cancels_in_flight_futures() {
    let (server, _sd) = start_service(b"server", vec![]).await;
    let addr = server.local_addr().to_string();
    let (client, _cd) = start_service(b"peer-A", vec![addr.clone()]).await;

    // Unknown type: the server's default handler drops it, so no reply
    // ever comes and the futures stay in flight.
    let replies: Vec<PendingReply> = (0..50)
        .map(|_| client.send_to(&addr, "test/void", vec![]).expect("send"))
        .collect();

    tokio::time::timeout(Duration::from_secs(5), client.stop())
        .await
        .expect("stop finished in bounded time");

    for reply in replies {
        assert_eq!(
            reply.wait(Duration::from_secs(1)).await,
            Err(ReplyError::Cancelled)
        );
    }

    server.stop().await;
}
