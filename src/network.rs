use crate::{
    config,
    error::MessagingError,
    protocol::{InboundMessage, Subject},
};
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    core::muxing::StreamMuxerBox,
    gossipsub,
    identity, quic, swarm::SwarmEvent, Multiaddr, PeerId, Swarm, Transport,
};
use libp2p::gossipsub::{
    AllowAllSubscriptionFilter, Behaviour as Gossipsub, Event as GossipsubEvent, IdentTopic,
    IdentityTransform, MessageAuthenticity,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Pub/sub transport the oracle reads requests from and publishes to.
/// Delivery may duplicate, drop or reorder messages.
#[async_trait]
pub trait Messaging: Send + Sync {
    /// Address other parties use to reach this node.
    fn local_address(&self) -> String;

    /// Up to `max` messages received since the previous poll.
    async fn poll(&self, max: usize) -> Result<Vec<InboundMessage>, MessagingError>;

    async fn broadcast(&self, subject: Subject, payload: &str) -> Result<(), MessagingError>;

    async fn send(&self, address: &str, subject: Subject, payload: &str) -> Result<(), MessagingError>;
}

const TOP_REQUESTS: &str = "oracle/requests/v1";
const TOP_NOTICES: &str = "oracle/notices/v1";
const TOP_DIRECT: &str = "oracle/direct/v1";

const MAX_DECODE_FAILURES: u32 = 10;
const BAN_DURATION_SECS: u64 = 600;
const RATE_LIMIT_WINDOW_SECS: u64 = 10;
const MAX_MESSAGES_PER_WINDOW: u32 = 500;

/// What travels inside a gossipsub message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    from: String,
    to: Option<String>,
    subject: String,
    timestamp: u64,
    payload: String,
}

fn topic_for(subject: Subject, direct: bool) -> &'static str {
    if direct {
        return TOP_DIRECT;
    }
    match subject {
        Subject::TransactionRequest | Subject::SignedTransaction => TOP_REQUESTS,
        Subject::NoFee | Subject::AddressDuplicate => TOP_NOTICES,
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct PeerScore {
    decode_failures: u32,
    banned_until: Option<Instant>,
    message_count: u32,
    window_start: Instant,
}

impl PeerScore {
    fn new() -> Self {
        Self { decode_failures: 0, banned_until: None, message_count: 0, window_start: Instant::now() }
    }

    fn record_decode_failure(&mut self) {
        self.decode_failures += 1;
        if self.decode_failures >= MAX_DECODE_FAILURES {
            self.banned_until = Some(Instant::now() + Duration::from_secs(BAN_DURATION_SECS));
        }
    }

    fn is_banned(&mut self) -> bool {
        if let Some(banned_until) = self.banned_until {
            if Instant::now() < banned_until {
                return true;
            }
            self.banned_until = None;
            self.decode_failures = 0;
        }
        false
    }

    fn check_rate_limit(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) > Duration::from_secs(RATE_LIMIT_WINDOW_SECS) {
            self.window_start = now;
            self.message_count = 0;
        }
        self.message_count += 1;
        self.message_count <= MAX_MESSAGES_PER_WINDOW
    }
}

#[derive(Debug)]
struct Outbound {
    topic: &'static str,
    data: Vec<u8>,
}

/// [`Messaging`] over a libp2p QUIC + gossipsub swarm running on its own task.
pub struct GossipMessenger {
    local_address: String,
    command_tx: mpsc::UnboundedSender<Outbound>,
    inbox: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
}

fn load_or_create_peer_identity(dir: &str) -> anyhow::Result<identity::Keypair> {
    let path = Path::new(dir).join("peer_identity.key");
    if path.exists() {
        let key_data = fs::read(&path)?;
        return Ok(identity::Keypair::from_protobuf_encoding(&key_data)?);
    }
    fs::create_dir_all(dir)?;
    let keypair = identity::Keypair::generate_ed25519();
    fs::write(&path, keypair.to_protobuf_encoding()?)?;
    Ok(keypair)
}

pub fn peer_id_string(storage_dir: &str) -> anyhow::Result<String> {
    let keys = load_or_create_peer_identity(storage_dir)?;
    Ok(PeerId::from(keys.public()).to_string())
}

pub async fn spawn(net_cfg: config::Net, storage_dir: &str) -> anyhow::Result<GossipMessenger> {
    let id_keys = load_or_create_peer_identity(storage_dir)?;
    let peer_id = PeerId::from(id_keys.public());
    info!(%peer_id, "local peer id");

    let transport = quic::tokio::Transport::new(quic::Config::new(&id_keys))
        .map(|(peer_id, muxer), _| (peer_id, StreamMuxerBox::new(muxer)))
        .boxed();

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(1))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .mesh_n_low(0)
        .mesh_outbound_min(0)
        .flood_publish(true)
        .build()?;

    let mut gs: Gossipsub<IdentityTransform, AllowAllSubscriptionFilter> = Gossipsub::new(
        MessageAuthenticity::Signed(id_keys.clone()),
        gossipsub_config,
    ).map_err(|e| anyhow::anyhow!(e))?;
    for t in [TOP_REQUESTS, TOP_NOTICES, TOP_DIRECT] {
        gs.subscribe(&IdentTopic::new(t))?;
    }

    let mut swarm = Swarm::new(
        transport,
        gs,
        peer_id,
        libp2p::swarm::Config::with_tokio_executor()
            .with_idle_connection_timeout(Duration::from_secs(60)),
    );

    let mut port = net_cfg.listen_port;
    loop {
        let listen_addr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", port);
        match swarm.listen_on(listen_addr.parse()?) {
            Ok(_) => break,
            Err(e) if e.to_string().contains("Address already in use") => {
                port += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(public_ip) = &net_cfg.public_ip {
        let external_addr: Multiaddr = format!("/ip4/{}/udp/{}/quic-v1", public_ip, port).parse()?;
        swarm.add_external_address(external_addr);
    }

    for addr in &net_cfg.bootstrap {
        debug!(%addr, "dialing bootstrap node");
        if let Err(e) = swarm.dial(addr.parse::<Multiaddr>()?) {
            warn!(%addr, error = %e, "failed to dial bootstrap node");
        }
    }

    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<Outbound>();
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<InboundMessage>();
    let local_address = peer_id.to_string();
    let me = local_address.clone();

    let mut peer_scores: HashMap<PeerId, PeerScore> = HashMap::new();
    let mut pending: VecDeque<Outbound> = VecDeque::new();
    let mut connected_peers: HashSet<PeerId> = HashSet::new();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            debug!(%peer_id, "connected to peer");
                            connected_peers.insert(peer_id);
                            let mut still_pending = VecDeque::new();
                            while let Some(out) = pending.pop_front() {
                                if swarm.behaviour_mut().publish(IdentTopic::new(out.topic), out.data.clone()).is_err() {
                                    still_pending.push_back(out);
                                }
                            }
                            pending = still_pending;
                        }
                        SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                            debug!(%peer_id, ?cause, "disconnected from peer");
                            connected_peers.remove(&peer_id);
                        }
                        SwarmEvent::Behaviour(GossipsubEvent::Message { message, .. }) => {
                            let Some(source) = message.source else { continue };
                            let score = peer_scores.entry(source).or_insert_with(PeerScore::new);
                            if score.is_banned() || !score.check_rate_limit() { continue; }

                            let envelope = match bincode::deserialize::<Envelope>(&message.data) {
                                Ok(env) => env,
                                Err(e) => {
                                    debug!(peer = %source, error = %e, "undecodable envelope");
                                    score.record_decode_failure();
                                    continue;
                                }
                            };
                            if message.topic.as_str() == TOP_DIRECT && envelope.to.as_deref() != Some(me.as_str()) {
                                continue;
                            }
                            let inbound = InboundMessage {
                                from_address: envelope.from,
                                timestamp: envelope.timestamp,
                                subject: envelope.subject,
                                payload: envelope.payload,
                            };
                            if inbox_tx.send(inbound).is_err() {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                command = command_rx.recv() => {
                    let Some(out) = command else { break };
                    if let Err(e) = swarm.behaviour_mut().publish(IdentTopic::new(out.topic), out.data.clone()) {
                        if matches!(e, gossipsub::PublishError::InsufficientPeers) {
                            pending.push_back(out);
                        } else {
                            warn!(topic = out.topic, error = %e, "failed to publish");
                        }
                    }
                }
            }
        }
        debug!("network task stopped");
    });

    Ok(GossipMessenger {
        local_address,
        command_tx,
        inbox: Mutex::new(inbox_rx),
    })
}

impl GossipMessenger {
    fn publish(&self, to: Option<&str>, subject: Subject, payload: &str) -> Result<(), MessagingError> {
        let envelope = Envelope {
            from: self.local_address.clone(),
            to: to.map(str::to_string),
            subject: subject.as_str().to_string(),
            timestamp: unix_now(),
            payload: payload.to_string(),
        };
        let data = bincode::serialize(&envelope).map_err(|e| MessagingError::Encode(e.to_string()))?;
        self.command_tx
            .send(Outbound { topic: topic_for(subject, to.is_some()), data })
            .map_err(|_| MessagingError::Closed)
    }
}

#[async_trait]
impl Messaging for GossipMessenger {
    fn local_address(&self) -> String {
        self.local_address.clone()
    }

    async fn poll(&self, max: usize) -> Result<Vec<InboundMessage>, MessagingError> {
        let mut inbox = self.inbox.lock().await;
        let mut out = Vec::new();
        while out.len() < max {
            match inbox.try_recv() {
                Ok(msg) => out.push(msg),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if out.is_empty() {
                        return Err(MessagingError::Closed);
                    }
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn broadcast(&self, subject: Subject, payload: &str) -> Result<(), MessagingError> {
        self.publish(None, subject, payload)
    }

    async fn send(&self, address: &str, subject: Subject, payload: &str) -> Result<(), MessagingError> {
        self.publish(Some(address), subject, payload)
    }
}
