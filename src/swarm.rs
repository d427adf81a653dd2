//! Network endpoint driver.
//!
//! Each peer node owns one endpoint: a libp2p swarm (kademlia in server mode
//! plus identify) running in its own task. The task is commanded over an
//! unbounded channel and answers through oneshot replies, so an endpoint
//! handle is cheaply cloneable and safe to use from concurrent callers.

use crate::registry::AddrRecord;
use futures_util::StreamExt;
use libp2p::{
    identify, identity,
    kad::{self, store::MemoryStore},
    noise,
    swarm::{dial_opts::DialOpts, DialError, NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task,
    time::timeout,
};

const PROTOCOL_VERSION: &str = "/dht-tester/1.0.0";
const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("failed to build the endpoint: {0}")]
    Setup(String),
    #[error("failed to bind the listen address: {0}")]
    Bind(String),
    #[error("endpoint has shut down")]
    Closed,
    #[error("failed to reach peer: {0}")]
    Unreachable(String),
    #[error("no known peers")]
    NoKnownPeers,
    #[error("provider record store rejected the key: {0}")]
    Store(String),
    #[error("query timed out")]
    QueryTimeout,
}

#[derive(NetworkBehaviour)]
struct NodeBehaviour {
    kad: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
}

impl NodeBehaviour {
    fn new(keypair: &identity::Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();

        let store = MemoryStore::new(peer_id);
        let mut kad = kad::Behaviour::new(peer_id, store);
        // Every node both serves and queries provider records.
        kad.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(identify::Config::new(
            PROTOCOL_VERSION.to_string(),
            keypair.public(),
        ));

        Self { kad, identify }
    }
}

/// Task the endpoint will execute immediately.
enum Command {
    /// Open a connection to the given peer.
    Dial {
        record: AddrRecord,
        reply: oneshot::Sender<Result<(), EndpointError>>,
    },
    /// Run the DHT's own bootstrap to populate the routing table.
    WarmUp {
        reply: oneshot::Sender<Result<(), EndpointError>>,
    },
    /// Announce this node as a provider for the given record key.
    StartProviding {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<(), EndpointError>>,
    },
    /// Query the DHT for providers of the given record key.
    GetProviders {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<AddrRecord>, EndpointError>>,
    },
    /// Close the endpoint.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle for sending commands to a running endpoint.
#[derive(Clone)]
pub(crate) struct Handle {
    tx: mpsc::UnboundedSender<Command>,
}

impl Handle {
    pub(crate) async fn dial(&self, record: AddrRecord) -> Result<(), EndpointError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Dial { record, reply })
            .map_err(|_| EndpointError::Closed)?;
        rx.await.map_err(|_| EndpointError::Closed)?
    }

    pub(crate) async fn warm_up(&self) -> Result<(), EndpointError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::WarmUp { reply })
            .map_err(|_| EndpointError::Closed)?;
        rx.await.map_err(|_| EndpointError::Closed)?
    }

    pub(crate) async fn start_providing(&self, key: Vec<u8>) -> Result<(), EndpointError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::StartProviding { key, reply })
            .map_err(|_| EndpointError::Closed)?;
        rx.await.map_err(|_| EndpointError::Closed)?
    }

    pub(crate) async fn providers(&self, key: Vec<u8>) -> Result<Vec<AddrRecord>, EndpointError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::GetProviders { key, reply })
            .map_err(|_| EndpointError::Closed)?;
        rx.await.map_err(|_| EndpointError::Closed)?
    }

    /// Ask the endpoint task to stop and wait until it has.
    pub(crate) async fn shutdown(&self) -> Result<(), EndpointError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply })
            .map_err(|_| EndpointError::Closed)?;
        let _ = rx.await;
        Ok(())
    }
}

/// Build the swarm, bind the listen address and spawn the driver task.
///
/// Returns once the listener has reported its address, so the returned record
/// is immediately usable as a bootstrap target for other nodes.
pub(crate) async fn start(
    keypair: identity::Keypair,
    port: u16,
) -> Result<(Handle, AddrRecord), EndpointError> {
    let peer_id = keypair.public().to_peer_id();

    let mut swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|error| EndpointError::Setup(error.to_string()))?
        .with_behaviour(|keypair| NodeBehaviour::new(keypair))
        .map_err(|error| EndpointError::Setup(error.to_string()))?
        .with_swarm_config(|config| config.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    let listen: Multiaddr = format!("/ip4/127.0.0.1/tcp/{}", port)
        .parse()
        .map_err(|error: libp2p::multiaddr::Error| EndpointError::Setup(error.to_string()))?;
    swarm
        .listen_on(listen)
        .map_err(|error| EndpointError::Bind(error.to_string()))?;

    let addr = timeout(LISTEN_TIMEOUT, async {
        loop {
            match swarm.select_next_some().await {
                SwarmEvent::NewListenAddr { address, .. } => break Ok(address),
                SwarmEvent::ListenerClosed { reason, .. } => {
                    break Err(EndpointError::Bind(format!("listener closed: {:?}", reason)))
                }
                SwarmEvent::ListenerError { error, .. } => {
                    break Err(EndpointError::Bind(error.to_string()))
                }
                _ => {}
            }
        }
    })
    .await
    .map_err(|_| EndpointError::Bind("timed out waiting for the listen address".to_string()))??;

    let record = AddrRecord {
        peer_id,
        addrs: vec![addr],
    };

    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let driver = Driver {
        swarm,
        commands: command_rx,
        local: record.clone(),
        pending_dials: HashMap::new(),
        pending_queries: HashMap::new(),
        known_addrs: HashMap::new(),
    };
    task::spawn(driver.run());

    Ok((Handle { tx: command_tx }, record))
}

enum PendingQuery {
    Provide(oneshot::Sender<Result<(), EndpointError>>),
    WarmUp(oneshot::Sender<Result<(), EndpointError>>),
    Providers {
        found: HashSet<PeerId>,
        reply: oneshot::Sender<Result<Vec<AddrRecord>, EndpointError>>,
    },
}

struct Driver {
    swarm: Swarm<NodeBehaviour>,
    commands: mpsc::UnboundedReceiver<Command>,
    local: AddrRecord,
    pending_dials: HashMap<PeerId, oneshot::Sender<Result<(), EndpointError>>>,
    pending_queries: HashMap<kad::QueryId, PendingQuery>,
    // Listen addresses observed via identify or our own dials, used to fill
    // in the addresses of discovered providers.
    known_addrs: HashMap<PeerId, Vec<Multiaddr>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { record, reply } => {
                for addr in &record.addrs {
                    self.swarm
                        .behaviour_mut()
                        .kad
                        .add_address(&record.peer_id, addr.clone());
                    self.note_address(record.peer_id, addr.clone());
                }

                let opts = DialOpts::peer_id(record.peer_id)
                    .addresses(record.addrs.clone())
                    .build();

                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.pending_dials.insert(record.peer_id, reply);
                    }
                    // Already connected (or already dialing) counts as reachable.
                    Err(DialError::DialPeerConditionFalse(_)) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(error) => {
                        let _ = reply.send(Err(EndpointError::Unreachable(error.to_string())));
                    }
                }
            }
            Command::WarmUp { reply } => match self.swarm.behaviour_mut().kad.bootstrap() {
                Ok(id) => {
                    self.pending_queries.insert(id, PendingQuery::WarmUp(reply));
                }
                Err(_) => {
                    let _ = reply.send(Err(EndpointError::NoKnownPeers));
                }
            },
            Command::StartProviding { key, reply } => {
                match self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .start_providing(kad::RecordKey::new(&key))
                {
                    Ok(id) => {
                        self.pending_queries.insert(id, PendingQuery::Provide(reply));
                    }
                    Err(error) => {
                        let _ = reply.send(Err(EndpointError::Store(error.to_string())));
                    }
                }
            }
            Command::GetProviders { key, reply } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .get_providers(kad::RecordKey::new(&key));
                self.pending_queries.insert(
                    id,
                    PendingQuery::Providers {
                        found: HashSet::new(),
                        reply,
                    },
                );
            }
            Command::Shutdown { reply } => {
                // Intercepted by the run loop; never reaches here.
                let _ = reply.send(());
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                if endpoint.is_dialer() {
                    let addr = endpoint.get_remote_address().clone();
                    self.note_address(peer_id, addr);
                }
                if let Some(reply) = self.pending_dials.remove(&peer_id) {
                    let _ = reply.send(Ok(()));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                if let Some(reply) = self.pending_dials.remove(&peer_id) {
                    let _ = reply.send(Err(EndpointError::Unreachable(error.to_string())));
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                // Identify is what teaches the routing table the listen
                // addresses of peers that dialed us.
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kad
                        .add_address(&peer_id, addr.clone());
                    self.note_address(peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(_)) => {}
            SwarmEvent::Behaviour(NodeBehaviourEvent::Kad(event)) => self.handle_kad_event(event),
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        let kad::Event::OutboundQueryProgressed {
            id, result, step, ..
        } = event
        else {
            return;
        };

        match result {
            kad::QueryResult::StartProviding(result) => {
                if let Some(PendingQuery::Provide(reply)) = self.pending_queries.remove(&id) {
                    let _ = reply.send(result.map(|_| ()).map_err(|_| EndpointError::QueryTimeout));
                }
            }
            kad::QueryResult::Bootstrap(result) => match result {
                Ok(_) if step.last => {
                    if let Some(PendingQuery::WarmUp(reply)) = self.pending_queries.remove(&id) {
                        let _ = reply.send(Ok(()));
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    log::debug!("routing table warm-up failed: {}", error);
                    if let Some(PendingQuery::WarmUp(reply)) = self.pending_queries.remove(&id) {
                        let _ = reply.send(Err(EndpointError::QueryTimeout));
                    }
                }
            },
            kad::QueryResult::GetProviders(result) => match result {
                Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                    if let Some(PendingQuery::Providers { found, .. }) =
                        self.pending_queries.get_mut(&id)
                    {
                        found.extend(providers);
                    }
                    if step.last {
                        self.finish_providers(id);
                    }
                }
                Ok(_) => {
                    self.finish_providers(id);
                }
                // A timed-out query still reports what it found; an empty set
                // is a valid outcome and the caller decides what it means.
                Err(_) => {
                    self.finish_providers(id);
                }
            },
            _ => {}
        }
    }

    fn finish_providers(&mut self, id: kad::QueryId) {
        if let Some(PendingQuery::Providers { found, reply }) = self.pending_queries.remove(&id) {
            let mut records: Vec<AddrRecord> = found
                .into_iter()
                .map(|peer_id| AddrRecord {
                    peer_id,
                    addrs: if peer_id == self.local.peer_id {
                        self.local.addrs.clone()
                    } else {
                        self.known_addrs.get(&peer_id).cloned().unwrap_or_default()
                    },
                })
                .collect();
            records.sort_by_key(|record| record.peer_id.to_base58());

            let _ = reply.send(Ok(records));
        }
    }

    fn note_address(&mut self, peer_id: PeerId, addr: Multiaddr) {
        let addrs = self.known_addrs.entry(peer_id).or_default();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    #[tokio::test]
    async fn endpoint_reports_listen_address_and_shuts_down() {
        let (handle, record) = start(Keypair::generate_ed25519(), 0).await.unwrap();

        assert_eq!(record.addrs.len(), 1);
        assert!(record.addrs[0].to_string().contains("/tcp/"));

        handle.shutdown().await.unwrap();
    }
}
