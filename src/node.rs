//! A single peer of the fleet: one network endpoint plus its attached DHT
//! instance, with a start/stop lifecycle, a bootstrap procedure against the
//! shared registry and provide/lookup operations scoped to itself.

use crate::{
    content::ContentId,
    fleet::FleetContext,
    identity::{self, KeyLoadError},
    registry::{AddrRecord, BootstrapRegistry},
    swarm::{self, EndpointError},
};
use parking_lot::Mutex;
use rand::Rng;
use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::oneshot,
    time::{self, MissedTickBehavior},
};

/// Most peers a single bootstrap pass will attempt to connect to. Bounds
/// startup cost in large fleets.
const MAX_BOOTSTRAP_PEERS: usize = 10;

/// Delay between the connection attempts and the routing-table warm-up,
/// letting the transport-layer peer count stabilize first. Tunable.
const BOOTSTRAP_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Lower bound of the auto-test period; the jitter added on top avoids a
/// thundering herd across the fleet.
const AUTO_TEST_MIN_PERIOD: Duration = Duration::from_secs(3);
const AUTO_TEST_JITTER_SECS: u64 = 20;

pub struct NodeConfig {
    pub index: usize,
    pub port: u16,
    pub auto_test: bool,
    pub prefix_length: u16,
    pub key_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum NodeCreateError {
    #[error("failed to load node key")]
    Key(#[from] KeyLoadError),
    #[error("failed to start network endpoint")]
    Endpoint(#[source] EndpointError),
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to bootstrap to any bootstrap peer")]
    AllPeersFailed,
    #[error("routing table warm-up failed")]
    WarmUp(#[source] EndpointError),
}

#[derive(Debug, Error)]
#[error("lookup for cid {cid} failed")]
pub struct LookupError {
    pub cid: ContentId,
    #[source]
    pub cause: EndpointError,
}

#[derive(Debug, Error)]
#[error("failed to close endpoint")]
pub struct ShutdownError(#[source] pub EndpointError);

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum BootstrapState {
    Idle,
    Connecting,
    Bootstrapped,
    Failed,
}

pub struct PeerNode {
    index: usize,
    auto_test: bool,
    prefix_length: u16,
    endpoint: swarm::Handle,
    record: AddrRecord,
    registry: BootstrapRegistry,
    test_cids: Arc<Vec<ContentId>>,
    state: Mutex<BootstrapState>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl PeerNode {
    /// Construct the endpoint and its DHT instance, bound to the configured
    /// port. The node is not part of the overlay until [`start`](Self::start).
    pub async fn create(config: NodeConfig, ctx: &FleetContext) -> Result<Self, NodeCreateError> {
        let keypair = identity::load_or_generate(&config.key_dir, config.index)?;
        let (endpoint, record) = swarm::start(keypair, config.port)
            .await
            .map_err(NodeCreateError::Endpoint)?;

        Ok(Self {
            index: config.index,
            auto_test: config.auto_test,
            prefix_length: config.prefix_length,
            endpoint,
            record,
            registry: ctx.registry.clone(),
            test_cids: ctx.test_cids.clone(),
            state: Mutex::new(BootstrapState::Idle),
            cancel: Mutex::new(None),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The node's address record, as seeded into the bootstrap registry.
    pub fn addr_record(&self) -> &AddrRecord {
        &self.record
    }

    pub fn is_bootstrapped(&self) -> bool {
        *self.state.lock() == BootstrapState::Bootstrapped
    }

    /// Run the bootstrap procedure, then launch the periodic background task.
    pub async fn start(&self) -> Result<(), BootstrapError> {
        self.bootstrap().await?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        *self.cancel.lock() = Some(cancel_tx);

        let period = auto_test_period(&mut rand::thread_rng());
        tokio::spawn(auto_test_loop(
            self.index,
            self.auto_test,
            self.prefix_length,
            self.endpoint.clone(),
            self.test_cids.clone(),
            period,
            cancel_rx,
        ));

        Ok(())
    }

    /// Connect to the registry's current entries (except our own), then warm
    /// up the routing table.
    ///
    /// The first node of a fleet sees an empty registry and bootstraps
    /// trivially; that is intentional, it has no one to connect to.
    async fn bootstrap(&self) -> Result<(), BootstrapError> {
        self.set_state(BootstrapState::Connecting);

        let records = self.registry.snapshot();

        let mut attempted = 0;
        let mut failed = 0;

        for record in records
            .iter()
            .filter(|record| record.peer_id != self.record.peer_id)
        {
            if attempted >= MAX_BOOTSTRAP_PEERS {
                break;
            }
            attempted += 1;

            log::debug!("node {}: bootstrapping to peer {}", self.index, record.peer_id);

            if let Err(error) = self.endpoint.dial(record.clone()).await {
                log::debug!(
                    "node {}: failed to bootstrap to {}: {}",
                    self.index,
                    record.peer_id,
                    error
                );
                failed += 1;
            }
        }

        if attempted > 0 && failed == attempted {
            self.set_state(BootstrapState::Failed);
            return Err(BootstrapError::AllPeersFailed);
        }

        // Let the connection count settle before populating the routing table.
        time::sleep(BOOTSTRAP_SETTLE_DELAY).await;

        if attempted > failed {
            if let Err(error) = self.endpoint.warm_up().await {
                self.set_state(BootstrapState::Failed);
                return Err(BootstrapError::WarmUp(error));
            }
        }

        self.set_state(BootstrapState::Bootstrapped);
        log::info!(
            "node {}: bootstrapped, {} of {} peers reachable",
            self.index,
            attempted - failed,
            attempted
        );

        Ok(())
    }

    /// Announce this node as a provider for each identifier. Per-identifier
    /// failures are logged and do not abort the batch.
    pub async fn provide(&self, cids: &[ContentId]) {
        for cid in cids {
            match self.endpoint.start_providing(cid.record_key(0)).await {
                Ok(()) => log::info!("node {} provided cid {}", self.index, cid),
                Err(error) => {
                    log::warn!("node {} failed to provide cid {}: {}", self.index, cid, error)
                }
            }
        }
    }

    /// Query the overlay for providers of the identifier. A prefix length of
    /// zero looks up the full double-hash; a non-zero value looks up only
    /// that bit-prefix of it. An empty result is a valid, non-error outcome.
    pub async fn lookup(
        &self,
        cid: &ContentId,
        prefix_length: u16,
    ) -> Result<Vec<AddrRecord>, LookupError> {
        let providers = self
            .endpoint
            .providers(cid.record_key(prefix_length))
            .await
            .map_err(|cause| LookupError {
                cid: cid.clone(),
                cause,
            })?;

        log::info!(
            "node {} found {} providers for cid {}",
            self.index,
            providers.len(),
            cid
        );

        Ok(providers)
    }

    /// Cancel the background task, then close the endpoint. Cancellation
    /// always happens, even when the endpoint close fails.
    pub async fn stop(&self) -> Result<(), ShutdownError> {
        if let Some(cancel) = self.cancel.lock().take() {
            let _ = cancel.send(());
        }

        self.endpoint.shutdown().await.map_err(ShutdownError)
    }

    fn set_state(&self, new_state: BootstrapState) {
        let mut state = self.state.lock();
        if *state != new_state {
            log::debug!(
                "node {}: bootstrap state {:?} -> {:?}",
                self.index,
                *state,
                new_state
            );
            *state = new_state;
        }
    }
}

/// Period of the periodic background task: the lower bound plus a random
/// jitter, so the fleet's nodes do not tick in lockstep.
fn auto_test_period<R: Rng>(rng: &mut R) -> Duration {
    AUTO_TEST_MIN_PERIOD + Duration::from_secs(rng.gen_range(0..AUTO_TEST_JITTER_SECS))
}

/// The periodic task: each tick, when auto-test is enabled, provide a
/// pseudo-random test identifier and immediately look it up. Individual
/// failures are logged and skipped; only cancellation ends the task.
async fn auto_test_loop(
    index: usize,
    auto_test: bool,
    prefix_length: u16,
    endpoint: swarm::Handle,
    test_cids: Arc<Vec<ContentId>>,
    period: Duration,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut cancel => return,
            _ = ticker.tick() => {
                if !auto_test || test_cids.is_empty() {
                    continue;
                }

                let cid = {
                    let pick = rand::thread_rng().gen_range(0..test_cids.len());
                    test_cids[pick].clone()
                };

                match endpoint.start_providing(cid.record_key(0)).await {
                    Ok(()) => log::info!("node {} provided cid {}", index, cid),
                    Err(error) => {
                        log::warn!("node {} failed to provide cid {}: {}", index, cid, error);
                        continue;
                    }
                }

                let cid = {
                    let pick = rand::thread_rng().gen_range(0..test_cids.len());
                    test_cids[pick].clone()
                };

                match endpoint.providers(cid.record_key(prefix_length)).await {
                    Ok(providers) => log::info!(
                        "node {} found {} providers for cid {}",
                        index,
                        providers.len(),
                        cid
                    ),
                    Err(error) => {
                        log::warn!("node {} failed to look up cid {}: {}", index, cid, error)
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------//
