//! Verification driver: assigns test identifiers to providing hosts over the
//! control plane, then checks that lookups from every host return a
//! consistent provider set.
//!
//! The driver is a library: it reports failures as values and never aborts
//! the process itself, so it can be embedded and tested against a fake
//! control plane.

use crate::{
    content::ContentId,
    rpc::{self, AddrInfo, Client},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    error::Error as StdError,
    time::Duration,
};
use thiserror::Error;
use tokio::time;

/// The operations a verification driver needs from the fleet's control
/// plane. Implemented by the RPC client; tests substitute a fake.
#[async_trait]
pub trait ControlPlane {
    type Error: StdError + Send + Sync + 'static;

    async fn num_hosts(&self) -> Result<usize, Self::Error>;
    async fn provide(&self, host_index: usize, cids: &[ContentId]) -> Result<(), Self::Error>;
    async fn lookup(
        &self,
        host_index: usize,
        cid: &ContentId,
        prefix_length: u16,
    ) -> Result<Vec<AddrInfo>, Self::Error>;
    async fn id(&self, host_index: usize) -> Result<String, Self::Error>;
}

#[async_trait]
impl ControlPlane for rpc::Client {
    type Error = rpc::ClientError;

    async fn num_hosts(&self) -> Result<usize, Self::Error> {
        Client::num_hosts(self).await
    }

    async fn provide(&self, host_index: usize, cids: &[ContentId]) -> Result<(), Self::Error> {
        Client::provide(self, host_index, cids).await
    }

    async fn lookup(
        &self,
        host_index: usize,
        cid: &ContentId,
        prefix_length: u16,
    ) -> Result<Vec<AddrInfo>, Self::Error> {
        Client::lookup(self, host_index, cid, prefix_length).await
    }

    async fn id(&self, host_index: usize) -> Result<String, Self::Error> {
        Client::id(self, host_index).await
    }
}

/// Expected provider identifiers per content identifier, recorded during the
/// assignment phase and read-only afterwards.
pub type ProviderMap = HashMap<ContentId, HashSet<String>>;

#[derive(Debug, Error)]
pub enum VerificationFailure<E: StdError + 'static> {
    #[error("no providers found for cid {cid} at host {host}")]
    NoProviders { cid: ContentId, host: usize },
    #[error("host {host} found provider {provider} that was never assigned cid {cid}")]
    UnexpectedProvider {
        cid: ContentId,
        host: usize,
        provider: String,
    },
    #[error("lookup for cid {cid} at host {host} failed")]
    Transport {
        cid: ContentId,
        host: usize,
        #[source]
        source: E,
    },
    #[error("control-plane request failed")]
    ControlPlane(#[source] E),
}

#[derive(Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Every identifier verified on every host.
    Verified,
    /// The duration budget expired before verification finished.
    DeadlineExpired,
}

/// Assignment phase: make host `i % num_hosts` provide the identifier at
/// sequence position `i`, plus host `(i + num_hosts/2) % num_hosts` when
/// redundant assignment is on, and record the resulting peer identifiers.
pub async fn assign_providers<C: ControlPlane>(
    client: &C,
    cids: &[ContentId],
    num_hosts: usize,
    redundant: bool,
) -> Result<ProviderMap, VerificationFailure<C::Error>> {
    let mut provides = ProviderMap::new();

    if num_hosts == 0 {
        return Ok(provides);
    }

    for (i, cid) in cids.iter().enumerate() {
        assign_one(client, &mut provides, cid, i % num_hosts).await?;

        if redundant {
            assign_one(client, &mut provides, cid, (i + num_hosts / 2) % num_hosts).await?;
        }
    }

    Ok(provides)
}

async fn assign_one<C: ControlPlane>(
    client: &C,
    provides: &mut ProviderMap,
    cid: &ContentId,
    host: usize,
) -> Result<(), VerificationFailure<C::Error>> {
    client
        .provide(host, std::slice::from_ref(cid))
        .await
        .map_err(VerificationFailure::ControlPlane)?;

    let id = client
        .id(host)
        .await
        .map_err(VerificationFailure::ControlPlane)?;

    provides.entry(cid.clone()).or_default().insert(id);
    Ok(())
}

/// Verification phase: for every assigned identifier, look it up from every
/// host in ascending index order.
///
/// An empty result fails immediately, as does any provider identifier
/// outside the expected set. The expected-set check is a subset check, not
/// an exact-size check: replication may legitimately surface more copies of
/// the assigned providers over time.
pub async fn verify<C: ControlPlane>(
    client: &C,
    provides: &ProviderMap,
    num_hosts: usize,
    prefix_length: u16,
) -> Result<(), VerificationFailure<C::Error>> {
    for (key_index, (cid, expected)) in provides.iter().enumerate() {
        for host in 0..num_hosts {
            let found = client
                .lookup(host, cid, prefix_length)
                .await
                .map_err(|source| VerificationFailure::Transport {
                    cid: cid.clone(),
                    host,
                    source,
                })?;

            if found.is_empty() {
                return Err(VerificationFailure::NoProviders {
                    cid: cid.clone(),
                    host,
                });
            }

            for provider in &found {
                if !expected.contains(&provider.id) {
                    return Err(VerificationFailure::UnexpectedProvider {
                        cid: cid.clone(),
                        host,
                        provider: provider.id.clone(),
                    });
                }
            }
        }

        log::info!(
            "verified cid {} ({} of {})",
            cid,
            key_index + 1,
            provides.len()
        );
    }

    Ok(())
}

/// Run the whole driver: assignment, then verification raced against the
/// duration budget. Expiry is a timeout, not a cancellation; a verification
/// pass in flight at the deadline keeps running in the background.
pub async fn run<C>(
    client: &C,
    cids: &[ContentId],
    prefix_length: u16,
    redundant: bool,
    deadline: Duration,
) -> Result<Outcome, VerificationFailure<C::Error>>
where
    C: ControlPlane + Clone + Send + Sync + 'static,
{
    let num_hosts = client
        .num_hosts()
        .await
        .map_err(VerificationFailure::ControlPlane)?;

    let provides = assign_providers(client, cids, num_hosts, redundant).await?;

    let verification = tokio::spawn({
        let client = client.clone();
        let provides = provides.clone();
        async move { verify(&client, &provides, num_hosts, prefix_length).await }
    });

    tokio::select! {
        result = verification => match result {
            Ok(result) => result.map(|()| Outcome::Verified),
            // `verify` has no panicking paths of its own.
            Err(error) => unreachable!("verification task failed: {}", error),
        },
        _ = time::sleep(deadline) => Ok(Outcome::DeadlineExpired),
    }
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn host_id(index: usize) -> String {
        format!("peer-{}", index)
    }

    #[derive(Debug, Error)]
    #[error("transport down")]
    struct FakeError;

    /// In-memory control plane: `provide` records assignments, `lookup`
    /// returns whatever was recorded unless told to misbehave for one
    /// specific (cid, host) pairing.
    #[derive(Clone, Default)]
    struct FakePlane {
        num_hosts: usize,
        provided: Arc<Mutex<ProviderMap>>,
        empty_at: Option<(ContentId, usize)>,
        rogue_at: Option<(ContentId, usize)>,
        fail_at: Option<(ContentId, usize)>,
    }

    impl FakePlane {
        fn new(num_hosts: usize) -> Self {
            Self {
                num_hosts,
                ..Self::default()
            }
        }

        fn matches(slot: &Option<(ContentId, usize)>, cid: &ContentId, host: usize) -> bool {
            matches!(slot, Some((c, h)) if c == cid && *h == host)
        }
    }

    #[async_trait]
    impl ControlPlane for FakePlane {
        type Error = FakeError;

        async fn num_hosts(&self) -> Result<usize, FakeError> {
            Ok(self.num_hosts)
        }

        async fn provide(&self, host_index: usize, cids: &[ContentId]) -> Result<(), FakeError> {
            let mut provided = self.provided.lock();
            for cid in cids {
                provided
                    .entry(cid.clone())
                    .or_default()
                    .insert(host_id(host_index));
            }
            Ok(())
        }

        async fn lookup(
            &self,
            host_index: usize,
            cid: &ContentId,
            _prefix_length: u16,
        ) -> Result<Vec<AddrInfo>, FakeError> {
            if Self::matches(&self.fail_at, cid, host_index) {
                return Err(FakeError);
            }
            if Self::matches(&self.empty_at, cid, host_index) {
                return Ok(Vec::new());
            }

            let mut ids: Vec<String> = self
                .provided
                .lock()
                .get(cid)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .collect();
            ids.sort();

            if Self::matches(&self.rogue_at, cid, host_index) {
                ids.push("peer-rogue".to_string());
            }

            Ok(ids
                .into_iter()
                .map(|id| AddrInfo {
                    id,
                    addrs: Vec::new(),
                })
                .collect())
        }

        async fn id(&self, host_index: usize) -> Result<String, FakeError> {
            Ok(host_id(host_index))
        }
    }

    #[tokio::test]
    async fn round_robin_assignment_with_redundancy() {
        let plane = FakePlane::new(4);
        let cids = ContentId::test_set(2);

        let provides = assign_providers(&plane, &cids, 4, true).await.unwrap();

        assert_eq!(
            provides[&cids[0]],
            [host_id(0), host_id(2)].into_iter().collect()
        );
        assert_eq!(
            provides[&cids[1]],
            [host_id(1), host_id(3)].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn round_robin_assignment_without_redundancy() {
        let plane = FakePlane::new(4);
        let cids = ContentId::test_set(2);

        let provides = assign_providers(&plane, &cids, 4, false).await.unwrap();

        assert_eq!(provides[&cids[0]], [host_id(0)].into_iter().collect());
        assert_eq!(provides[&cids[1]], [host_id(1)].into_iter().collect());
    }

    #[tokio::test]
    async fn verify_accepts_expected_providers_on_every_host() {
        let plane = FakePlane::new(4);
        let cids = ContentId::test_set(2);

        let provides = assign_providers(&plane, &cids, 4, true).await.unwrap();
        verify(&plane, &provides, 4, 0).await.unwrap();
    }

    #[tokio::test]
    async fn empty_result_is_a_failure_with_the_failing_pair() {
        let cids = ContentId::test_set(1);
        let mut plane = FakePlane::new(4);
        plane.empty_at = Some((cids[0].clone(), 1));

        let provides = assign_providers(&plane, &cids, 4, true).await.unwrap();
        let failure = verify(&plane, &provides, 4, 0).await.unwrap_err();

        assert!(matches!(
            failure,
            VerificationFailure::NoProviders { ref cid, host: 1 } if *cid == cids[0]
        ));
    }

    #[tokio::test]
    async fn unassigned_provider_is_a_failure() {
        let cids = ContentId::test_set(1);
        let mut plane = FakePlane::new(4);
        plane.rogue_at = Some((cids[0].clone(), 2));

        let provides = assign_providers(&plane, &cids, 4, true).await.unwrap();
        let failure = verify(&plane, &provides, 4, 0).await.unwrap_err();

        assert!(matches!(
            failure,
            VerificationFailure::UnexpectedProvider { host: 2, ref provider, .. }
                if provider == "peer-rogue"
        ));
    }

    #[tokio::test]
    async fn transport_error_aborts_with_context() {
        let cids = ContentId::test_set(1);
        let mut plane = FakePlane::new(4);
        plane.fail_at = Some((cids[0].clone(), 3));

        let provides = assign_providers(&plane, &cids, 4, true).await.unwrap();
        let failure = verify(&plane, &provides, 4, 0).await.unwrap_err();

        assert!(matches!(
            failure,
            VerificationFailure::Transport { host: 3, .. }
        ));
    }

    #[tokio::test]
    async fn run_completes_within_the_deadline() {
        let plane = FakePlane::new(4);
        let cids = ContentId::test_set(4);

        let outcome = run(&plane, &cids, 0, true, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Verified);
    }
}
