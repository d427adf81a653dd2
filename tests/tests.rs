use dht_tester::{
    config::HarnessConfig,
    content::ContentId,
    fleet::{Fleet, FleetContext},
    node::{BootstrapError, NodeConfig, PeerNode},
    registry::{AddrRecord, BootstrapRegistry},
    rpc, tester,
};
use libp2p::PeerId;
use rand::Rng;
use std::{collections::HashSet, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::time;

/// How long a lookup is retried while records propagate through the overlay.
const SETTLE_ATTEMPTS: usize = 40;
const SETTLE_STEP: Duration = Duration::from_millis(250);

fn scratch_key_dir() -> PathBuf {
    std::env::temp_dir().join(format!(
        "dht-tester-it-{}",
        rand::thread_rng().gen::<u64>()
    ))
}

fn test_config(count: usize, num_test_cids: usize) -> HarnessConfig {
    HarnessConfig {
        count,
        num_test_cids,
        // Ephemeral ports so concurrent tests never collide.
        base_port: 0,
        key_dir: scratch_key_dir(),
        ..HarnessConfig::default()
    }
}

fn peer_id_of(fleet: &Fleet, index: usize) -> String {
    fleet
        .get(index)
        .unwrap()
        .addr_record()
        .peer_id
        .to_string()
}

/// Look up `cid` from `node` until the expected provider shows up or the
/// settle window closes.
async fn lookup_until_found(
    node: &PeerNode,
    cid: &ContentId,
    expected_provider: &str,
) -> Vec<AddrRecord> {
    let mut found = Vec::new();

    for _ in 0..SETTLE_ATTEMPTS {
        found = node.lookup(cid, 0).await.unwrap();
        if found
            .iter()
            .any(|record| record.peer_id.to_string() == expected_provider)
        {
            return found;
        }
        time::sleep(SETTLE_STEP).await;
    }

    found
}

#[tokio::test(flavor = "multi_thread")]
async fn provide_then_lookup_across_the_fleet() {
    let config = test_config(4, 2);
    let ctx = FleetContext::new(config.num_test_cids);
    let fleet = Fleet::build(&config, &ctx).await.unwrap();

    // Identifier 0 is assigned to hosts 0 and 2, the round-robin pair the
    // external driver would pick.
    let cid = ctx.test_cids[0].clone();
    fleet.get(0).unwrap().provide(std::slice::from_ref(&cid)).await;
    fleet.get(2).unwrap().provide(std::slice::from_ref(&cid)).await;

    let provider_0 = peer_id_of(&fleet, 0);
    let expected: HashSet<String> = [peer_id_of(&fleet, 0), peer_id_of(&fleet, 2)]
        .into_iter()
        .collect();

    for host in 0..fleet.len() {
        let node = fleet.get(host).unwrap();
        let found = lookup_until_found(node, &cid, &provider_0).await;

        assert!(
            found
                .iter()
                .any(|record| record.peer_id.to_string() == provider_0),
            "host {} never found provider 0",
            host
        );

        // Subset invariant: nothing outside the assigned pair ever shows up.
        for record in &found {
            assert!(
                expected.contains(&record.peer_id.to_string()),
                "host {} found unassigned provider {}",
                host,
                record.peer_id
            );
        }
    }

    fleet.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn first_node_bootstraps_against_an_empty_registry() {
    let config = test_config(1, 0);
    let ctx = FleetContext::new(0);
    let fleet = Fleet::build(&config, &ctx).await.unwrap();

    assert!(fleet.get(0).unwrap().is_bootstrapped());

    fleet.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_fails_when_every_peer_is_unreachable() {
    let ctx = FleetContext {
        registry: BootstrapRegistry::new(),
        test_cids: Arc::new(Vec::new()),
    };

    // A registry whose only entry nothing listens behind.
    ctx.registry.append(AddrRecord {
        peer_id: PeerId::random(),
        addrs: vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()],
    });

    let node = PeerNode::create(
        NodeConfig {
            index: 0,
            port: 0,
            auto_test: false,
            prefix_length: 0,
            key_dir: scratch_key_dir(),
        },
        &ctx,
    )
    .await
    .unwrap();

    assert!(matches!(
        node.start().await,
        Err(BootstrapError::AllPeersFailed)
    ));
    assert!(!node.is_bootstrapped());

    node.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_succeeds_when_at_least_one_peer_is_reachable() {
    let config = test_config(1, 0);
    let ctx = FleetContext::new(0);
    let fleet = Fleet::build(&config, &ctx).await.unwrap();

    // One live entry, one dead one.
    ctx.registry.append(AddrRecord {
        peer_id: PeerId::random(),
        addrs: vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()],
    });

    let node = PeerNode::create(
        NodeConfig {
            index: 1,
            port: 0,
            auto_test: false,
            prefix_length: 0,
            key_dir: scratch_key_dir(),
        },
        &ctx,
    )
    .await
    .unwrap();

    node.start().await.unwrap();
    assert!(node.is_bootstrapped());

    node.stop().await.unwrap();
    fleet.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rpc_surface_validates_before_dispatching() {
    let config = test_config(2, 1);
    let ctx = FleetContext::new(config.num_test_cids);
    let fleet = Fleet::build(&config, &ctx).await.unwrap();

    let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = rpc::Server::start(fleet.clone(), listen).await.unwrap();
    let client = rpc::Client::new(server.http_url());

    assert_eq!(client.num_hosts().await.unwrap(), 2);
    assert_eq!(client.id(0).await.unwrap(), peer_id_of(&fleet, 0));
    assert_eq!(client.id(1).await.unwrap(), peer_id_of(&fleet, 1));

    // Out-of-range index never reaches node logic.
    match client.id(5).await {
        Err(rpc::ClientError::Server(error)) => {
            assert_eq!(error.code, rpc::SERVER_ERROR);
            assert!(error.message.contains("out of range"));
        }
        other => panic!("expected an out-of-range error, got {:?}", other.map(|_| ())),
    }

    let http = reqwest::Client::new();

    // Negative index, which the typed client cannot even express.
    let response: serde_json::Value = http
        .post(server.http_url())
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": "dht_id",
            "params": { "hostIndex": -1 },
            "id": 1,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], rpc::SERVER_ERROR);

    // Prefix length beyond 256 is rejected as invalid params.
    let response: serde_json::Value = http
        .post(server.http_url())
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": "dht_lookup",
            "params": {
                "hostIndex": 0,
                "cid": ctx.test_cids[0].to_string(),
                "prefixLength": 300,
            },
            "id": 2,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], rpc::INVALID_PARAMS);

    // Unknown methods get a structured error, not a crash.
    let response: serde_json::Value = http
        .post(server.http_url())
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": "dht_unknown",
            "params": {},
            "id": 3,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], rpc::METHOD_NOT_FOUND);

    server.stop().await;
    fleet.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn end_to_end_verification_over_the_control_plane() {
    let config = test_config(4, 2);
    let ctx = FleetContext::new(config.num_test_cids);
    let fleet = Fleet::build(&config, &ctx).await.unwrap();

    let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = rpc::Server::start(fleet.clone(), listen).await.unwrap();
    let client = rpc::Client::new(server.http_url());

    let cids = ContentId::test_set(config.num_test_cids);
    let num_hosts = client.num_hosts().await.unwrap();
    assert_eq!(num_hosts, 4);

    let provides = tester::assign_providers(&client, &cids, num_hosts, true)
        .await
        .unwrap();

    // Identifier 0 must have been assigned to hosts 0 and 2.
    assert_eq!(
        provides[&cids[0]],
        [peer_id_of(&fleet, 0), peer_id_of(&fleet, 2)]
            .into_iter()
            .collect()
    );

    // Let the records propagate before the single verification pass.
    time::sleep(Duration::from_secs(2)).await;

    tester::verify(&client, &provides, num_hosts, 0)
        .await
        .unwrap();

    server.stop().await;
    fleet.shutdown().await.unwrap();
}
