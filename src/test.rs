//! End-to-end tests: several full nodes over loopback TCP running whole
//! ceremonies with the dealer party.

use std::sync::Arc;
use std::time::Duration;

use ecdsa::signature::Verifier;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};

use crate::blame;
use crate::config::TssConfig;
use crate::dealer::Dealer;
use crate::identity::NodeKeys;
use crate::keygen::{KeygenRequest, KeygenResponse};
use crate::keysign::KeysignRequest;
use crate::notifier::signature_bytes;
use crate::participants;
use crate::server::{Status, TssServer};

struct TestNode {
    server: Arc<TssServer<Dealer>>,
    pub_key: String,
    _dir: tempfile::TempDir,
}

fn test_config(ceremony_timeout: Duration) -> TssConfig {
    TssConfig {
        key_gen_timeout: ceremony_timeout,
        key_sign_timeout: ceremony_timeout,
        pre_param_timeout: ceremony_timeout,
        // Loopback streams don't need the 40 s wire deadline.
        apply_deadline: false,
        ..TssConfig::default()
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

async fn spawn_node(keys: NodeKeys, dealer: Dealer, conf: TssConfig) -> TestNode {
    init_logging();
    let pub_key = keys.account_pub_key();
    let dir = tempfile::tempdir().unwrap();
    let server = TssServer::new(
        conf,
        keys,
        "127.0.0.1:0".parse().unwrap(),
        dir.path(),
        dealer,
        None,
    )
    .await
    .unwrap();
    TestNode {
        server,
        pub_key,
        _dir: dir,
    }
}

/// Spin up one node per dealer and wire every address book.
async fn spawn_nodes(dealers: Vec<Dealer>, conf: TssConfig) -> Vec<TestNode> {
    let mut nodes = Vec::new();
    for dealer in dealers {
        let keys = NodeKeys::new(SigningKey::random(&mut OsRng));
        nodes.push(spawn_node(keys, dealer, conf.clone()).await);
    }
    for a in &nodes {
        for b in &nodes {
            a.server
                .add_peer(b.server.local_peer_id().clone(), b.server.local_addr());
        }
    }
    nodes
}

fn all_pub_keys(nodes: &[TestNode]) -> Vec<String> {
    nodes.iter().map(|n| n.pub_key.clone()).collect()
}

async fn run_keygen(nodes: &[TestNode], req: &KeygenRequest) -> Vec<KeygenResponse> {
    let handles: Vec<_> = nodes
        .iter()
        .map(|node| {
            let server = Arc::clone(&node.server);
            let req = req.clone();
            tokio::spawn(async move { server.keygen(req).await.unwrap() })
        })
        .collect();
    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap());
    }
    responses
}

fn keygen_request(nodes: &[TestNode]) -> KeygenRequest {
    KeygenRequest {
        keys: all_pub_keys(nodes),
        protos: vec![crate::config::DEFAULT_TSS_PROTOCOL.to_string()],
        pre_params: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_happy_keygen() {
    let nodes = spawn_nodes(vec![Dealer::honest(); 4], test_config(Duration::from_secs(20))).await;
    let responses = run_keygen(&nodes, &keygen_request(&nodes)).await;

    let pool_pub_key = responses[0].pub_key.clone();
    assert!(!pool_pub_key.is_empty());
    for resp in &responses {
        assert_eq!(resp.status, Status::Success);
        assert_eq!(resp.pub_key, pool_pub_key);
        assert!(!resp.address.is_empty());
        assert!(resp.blame.is_empty());
    }
    // Every node persisted its share, indexed by the pool key.
    for node in &nodes {
        let state = node.server.storage().load(&pool_pub_key).unwrap();
        assert_eq!(state.pub_key, pool_pub_key);
        assert!(!state.local_data.is_empty());
        assert_eq!(state.participant_keys.len(), 4);
    }
    for node in &nodes {
        assert_eq!(node.server.status().suc_key_gen, 1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_share_keygen_blames_the_culprit() {
    let dealers = vec![
        Dealer::honest(),
        Dealer::corrupt(),
        Dealer::honest(),
        Dealer::honest(),
    ];
    let nodes = spawn_nodes(dealers, test_config(Duration::from_secs(20))).await;
    let culprit = nodes[1].pub_key.clone();
    let responses = run_keygen(&nodes, &keygen_request(&nodes)).await;

    for (i, resp) in responses.iter().enumerate() {
        if i == 1 {
            continue;
        }
        assert_eq!(resp.status, Status::Fail, "node {i} should have aborted");
        assert_eq!(resp.blame.fail_reason, blame::WRONG_SHARE);
        assert_eq!(resp.blame.pubkeys(), vec![culprit.clone()]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_party_timeout_blames_absent_peers() {
    // Four requested participants, but only the two lowest-sorting nodes
    // are started; one of them is the leader.
    let mut keys: Vec<NodeKeys> = (0..4)
        .map(|_| NodeKeys::new(SigningKey::random(&mut OsRng)))
        .collect();
    keys.sort_by_key(|k| k.account_pub_key());
    let all_keys: Vec<String> = keys.iter().map(|k| k.account_pub_key()).collect();
    let absent_keys = all_keys[2..].to_vec();

    let conf = test_config(Duration::from_secs(2));
    let mut nodes = Vec::new();
    for node_keys in keys.drain(..2) {
        nodes.push(spawn_node(node_keys, Dealer::honest(), conf.clone()).await);
    }
    for a in &nodes {
        for b in &nodes {
            a.server
                .add_peer(b.server.local_peer_id().clone(), b.server.local_addr());
        }
    }

    let req = KeygenRequest {
        keys: all_keys,
        protos: vec![crate::config::DEFAULT_TSS_PROTOCOL.to_string()],
        pre_params: None,
    };
    let responses = run_keygen(&nodes, &req).await;
    for resp in responses {
        assert_eq!(resp.status, Status::Fail);
        assert_eq!(resp.blame.fail_reason, blame::TSS_SYNC_FAIL);
        let mut blamed = resp.blame.pubkeys();
        blamed.sort();
        let mut want = absent_keys.clone();
        want.sort();
        assert_eq!(blamed, want, "only the absent peers are blamed");
    }
}

/// The signer keys the deterministic selection will pick for a request.
fn expected_signers(signer_pub_keys: &[String]) -> Vec<String> {
    let mut sorted = signer_pub_keys.to_vec();
    sorted.sort();
    let threshold = participants::threshold(signer_pub_keys.len()).unwrap();
    sorted[..threshold + 1].to_vec()
}

fn keysign_request(pool_pub_key: &str, nodes: &[TestNode]) -> KeysignRequest {
    let digest = Sha256::digest(b"helloworld").to_vec();
    KeysignRequest {
        pool_pub_key: pool_pub_key.to_string(),
        messages: vec![base64::encode(&digest)],
        signer_pub_keys: all_pub_keys(nodes),
        excluded_peers: vec![],
    }
}

async fn run_keysign(
    nodes: &[TestNode],
    reqs: Vec<KeysignRequest>,
) -> Vec<crate::keysign::KeysignResponse> {
    let handles: Vec<_> = nodes
        .iter()
        .zip(reqs)
        .map(|(node, req)| {
            let server = Arc::clone(&node.server);
            tokio::spawn(async move { server.keysign(req).await.unwrap() })
        })
        .collect();
    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap());
    }
    responses
}

#[tokio::test(flavor = "multi_thread")]
async fn test_keysign_happy_path() {
    let nodes = spawn_nodes(vec![Dealer::honest(); 4], test_config(Duration::from_secs(20))).await;
    let keygen_responses = run_keygen(&nodes, &keygen_request(&nodes)).await;
    let pool_pub_key = keygen_responses[0].pub_key.clone();

    let req = keysign_request(&pool_pub_key, &nodes);
    let digest = Sha256::digest(b"helloworld").to_vec();
    let signers = expected_signers(&req.signer_pub_keys);
    let responses = run_keysign(&nodes, vec![req; 4]).await;

    let mut produced = None;
    for (node, resp) in nodes.iter().zip(&responses) {
        assert_eq!(resp.status, Status::Success);
        assert!(resp.blame.is_empty());
        if signers.contains(&node.pub_key) {
            assert_eq!(resp.signatures.len(), 1);
            assert_eq!(resp.signatures[0].m, digest);
            match &produced {
                None => produced = Some(resp.signatures.clone()),
                // R and S must be identical on every signer.
                Some(prev) => assert_eq!(prev, &resp.signatures),
            }
        } else {
            assert!(resp.signatures.is_empty());
        }
    }

    // The released signature verifies against the pool public key.
    let produced = produced.expect("at least one signer responded");
    let pool_raw = crate::identity::bech32_to_pub_key(&pool_pub_key).unwrap();
    let verifying = VerifyingKey::from_sec1_bytes(&pool_raw).unwrap();
    let raw = signature_bytes(&produced[0]).unwrap();
    let sig = Signature::from_slice(&raw).unwrap();
    verifying.verify(&digest, &sig).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_keysign_with_excluded_peers() {
    let nodes = spawn_nodes(vec![Dealer::honest(); 4], test_config(Duration::from_secs(20))).await;
    let keygen_responses = run_keygen(&nodes, &keygen_request(&nodes)).await;
    let pool_pub_key = keygen_responses[0].pub_key.clone();

    let base = keysign_request(&pool_pub_key, &nodes);
    let signers = expected_signers(&base.signer_pub_keys);
    // One node excludes the peers that would not be selected anyway, so
    // everyone still agrees on the signer set.
    let excluded: Vec<_> = nodes
        .iter()
        .filter(|n| !signers.contains(&n.pub_key))
        .map(|n| n.server.local_peer_id().clone())
        .collect();
    assert!(!excluded.is_empty());
    // The excluding node must itself be a selected signer, or the
    // exclusion would never come into play.
    let excluder = nodes
        .iter()
        .position(|n| signers.contains(&n.pub_key))
        .unwrap();

    let mut reqs = vec![base.clone(); 4];
    reqs[excluder].excluded_peers = excluded;
    let responses = run_keysign(&nodes, reqs).await;

    let mut produced: Option<Vec<crate::messages::SignatureData>> = None;
    for (node, resp) in nodes.iter().zip(&responses) {
        assert_eq!(resp.status, Status::Success);
        assert!(resp.blame.is_empty());
        if signers.contains(&node.pub_key) {
            match &produced {
                None => produced = Some(resp.signatures.clone()),
                Some(prev) => assert_eq!(prev, &resp.signatures),
            }
        }
    }
    assert!(produced.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_keysign_fails_without_network_activity() {
    let node = spawn_node(
        NodeKeys::new(SigningKey::random(&mut OsRng)),
        Dealer::honest(),
        test_config(Duration::from_secs(20)),
    )
    .await;

    let started = tokio::time::Instant::now();
    let resp = node
        .server
        .keysign(KeysignRequest {
            pool_pub_key: "tsspub1whatever".to_string(),
            messages: vec![base64::encode(Sha256::digest(b"m"))],
            signer_pub_keys: vec![],
            excluded_peers: vec![],
        })
        .await
        .unwrap();
    assert_eq!(resp.status, Status::Fail);
    assert!(resp.signatures.is_empty());
    // Rejected before any join-party round trip could have happened.
    assert!(started.elapsed() < Duration::from_millis(500));

    let resp = node
        .server
        .keysign(KeysignRequest {
            pool_pub_key: "tsspub1whatever".to_string(),
            messages: vec![],
            signer_pub_keys: vec![node.pub_key.clone()],
            excluded_peers: vec![],
        })
        .await
        .unwrap();
    assert_eq!(resp.status, Status::Fail);
    // Invalid requests are not counted as ceremony failures.
    assert_eq!(node.server.status().failed_key_sign, 0);
}
