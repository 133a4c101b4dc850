//! Two daemons replicating over TCP on loopback

use areakv_core::{AreaId, KeyVals, NodeId, PeerState, Value, TTL_INFINITY};
use areakvd::config::{AreaConfig, KvStoreConfig, PeerConfig};
use areakvd::Server;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

fn config(node: &str, listen: SocketAddr, peer: &str, peer_addr: SocketAddr) -> KvStoreConfig {
    let mut config = KvStoreConfig::new(node, vec![AreaConfig::new("spine")]);
    config.listen = listen;
    config.peers = vec![PeerConfig {
        area: AreaId::from("spine"),
        node_id: NodeId::from(peer),
        endpoint: peer_addr.to_string(),
    }];
    config.sync_timeout_ms = 500;
    config.anti_entropy_interval_ms = 1_000;
    config.flood_flush_interval_ms = 20;
    config.ttl_sweep_interval_ms = 50;
    config
}

async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_two_daemons_replicate() {
    let l1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let l2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let a1 = l1.local_addr().unwrap();
    let a2 = l2.local_addr().unwrap();

    let s1 = Arc::new(Server::new(config("n1", a1, "n2", a2)).unwrap());
    let s2 = Arc::new(Server::new(config("n2", a2, "n1", a1)).unwrap());

    let run1 = s1.clone();
    let h1 = tokio::spawn(async move { run1.serve(l1).await });
    let run2 = s2.clone();
    let h2 = tokio::spawn(async move { run2.serve(l2).await });

    let area = AreaId::from("spine");
    let established = wait_for(|| {
        [&s1, &s2].iter().all(|s| {
            s.kv_store()
                .get_peers(&area)
                .unwrap()
                .values()
                .all(|p| p.state == PeerState::Established)
        })
    })
    .await;
    assert!(established);

    s1.kv_store()
        .set_keys(
            &area,
            KeyVals::from([(
                "prefix:n1".to_string(),
                Value::new(1, "n1", b"10.0.0.0/24".to_vec(), TTL_INFINITY),
            )]),
        )
        .unwrap();

    let replicated = wait_for(|| {
        s2.kv_store()
            .get_keys(&area, &["prefix:n1".to_string()])
            .unwrap()
            .get("prefix:n1")
            .and_then(|v| v.value().map(<[u8]>::to_vec))
            == Some(b"10.0.0.0/24".to_vec())
    })
    .await;
    assert!(replicated);
    assert!(*s2.kv_store().synced(&area).unwrap().borrow());

    s1.shutdown();
    s2.shutdown();
    assert!(h1.await.unwrap().is_ok());
    assert!(h2.await.unwrap().is_ok());
}
