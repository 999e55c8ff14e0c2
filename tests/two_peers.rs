//! End-to-end replication between two in-process peers.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use threads_net::blockstore::MemBlockstore;
use threads_net::bus::ThreadRecord;
use threads_net::host::MemNetwork;
use threads_net::net::{Config, Net, NewThreadOptions, ThreadOptions};
use threads_net::store::memory::MemLogstore;
use threads_net::thread::ThreadId;

fn setup_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> Config {
    Config {
        pull_start_after: Duration::from_millis(50),
        initial_pull_interval: Duration::from_millis(50),
        pull_interval: Duration::from_millis(200),
        exchange_compression_timeout: Duration::from_millis(50),
        queue_poll_interval: Duration::from_millis(25),
        notify_timeout: Duration::from_millis(500),
        ..Config::default()
    }
}

fn spawn_net(network: &MemNetwork) -> Net {
    Net::new(
        network.host(),
        Arc::new(MemBlockstore::new()),
        Arc::new(MemLogstore::new()),
        None,
        fast_config(),
    )
}

fn collect(rx: flume::Receiver<ThreadRecord>, n: usize) -> tokio::task::JoinHandle<Vec<ThreadRecord>> {
    tokio::spawn(async move {
        let mut out = Vec::new();
        while out.len() < n {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv_async()).await {
                Ok(Ok(rec)) => out.push(rec),
                _ => break,
            }
        }
        out
    })
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Scenario: peer A authors records, peer B joins via the thread address
/// and converges through log discovery plus the edge-exchange scheduler.
#[tokio::test(flavor = "multi_thread")]
async fn two_peer_catch_up() {
    setup_logging();
    let network = MemNetwork::new();
    let a = spawn_net(&network);
    let b = spawn_net(&network);

    let info = a
        .create_thread(ThreadId::new_random(), NewThreadOptions::default())
        .unwrap();
    let r1 = a
        .create_record(info.id, Bytes::from_static(b"r1"), ThreadOptions::default())
        .await
        .unwrap();
    let r2 = a
        .create_record(info.id, Bytes::from_static(b"r2"), ThreadOptions::default())
        .await
        .unwrap();

    let addr = info.addrs.first().expect("thread addr").clone();
    let sub = collect(b.subscribe([info.id]), 2);
    b.add_thread(
        &addr,
        NewThreadOptions {
            thread_key: Some(info.key.clone()),
            ..Default::default()
        },
    )
    .unwrap();

    // B discovers A's log and pulls both records
    let emitted = sub.await.unwrap();
    assert_eq!(
        emitted.iter().map(|r| r.record.cid()).collect::<Vec<_>>(),
        vec![r1.record.cid(), r2.record.cid()],
        "records replay in chain order"
    );
    wait_for("B's head to reach r2", || {
        b.store()
            .heads(&info.id, &r2.log_id)
            .ok()
            .flatten()
            .map(|h| h == r2.record.cid())
            .unwrap_or(false)
    })
    .await;

    a.close().await;
    b.close().await;
}

/// Scenario: after B becomes a replicator, fresh records arrive by push
/// without waiting for a pull cycle.
#[tokio::test(flavor = "multi_thread")]
async fn replicator_receives_pushes() {
    setup_logging();
    let network = MemNetwork::new();
    let a = spawn_net(&network);
    let b = spawn_net(&network);

    let info = a
        .create_thread(ThreadId::new_random(), NewThreadOptions::default())
        .unwrap();
    let addr = info.addrs.first().expect("thread addr").clone();
    b.add_thread(
        &addr,
        NewThreadOptions {
            thread_key: Some(info.key.clone()),
            ..Default::default()
        },
    )
    .unwrap();
    wait_for("B to discover A's log", || {
        b.store()
            .get_thread(&info.id)
            .map(|i| i.logs.iter().any(|l| !l.managed()))
            .unwrap_or(false)
    })
    .await;

    let b_addr = format!("/p2p/{}", b.host_id()).parse().unwrap();
    a.add_replicator(info.id, &b_addr, ThreadOptions::default())
        .await
        .unwrap();

    let sub = collect(b.subscribe([info.id]), 1);
    let r1 = a
        .create_record(info.id, Bytes::from_static(b"pushed"), ThreadOptions::default())
        .await
        .unwrap();
    let emitted = sub.await.unwrap();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].record.cid(), r1.record.cid());
    assert_eq!(
        b.store().heads(&info.id, &r1.log_id).unwrap(),
        Some(r1.record.cid())
    );

    a.close().await;
    b.close().await;
}

/// Scenario: an explicit pull converges without the background scheduler.
#[tokio::test(flavor = "multi_thread")]
async fn explicit_pull_thread() {
    setup_logging();
    let network = MemNetwork::new();
    let a = spawn_net(&network);
    let b = spawn_net(&network);

    let info = a
        .create_thread(ThreadId::new_random(), NewThreadOptions::default())
        .unwrap();
    let mut last = None;
    for i in 0..5u8 {
        last = Some(
            a.create_record(info.id, Bytes::from(vec![i]), ThreadOptions::default())
                .await
                .unwrap(),
        );
    }
    let last = last.unwrap();

    let addr = info.addrs.first().expect("thread addr").clone();
    // subscribe first: the background scheduler may win the race with the
    // explicit pull, but each record is emitted exactly once either way
    let sub = collect(b.subscribe([info.id]), 5);
    b.add_thread(
        &addr,
        NewThreadOptions {
            thread_key: Some(info.key.clone()),
            ..Default::default()
        },
    )
    .unwrap();
    wait_for("B to discover A's log", || {
        b.store().get_log(&info.id, &last.log_id).is_ok()
    })
    .await;

    b.pull_thread(info.id, ThreadOptions::default())
        .await
        .unwrap();
    let emitted = sub.await.unwrap();
    assert_eq!(emitted.len(), 5);
    assert_eq!(emitted[4].record.cid(), last.record.cid());

    // pulling again is a no-op
    b.pull_thread(info.id, ThreadOptions::default())
        .await
        .unwrap();
    assert_eq!(
        b.store().heads(&info.id, &last.log_id).unwrap(),
        Some(last.record.cid())
    );

    a.close().await;
    b.close().await;
}
