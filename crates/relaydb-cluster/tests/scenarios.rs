//! Steady-state end-to-end scenarios: replicated writes, read
//! load-balancing, abort on constraint violation, and frame corruption.

mod common;

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use common::{await_coordinator, rows, seed, spawn_cluster, wait_for};
use relaydb_cluster::config::ReadStrategy;
use relaydb_cluster::frame::{read_frame, write_frame};
use relaydb_cluster::message::{ClientRequestPayload, PreparePayload, CLIENT_SENDER};
use relaydb_cluster::{ClientReply, Envelope, ErrorCode, MessageKind};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_via_follower_is_visible_on_every_replica() {
    let cluster = spawn_cluster(3, ReadStrategy::RoundRobin, |_, _| {}).await;
    assert!(await_coordinator(&cluster, &[1, 2, 3], 3).await);

    // client hits node 1; the write is forwarded to coordinator 3
    let reply = cluster
        .node(1)
        .execute("INSERT INTO users (name, email) VALUES ('X', 'x@e')")
        .await;
    assert!(reply.ok, "write failed: {:?}", reply.error);
    assert_eq!(reply.affected_rows, Some(1));

    let cluster_ref = &cluster;
    let all_visible = wait_for(
        move || async move {
            (1..=3).all(|id| {
                rows(
                    cluster_ref.backend(id),
                    "SELECT email FROM users WHERE name='X'",
                ) == vec![vec!["x@e".to_string()]]
            })
        },
        Duration::from_secs(3),
    )
    .await;
    assert!(all_visible, "committed row missing on some replica");

    // every participant journaled COMMITTED for this txn
    for id in 1..=3 {
        let sql = format!(
            "SELECT status FROM transactions_log WHERE transaction_id='{}'",
            reply.txn_id
        );
        let statuses = rows(cluster.backend(id), &sql);
        assert_eq!(
            statuses.last(),
            Some(&vec!["COMMITTED".to_string()]),
            "node {id} journal: {statuses:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unique_conflict_aborts_on_every_node() {
    let cluster = spawn_cluster(3, ReadStrategy::RoundRobin, |_, backend| {
        backend.add_unique("users", "email");
        seed(
            backend,
            "INSERT INTO users (name, email) VALUES ('alice', 'alice@example.com')",
        );
    })
    .await;
    assert!(await_coordinator(&cluster, &[1, 2, 3], 3).await);

    let reply = cluster
        .node(1)
        .execute("INSERT INTO users (name, email) VALUES ('Y', 'alice@example.com')")
        .await;
    assert!(!reply.ok);
    assert_eq!(
        reply.error.as_ref().map(|e| e.code),
        Some(ErrorCode::Aborted)
    );

    // the row must not exist anywhere
    for id in 1..=3 {
        assert!(rows(cluster.backend(id), "SELECT name FROM users WHERE name='Y'").is_empty());
    }

    // every node journals ABORTED for the same txn id
    let txn_id = reply.txn_id.clone();
    let cluster_ref = &cluster;
    let journaled = wait_for(
        move || {
            let txn_id = txn_id.clone();
            async move {
                (1..=3).all(|id| {
                    let sql = format!(
                        "SELECT status FROM transactions_log WHERE transaction_id='{txn_id}'"
                    );
                    rows(cluster_ref.backend(id), &sql)
                        .last()
                        .map(|row| row == &vec!["ABORTED".to_string()])
                        .unwrap_or(false)
                })
            }
        },
        Duration::from_secs(3),
    )
    .await;
    assert!(journaled, "ABORTED journal row missing on some node");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_robin_spreads_reads_evenly() {
    let cluster = spawn_cluster(3, ReadStrategy::RoundRobin, |_, backend| {
        seed(backend, "INSERT INTO users (name) VALUES ('seed')");
    })
    .await;
    assert!(await_coordinator(&cluster, &[1, 2, 3], 3).await);

    // startup recovery scans contribute to the counters; diff from here
    let baseline: Vec<u64> = (1..=3).map(|id| cluster.backend(id).query_count()).collect();

    for _ in 0..9 {
        let reply = cluster.node(3).execute("SELECT name FROM users").await;
        assert!(reply.ok, "read failed: {:?}", reply.error);
        assert_eq!(reply.rows.as_ref().map(|r| r.len()), Some(1));
    }

    for id in 1..=3u32 {
        let served = cluster.backend(id).query_count() - baseline[(id - 1) as usize];
        assert_eq!(served, 3, "node {id} served {served} reads");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_statement_is_rejected_without_a_txn() {
    let cluster = spawn_cluster(2, ReadStrategy::RoundRobin, |_, _| {}).await;
    assert!(await_coordinator(&cluster, &[1, 2], 2).await);

    let reply = cluster.node(1).execute("GRANT ALL ON users TO bob").await;
    assert!(!reply.ok);
    assert_eq!(
        reply.error.as_ref().map(|e| e.code),
        Some(ErrorCode::BadStatement)
    );
    assert_eq!(cluster.node(2).in_flight_writes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupted_frame_is_dropped_silently() {
    let cluster = spawn_cluster(2, ReadStrategy::RoundRobin, |_, backend| {
        seed(backend, "INSERT INTO users (name) VALUES ('seed')");
    })
    .await;
    assert!(await_coordinator(&cluster, &[1, 2], 2).await);

    // hand-corrupt a PREPARE payload after the checksum was computed
    let envelope = Envelope::new(
        2,
        MessageKind::Prepare,
        &PreparePayload {
            txn_id: "TXN-1-corrupt".to_string(),
            statement: "INSERT INTO users (name) VALUES ('evil')".to_string(),
        },
    )
    .unwrap();
    let mut body = serde_json::to_vec(&envelope).unwrap();
    let idx = body
        .windows(6)
        .position(|w| w == b"'evil'")
        .expect("literal present");
    body[idx + 1] = b'E';

    let mut stream = TcpStream::connect(cluster.addr(1)).await.unwrap();
    stream
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&body).await.unwrap();

    // no VOTE, no error reply — the frame just disappears
    let silent = tokio::time::timeout(Duration::from_millis(500), read_frame(&mut stream)).await;
    assert!(silent.is_err(), "corrupted frame must not be acknowledged");

    // the node is still healthy and never prepared the transaction
    assert!(!cluster.node(1).participant().has_prepared("TXN-1-corrupt"));
    let mut clean = TcpStream::connect(cluster.addr(1)).await.unwrap();
    let request = Envelope::new(
        CLIENT_SENDER,
        MessageKind::ClientRequest,
        &ClientRequestPayload {
            txn_id: "TXN-1-clean".to_string(),
            statement: "SELECT name FROM users".to_string(),
        },
    )
    .unwrap();
    write_frame(&mut clean, &request).await.unwrap();
    let reply = read_frame(&mut clean).await.unwrap().expect("reply frame");
    assert!(reply.verify());
    let reply: ClientReply = reply.decode().unwrap();
    assert!(reply.ok);
}
