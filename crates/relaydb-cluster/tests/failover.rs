//! Failure scenarios: coordinator crash re-election and a participant
//! lost mid-2PC.

mod common;

use std::time::Duration;

use common::{await_coordinator, rows, spawn_cluster, wait_for};
use relaydb_cluster::config::ReadStrategy;
use relaydb_cluster::ErrorCode;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn coordinator_crash_triggers_reelection() {
    let cluster = spawn_cluster(3, ReadStrategy::RoundRobin, |_, _| {}).await;
    assert!(await_coordinator(&cluster, &[1, 2, 3], 3).await);

    let term_before_1 = cluster.node(1).coordinator_view().term;
    let term_before_2 = cluster.node(2).coordinator_view().term;
    assert_eq!(term_before_1, term_before_2);

    cluster.node(3).shutdown().await;

    // within heartbeat_timeout + election_timeout the survivors agree on
    // the next-highest id
    assert!(await_coordinator(&cluster, &[1, 2], 2).await);
    assert_eq!(cluster.node(1).coordinator_view().term, term_before_1 + 1);
    assert_eq!(cluster.node(2).coordinator_view().term, term_before_2 + 1);

    // terms never went backwards along the way
    assert!(cluster.node(1).coordinator_view().term >= term_before_1);

    // the new coordinator accepts writes
    let reply = cluster
        .node(1)
        .execute("INSERT INTO users (name) VALUES ('after-failover')")
        .await;
    assert!(reply.ok, "write after failover failed: {:?}", reply.error);

    let cluster_ref = &cluster;
    let replicated = wait_for(
        move || async move {
            (1..=2).all(|id| {
                !rows(
                    cluster_ref.backend(id),
                    "SELECT name FROM users WHERE name='after-failover'",
                )
                .is_empty()
            })
        },
        Duration::from_secs(3),
    )
    .await;
    assert!(replicated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_participant_vote_aborts_the_write() {
    let cluster = spawn_cluster(3, ReadStrategy::RoundRobin, |_, _| {}).await;
    assert!(await_coordinator(&cluster, &[1, 2, 3], 3).await);

    // node 2 dies silently; the coordinator still counts it as a
    // participant because health has not noticed yet
    cluster.node(2).shutdown().await;

    let reply = cluster
        .node(3)
        .execute("INSERT INTO users (name) VALUES ('doomed')")
        .await;
    assert!(!reply.ok);
    assert_eq!(
        reply.error.as_ref().map(|e| e.code),
        Some(ErrorCode::Aborted)
    );

    // survivors applied nothing and hold no locks
    for id in [1u32, 3] {
        assert!(rows(cluster.backend(id), "SELECT name FROM users WHERE name='doomed'").is_empty());
        assert!(!cluster.node(id).participant().has_prepared(&reply.txn_id));
    }
    let cluster_ref = &cluster;
    let txn_id = reply.txn_id.clone();
    let released = wait_for(
        move || {
            let txn_id = txn_id.clone();
            async move {
                [1u32, 3].iter().all(|id| {
                    !cluster_ref
                        .node(*id)
                        .participant()
                        .locks()
                        .holds(&txn_id, "users")
                })
            }
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(released, "locks still held after abort");

    // the failed write does not block the next one
    let reply = cluster
        .node(3)
        .execute("INSERT INTO users (name) VALUES ('recovered')")
        .await;
    assert!(reply.ok, "follow-up write failed: {:?}", reply.error);
}
