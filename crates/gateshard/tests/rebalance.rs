//! End-to-end reconciliation scenarios: the scheduler running against the
//! in-memory membership backend, a scripted gateway probe, and scripted
//! stream sessions.

use std::sync::Arc;
use std::time::Duration;

use gateshard::gateway::{GatewayInfo, SessionStartLimit};
use gateshard::membership::Membership;
use gateshard::scheduler::{Scheduler, SchedulerArgs};
use gateshard::storage::memory::MemoryMembership;
use gateshard::testing::{ScriptedConnector, SessionEvent, StaticProbe};

const INTENT: u32 = 1 << 30;

fn ap(shards: u32) -> GatewayInfo {
    GatewayInfo {
        url: "wss://gateway.example.com/stream".to_string(),
        shards,
        // max_concurrency 5 keeps the per-session start interval at 1s.
        session_start_limit: SessionStartLimit { max_concurrency: 5 },
    }
}

struct Harness {
    membership: Arc<MemoryMembership>,
    probe: Arc<StaticProbe>,
    connector: Arc<ScriptedConnector>,
    scheduler: Scheduler,
}

async fn harness(self_id: &str, peers: &[&str], info: GatewayInfo) -> Harness {
    let membership = Arc::new(MemoryMembership::new());
    for peer in peers {
        membership.add_peer(peer);
    }
    membership.register(Some(self_id)).await.unwrap();

    let probe = Arc::new(StaticProbe::new(info));
    let connector = ScriptedConnector::new();
    let args = SchedulerArgs {
        watch_interval: Duration::from_millis(300),
        ..SchedulerArgs::new(
            Arc::clone(&membership) as Arc<dyn Membership>,
            Arc::clone(&probe) as Arc<dyn gateshard::gateway::GatewayProbe>,
            Arc::clone(&connector) as Arc<dyn gateshard::session::StreamConnector>,
            12345,
            "token",
            INTENT,
        )
    };
    let scheduler = Scheduler::new(args).await.unwrap();
    Harness {
        membership,
        probe,
        connector,
        scheduler,
    }
}

fn connected_shards(connector: &ScriptedConnector) -> Vec<u32> {
    let mut shards: Vec<u32> = connector
        .events()
        .iter()
        .filter(|ev| ev.event == SessionEvent::Connect)
        .map(|ev| ev.shard_id)
        .collect();
    shards.sort_unstable();
    shards.dedup();
    shards
}

/// Three sorted members, gateway minimum of five partitions: the last
/// member owns exactly partition 2, and sessions start from the priming
/// event alone (no membership churn needed).
#[tokio::test(flavor = "multi_thread")]
async fn three_nodes_five_shards_starts_own_partition() {
    let h = harness("10.0.0.3", &["10.0.0.1", "10.0.0.2"], ap(5)).await;
    h.scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(connected_shards(&h.connector), vec![2]);
    let events = h.connector.events_for(2);
    assert!(
        events.contains(&SessionEvent::Identify),
        "fresh session must identify, got {events:?}"
    );

    // The session carries the epoch's partition layout.
    assert_eq!(h.connector.sessions_created(), 1);

    h.scheduler.shutdown().await;
    let events = h.connector.events_for(2);
    assert_eq!(events.last(), Some(&SessionEvent::Closed));
}

/// Five members but only two partitions: members past the partition count
/// idle without starting sessions.
#[tokio::test(flavor = "multi_thread")]
async fn surplus_node_idles() {
    let h = harness(
        "10.0.0.5",
        &["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"],
        ap(2),
    )
    .await;
    h.scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(h.connector.sessions_created(), 0, "idle node starts nothing");
    assert!(h.probe.calls() > 0, "the idle node still probes and reconciles");

    h.scheduler.shutdown().await;
}

/// The upstream raises its partition minimum: the scheduler stops every
/// old session before starting the new epoch, and the new sessions carry
/// the new shard count.
#[tokio::test(flavor = "multi_thread")]
async fn partition_growth_replaces_all_sessions() {
    let h = harness("10.0.0.1", &[], ap(2)).await;
    h.scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    // Epoch one: single node owns both partitions.
    assert_eq!(connected_shards(&h.connector), vec![0, 1]);
    let epoch_one_events = h.connector.events().len();

    h.probe.set(ap(4));
    // The next watch-interval tick re-probes and reschedules; four staggered
    // session starts need a few seconds on top.
    tokio::time::sleep(Duration::from_secs(6)).await;

    let events = h.connector.events();
    assert_eq!(connected_shards(&h.connector), vec![0, 1, 2, 3]);

    // Old epoch fully closed before the new epoch's first connect.
    let close_positions: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, ev)| ev.event == SessionEvent::Closed)
        .map(|(idx, _)| idx)
        .collect();
    let first_new_connect = events
        .iter()
        .enumerate()
        .skip(epoch_one_events)
        .find(|(_, ev)| ev.event == SessionEvent::Connect)
        .map(|(idx, _)| idx)
        .expect("new epoch must connect");
    assert_eq!(close_positions.len(), 2, "both old sessions close exactly once");
    assert!(
        close_positions.iter().all(|&pos| pos < first_new_connect),
        "old sessions must close before new ones connect, got {events:?}"
    );

    h.scheduler.shutdown().await;
}

/// A peer disappears (as lease expiry would): the remaining node observes
/// the change and expands its ownership.
#[tokio::test(flavor = "multi_thread")]
async fn peer_removal_triggers_rebalance() {
    let h = harness("10.0.0.2", &["10.0.0.1"], ap(2)).await;
    h.scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Two members, two partitions: index 1 owns partition 1.
    assert_eq!(connected_shards(&h.connector), vec![1]);

    h.membership.remove_peer("10.0.0.1");
    tokio::time::sleep(Duration::from_secs(3)).await;

    // Alone now: owns both partitions.
    assert_eq!(connected_shards(&h.connector), vec![0, 1]);

    h.scheduler.shutdown().await;
}

/// Reconciliation passes with identical inputs produce no session churn.
#[tokio::test(flavor = "multi_thread")]
async fn reconcile_is_idempotent() {
    let h = harness("10.0.0.1", &[], ap(1)).await;
    h.scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let settled = h.connector.events().len();
    let probes = h.probe.calls();

    // Several watch-interval ticks pass; each runs a full pass.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.probe.calls() > probes, "ticks keep reconciling");
    assert_eq!(
        h.connector.events().len(),
        settled,
        "equivalent assignments must not restart sessions"
    );

    h.scheduler.shutdown().await;
}

/// A failing probe aborts the pass and preserves the current assignment.
#[tokio::test(flavor = "multi_thread")]
async fn probe_failure_keeps_current_assignment() {
    let h = harness("10.0.0.1", &[], ap(1)).await;
    h.scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(connected_shards(&h.connector), vec![0]);

    let settled = h.connector.events().len();
    h.probe.set_failing(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        h.connector.events().len(),
        settled,
        "probe failure must not tear down running sessions"
    );

    h.probe.set_failing(false);
    h.scheduler.shutdown().await;
}
