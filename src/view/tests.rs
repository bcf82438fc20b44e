//! View module tests

use std::sync::atomic::AtomicUsize;

use pretty_assertions::assert_eq;
use proptest::prelude::*;

use super::*;
use crate::node::ManualClock;

fn view_with_clock() -> (View, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let view = View::new(NodeId::from("self"), clock.clone());
    (view, clock)
}

fn addr(n: u32) -> NodeAddress {
    NodeAddress::new(format!("mem:{}", n))
}

fn id(n: u32) -> NodeId {
    NodeId::new(format!("node-{}", n))
}

#[derive(Default)]
struct CountingListener {
    up: AtomicUsize,
    down: AtomicUsize,
    left: AtomicUsize,
}

impl ViewListener for CountingListener {
    fn on_up(&self, _node: &NodeSnapshot) {
        self.up.fetch_add(1, Ordering::SeqCst);
    }

    fn on_down(&self, _node: &NodeSnapshot) {
        self.down.fetch_add(1, Ordering::SeqCst);
    }

    fn on_left(&self, _node: &NodeSnapshot) {
        self.left.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_add_host_is_idempotent() {
    let (view, _) = view_with_clock();
    assert!(view.add_host(&addr(1), &id(1)).unwrap());
    assert!(!view.add_host(&addr(1), &id(1)).unwrap());
    assert_eq!(view.node_count(), 1);
}

#[test]
fn test_heartbeat_is_idempotent() {
    let (view, _) = view_with_clock();
    assert!(view.heartbeat(&addr(1), &id(1)).unwrap());
    assert!(!view.heartbeat(&addr(1), &id(1)).unwrap());
    assert_eq!(view.node_count(), 1);
    assert_eq!(view.get(&id(1)).unwrap().touch_count(), 2);
}

#[test]
fn test_self_is_rejected() {
    let (view, _) = view_with_clock();
    let me = NodeId::from("self");
    assert_eq!(
        view.add_host(&addr(1), &me),
        Err(ViewError::SelfAddition(me.clone()))
    );
    assert_eq!(
        view.heartbeat(&addr(1), &me),
        Err(ViewError::SelfAddition(me.clone()))
    );
    assert!(view.observe(&addr(1), &me, 9).is_err());
    assert_eq!(view.node_count(), 0);
}

#[test]
fn test_add_host_rejects_tombstoned_node() {
    let (view, _) = view_with_clock();
    view.add_host(&addr(1), &id(1)).unwrap();
    assert!(view.remove_dead_node(&id(1)));

    assert!(!view.add_host(&addr(1), &id(1)).unwrap());
    assert!(view.is_node_dead(&id(1)));
    assert!(!view.is_live(&id(1)));
}

#[test]
fn test_heartbeat_resurrects_tombstoned_node() {
    let (view, _) = view_with_clock();
    view.add_host(&addr(1), &id(1)).unwrap();
    view.remove_dead_node(&id(1));

    assert!(view.heartbeat(&addr(1), &id(1)).unwrap());
    assert!(!view.is_node_dead(&id(1)));
    assert!(view.is_live(&id(1)));
    assert_eq!(view.dead_count(), 0);
}

#[test]
fn test_heartbeat_clears_suspicion() {
    let (view, _) = view_with_clock();
    view.add_host(&addr(1), &id(1)).unwrap();
    view.get(&id(1)).unwrap().suspect();

    view.heartbeat(&addr(1), &id(1)).unwrap();
    assert_eq!(view.get(&id(1)).unwrap().health(), Health::Normal);
}

#[test]
fn test_remove_dead_node_not_live_is_noop() {
    let (view, _) = view_with_clock();
    assert!(!view.remove_dead_node(&id(7)));
    assert_eq!(view.dead_count(), 0);
}

#[test]
fn test_remove_leaving_node_leaves_no_tombstone() {
    let (view, _) = view_with_clock();
    view.add_host(&addr(1), &id(1)).unwrap();
    assert!(view.remove_leaving_node(&id(1)));
    assert!(!view.is_node_dead(&id(1)));

    // A graceful leaver may come straight back
    assert!(view.add_host(&addr(1), &id(1)).unwrap());
}

#[test]
fn test_grace_period_eviction() {
    let (view, clock) = view_with_clock();
    let grace = Duration::from_millis(500);
    view.add_host(&addr(1), &id(1)).unwrap();
    view.remove_dead_node(&id(1));

    clock.advance(Duration::from_millis(499));
    assert_eq!(view.cleanup_dead_node_list(grace), 0);
    assert!(view.is_node_dead(&id(1)));

    clock.advance(Duration::from_millis(1));
    assert_eq!(view.cleanup_dead_node_list(grace), 1);
    assert!(!view.is_node_dead(&id(1)));
}

#[test]
fn test_observe_refreshes_only_on_newer_version() {
    let (view, clock) = view_with_clock();
    assert!(view.observe(&addr(1), &id(1), 5).unwrap());
    let first_touch = view.get(&id(1)).unwrap().last_touch();

    clock.advance(Duration::from_millis(100));
    view.observe(&addr(1), &id(1), 5).unwrap();
    assert_eq!(view.get(&id(1)).unwrap().last_touch(), first_touch);

    view.observe(&addr(1), &id(1), 6).unwrap();
    assert_eq!(view.get(&id(1)).unwrap().last_touch(), first_touch + 100);
}

#[test]
fn test_observe_lifts_tombstone_only_with_newer_version() {
    let (view, _) = view_with_clock();
    view.observe(&addr(1), &id(1), 3).unwrap();
    view.remove_dead_node(&id(1));

    assert!(!view.observe(&addr(1), &id(1), 3).unwrap());
    assert!(view.is_node_dead(&id(1)));

    assert!(view.observe(&addr(1), &id(1), 4).unwrap());
    assert!(view.is_live(&id(1)));
}

#[test]
fn test_listeners_see_every_change() {
    let (view, _) = view_with_clock();
    let listener = Arc::new(CountingListener::default());
    view.add_listener(listener.clone());

    view.add_host(&addr(1), &id(1)).unwrap();
    view.add_host(&addr(2), &id(2)).unwrap();
    view.add_host(&addr(2), &id(2)).unwrap();
    view.remove_dead_node(&id(1));
    view.remove_leaving_node(&id(2));

    assert_eq!(listener.up.load(Ordering::SeqCst), 2);
    assert_eq!(listener.down.load(Ordering::SeqCst), 1);
    assert_eq!(listener.left.load(Ordering::SeqCst), 1);
}

#[test]
fn test_removed_listener_is_not_called() {
    let (view, _) = view_with_clock();
    let listener = Arc::new(CountingListener::default());
    let as_dyn: Arc<dyn ViewListener> = listener.clone();
    view.add_listener(as_dyn.clone());
    view.remove_listener(&as_dyn);

    view.add_host(&addr(1), &id(1)).unwrap();
    assert_eq!(listener.up.load(Ordering::SeqCst), 0);
}

struct PanickingListener;

impl ViewListener for PanickingListener {
    fn on_up(&self, _node: &NodeSnapshot) {
        panic!("listener failure");
    }
}

#[test]
fn test_panicking_listener_does_not_stop_others() {
    let (view, _) = view_with_clock();
    let counting = Arc::new(CountingListener::default());
    view.add_listener(Arc::new(PanickingListener));
    view.add_listener(counting.clone());

    assert!(view.add_host(&addr(1), &id(1)).unwrap());
    assert_eq!(counting.up.load(Ordering::SeqCst), 1);
}

/// Adds a follower node whenever a node comes up
struct ReentrantListener {
    view: parking_lot::Mutex<Option<Arc<View>>>,
}

impl ViewListener for ReentrantListener {
    fn on_up(&self, node: &NodeSnapshot) {
        if node.node_id == id(1) {
            let view = self.view.lock().clone();
            if let Some(view) = view {
                view.add_host(&addr(2), &id(2)).unwrap();
            }
        }
    }

    fn on_down(&self, _node: &NodeSnapshot) {
        let view = self.view.lock().clone();
        if let Some(view) = view {
            assert!(view.is_node_dead(&id(1)));
        }
    }
}

#[test]
fn test_listener_reentry_does_not_deadlock() {
    let clock = Arc::new(ManualClock::new(0));
    let view = Arc::new(View::new(NodeId::from("self"), clock));
    let listener = Arc::new(ReentrantListener {
        view: parking_lot::Mutex::new(Some(view.clone())),
    });
    view.add_listener(listener.clone());

    view.add_host(&addr(1), &id(1)).unwrap();
    assert_eq!(view.node_count(), 2);

    view.remove_dead_node(&id(1));
    assert_eq!(view.node_count(), 1);

    // Break the Arc cycle
    listener.view.lock().take();
}

#[test]
fn test_nodes_by_staleness() {
    let (view, clock) = view_with_clock();
    view.add_host(&addr(1), &id(1)).unwrap();
    clock.advance(Duration::from_millis(10));
    view.add_host(&addr(2), &id(2)).unwrap();
    clock.advance(Duration::from_millis(10));
    view.heartbeat(&addr(1), &id(1)).unwrap();

    let order: Vec<NodeId> = view
        .nodes_by_staleness()
        .into_iter()
        .map(|n| n.node_id)
        .collect();
    assert_eq!(order, vec![id(2), id(1)]);
}

#[test]
fn test_clear_notifies_left() {
    let (view, _) = view_with_clock();
    let listener = Arc::new(CountingListener::default());
    view.add_listener(listener.clone());
    view.add_host(&addr(1), &id(1)).unwrap();
    view.add_host(&addr(2), &id(2)).unwrap();
    view.remove_dead_node(&id(2));

    assert_eq!(view.clear(), 1);
    assert_eq!(view.node_count(), 0);
    assert_eq!(view.dead_count(), 0);
    assert_eq!(listener.left.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_await_peers_returns_when_peer_arrives() {
    let clock = Arc::new(ManualClock::new(0));
    let view = Arc::new(View::new(NodeId::from("self"), clock));

    let adder = view.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        adder.add_host(&addr(1), &id(1)).unwrap();
    });

    let count = view.await_peers(Duration::from_secs(5), 1).await.unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_await_peers_times_out_when_empty() {
    let (view, _) = view_with_clock();
    let err = view
        .await_peers(Duration::from_millis(30), 0)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ViewError::AwaitTimeout {
            expected: 1,
            actual: 0
        }
    );
}

#[tokio::test]
async fn test_await_peers_enforces_minimum() {
    let (view, _) = view_with_clock();
    view.add_host(&addr(1), &id(1)).unwrap();

    let err = view
        .await_peers(Duration::from_millis(30), 2)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ViewError::AwaitTimeout {
            expected: 2,
            actual: 1
        }
    );
}

#[tokio::test]
async fn test_await_peers_interrupted_by_shutdown() {
    let clock = Arc::new(ManualClock::new(0));
    let view = Arc::new(View::new(NodeId::from("self"), clock));

    let closer = view.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.shutdown();
    });

    let err = view
        .await_peers(Duration::from_secs(5), 1)
        .await
        .unwrap_err();
    assert_eq!(err, ViewError::Interrupted);
}

#[test]
fn test_shutdown_rejects_mutations() {
    let (view, _) = view_with_clock();
    view.add_host(&addr(1), &id(1)).unwrap();
    view.shutdown();

    assert_eq!(view.add_host(&addr(2), &id(2)), Err(ViewError::Closed));
    assert_eq!(view.heartbeat(&addr(3), &id(3)), Err(ViewError::Closed));
    assert_eq!(view.observe(&addr(4), &id(4), 1), Err(ViewError::Closed));
    assert_eq!(view.node_count(), 1);
    assert!(!view.is_live(&id(2)));
}

#[test]
fn test_peer_count_matches_view_after_concurrent_changes() {
    let clock = Arc::new(ManualClock::new(0));
    let view = Arc::new(View::new(NodeId::from("self"), clock));

    let workers: Vec<_> = (0..4u32)
        .map(|t| {
            let view = view.clone();
            std::thread::spawn(move || {
                for round in 0..200u32 {
                    let n = t * 1_000 + round;
                    view.add_host(&addr(n), &id(n)).unwrap();
                    if round % 3 != 0 {
                        view.remove_leaving_node(&id(n));
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(*view.peer_count.borrow(), view.node_count());
}

#[derive(Debug, Clone)]
enum Op {
    Add(u32),
    Heartbeat(u32),
    Observe(u32, u64),
    Dead(u32),
    Leave(u32),
    Cleanup(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..6).prop_map(Op::Add),
        (0u32..6).prop_map(Op::Heartbeat),
        ((0u32..6), (0u64..8)).prop_map(|(n, v)| Op::Observe(n, v)),
        (0u32..6).prop_map(Op::Dead),
        (0u32..6).prop_map(Op::Leave),
        (0u64..300).prop_map(Op::Cleanup),
    ]
}

proptest! {
    #[test]
    fn tombstones_and_live_nodes_are_disjoint(ops in proptest::collection::vec(op(), 1..60)) {
        let (view, clock) = view_with_clock();
        for op in ops {
            match op {
                Op::Add(n) => { view.add_host(&addr(n), &id(n)).unwrap(); }
                Op::Heartbeat(n) => { view.heartbeat(&addr(n), &id(n)).unwrap(); }
                Op::Observe(n, v) => { view.observe(&addr(n), &id(n), v).unwrap(); }
                Op::Dead(n) => { view.remove_dead_node(&id(n)); }
                Op::Leave(n) => { view.remove_leaving_node(&id(n)); }
                Op::Cleanup(advance) => {
                    clock.advance(Duration::from_millis(advance));
                    view.cleanup_dead_node_list(Duration::from_millis(100));
                }
            }
            for n in 0..6 {
                prop_assert!(!(view.is_live(&id(n)) && view.is_node_dead(&id(n))));
            }
        }
    }
}
