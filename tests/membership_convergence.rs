//! Tests for the membership convergence monitor: immediate success,
//! event-driven convergence, timeout diagnostics and listener cleanup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fork_channel::testing::ScriptedTopologyCache;
use fork_channel::{await_membership, MembershipView};

#[test]
fn returns_immediately_when_view_already_matches() {
    let cache = ScriptedTopologyCache::new(MembershipView::new(1, ["node-a", "node-b"]));
    let start = Instant::now();
    let view = await_membership(&cache, ["node-a", "node-b"], Duration::from_secs(30)).unwrap();
    assert_eq!(view.topology_id(), 1);
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn converges_when_the_expected_view_is_installed_later() {
    let cache = Arc::new(ScriptedTopologyCache::new(MembershipView::new(
        1,
        ["node-a"],
    )));

    let installer = {
        let cache = cache.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(1000));
            cache.install_view(MembershipView::new(2, ["node-a", "node-b"]));
        })
    };

    let start = Instant::now();
    let view = await_membership(
        cache.as_ref(),
        ["node-a", "node-b"],
        Duration::from_millis(5000),
    )
    .unwrap();
    let elapsed = start.elapsed();
    installer.join().unwrap();

    assert_eq!(view.topology_id(), 2);
    // Wakes on the change event, not on the deadline.
    assert!(elapsed >= Duration::from_millis(900), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(4000), "waited for the deadline: {elapsed:?}");
}

#[test]
fn intermediate_views_keep_the_wait_alive() {
    let cache = Arc::new(ScriptedTopologyCache::new(MembershipView::new(
        1,
        ["node-a"],
    )));

    let installer = {
        let cache = cache.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            cache.install_view(MembershipView::new(2, ["node-a", "node-c"]));
            std::thread::sleep(Duration::from_millis(200));
            cache.install_view(MembershipView::new(3, ["node-a", "node-b"]));
        })
    };

    let view = await_membership(
        cache.as_ref(),
        ["node-a", "node-b"],
        Duration::from_millis(5000),
    )
    .unwrap();
    installer.join().unwrap();
    assert_eq!(view.topology_id(), 3);
}

#[test]
fn timeout_reports_the_last_observed_view() {
    let cache = ScriptedTopologyCache::new(MembershipView::new(4, ["node-a", "node-b"]));

    let start = Instant::now();
    let err = await_membership(
        &cache,
        ["node-a", "node-b", "node-c"],
        Duration::from_millis(2000),
    )
    .unwrap_err();
    let elapsed = start.elapsed();

    let timeout = err.as_convergence_timeout().expect("typed timeout failure");
    assert_eq!(timeout.topology_id, 4);
    let observed: std::collections::BTreeSet<String> =
        ["node-a".to_owned(), "node-b".to_owned()].into_iter().collect();
    assert_eq!(timeout.observed, observed);
    assert!(timeout.expected.contains("node-c"));
    assert_eq!(timeout.waited, Duration::from_millis(2000));

    assert!(elapsed >= Duration::from_millis(1900), "expired too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(5000), "expired too late: {elapsed:?}");
}

#[test]
fn listener_is_removed_on_both_exit_paths() {
    let cache = ScriptedTopologyCache::new(MembershipView::new(1, ["node-a"]));
    assert_eq!(cache.listener_count(), 0);

    // Success path.
    await_membership(&cache, ["node-a"], Duration::from_secs(5)).unwrap();
    assert_eq!(cache.listener_count(), 0);

    // Timeout path.
    await_membership(&cache, ["node-a", "node-b"], Duration::from_millis(50)).unwrap_err();
    assert_eq!(cache.listener_count(), 0);

    // Repeated waits never accumulate stale listeners.
    for _ in 0..5 {
        let _ = await_membership(&cache, ["node-a"], Duration::from_secs(1));
    }
    assert_eq!(cache.listener_count(), 0);
}
