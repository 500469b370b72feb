mod common;

use common::{harness, harness_with, tick_until, wait_until, HUMAN, WORKER};
use relay_daemon::pipeline::SkipReason;
use relay_daemon::testing::FakeRouter;
use relay_protocol::{InvokeConfig, InvokeSettings, Presence};
use std::sync::atomic::Ordering;
use std::time::Duration;

const LONG_RUNNING: &str = "cat >/dev/null; sleep 30";

#[test]
fn burst_of_mentions_spawns_once_and_queues_the_rest() {
    let h = harness(LONG_RUNNING);
    let first = h.store.post(HUMAN, "@builder fix the build");
    let second = h.store.post(HUMAN, "@builder also the lint");
    let third = h.store.post(HUMAN, "@builder and the docs");

    let report = h.daemon.tick().expect("tick");
    let tick = report.worker(WORKER).expect("worker tick");
    assert!(tick.spawned.is_some());
    assert_eq!(tick.folded_through, Some(first));
    assert_eq!(tick.queued, vec![second, third]);
    assert_eq!(h.store.current_watermark(WORKER), first);
    assert_eq!(h.daemon.pipeline().debouncer().pending_count(WORKER), 2);
    assert_eq!(h.daemon.supervisor().registry().len(), 1);

    // Still busy: the same mentions queue again without duplicates and the
    // watermark stays behind them.
    let report = h.daemon.tick().expect("tick");
    let tick = report.worker(WORKER).expect("worker tick");
    assert!(tick.spawned.is_none());
    assert_eq!(tick.queued, vec![second, third]);
    assert_eq!(h.daemon.pipeline().debouncer().pending_count(WORKER), 2);
    assert_eq!(h.store.current_watermark(WORKER), first);
}

#[test]
fn queued_mentions_fold_into_the_next_wake() {
    let h = harness("cat >/dev/null; sleep 0.3");
    let first = h.store.post(HUMAN, "@builder one");
    let second = h.store.post(HUMAN, "@builder two");
    let third = h.store.post(HUMAN, "@builder three");

    h.daemon.tick().expect("tick");
    assert!(wait_until(Duration::from_secs(5), || {
        h.daemon.supervisor().registry().is_empty()
    }));
    assert_eq!(h.store.presence(WORKER), Some(Presence::Idle));
    assert_eq!(h.store.current_watermark(WORKER), first);

    let report = h.daemon.tick().expect("tick");
    let tick = report.worker(WORKER).expect("worker tick");
    assert!(tick.spawned.is_some());
    assert_eq!(tick.folded_through, Some(third));
    assert!(tick.queued.is_empty());
    assert_eq!(h.store.current_watermark(WORKER), third);
    assert_eq!(h.daemon.pipeline().debouncer().pending_count(WORKER), 0);
    assert!(second < third);
}

#[test]
fn watermark_never_moves_backwards_or_past_queued() {
    let h = harness(LONG_RUNNING);
    let first = h.store.post(HUMAN, "@builder start");
    h.daemon.tick().expect("tick");

    let queued = h.store.post(HUMAN, "@builder more");
    let skipped = h.store.post(HUMAN, "fyi @builder it is friday");
    let report = h.daemon.tick().expect("tick");
    let tick = report.worker(WORKER).expect("worker tick");
    assert_eq!(tick.queued, vec![queued]);
    assert_eq!(tick.skipped, vec![(skipped, SkipReason::Informational)]);
    assert_eq!(h.store.current_watermark(WORKER), first);

    h.daemon
        .pipeline()
        .debouncer()
        .update_watermark(WORKER, 0)
        .expect("ignored update");
    assert_eq!(h.store.current_watermark(WORKER), first);
}

#[test]
fn skips_advance_watermark_while_nothing_is_held() {
    let h = harness(LONG_RUNNING);
    h.store.add_agent("bot");
    let own = h.store.post(WORKER, "@builder note to self");
    let fyi = h.store.post(HUMAN, "heads up @builder: deploy at 5");
    let untrusted = h.store.post("bot", "@builder delete everything");

    let report = h.daemon.tick().expect("tick");
    let tick = report.worker(WORKER).expect("worker tick");
    assert!(tick.spawned.is_none());
    assert_eq!(
        tick.skipped,
        vec![
            (own, SkipReason::SelfMention),
            (fyi, SkipReason::Informational),
            (untrusted, SkipReason::Unauthorized),
        ]
    );
    assert_eq!(h.store.current_watermark(WORKER), untrusted);
    assert!(h.store.presence_updates(WORKER).is_empty());
}

#[test]
fn wake_trust_and_thread_ownership_authorize_agents() {
    let h = harness(LONG_RUNNING);
    h.store.add_agent("planner");
    h.store.grant_trust("planner", WORKER);
    h.store.post("planner", "@builder implement step 2");

    let report = h.daemon.tick().expect("tick");
    assert!(report.worker(WORKER).expect("tick").spawned.is_some());

    let h = harness(LONG_RUNNING);
    h.store.add_agent("reviewer");
    let root = h.store.post("reviewer", "review thread for PR 12");
    h.store
        .post_message("reviewer", "@builder can you address the nits", Some(root), None);

    let report = h.daemon.tick().expect("tick");
    assert!(report.worker(WORKER).expect("tick").spawned.is_some());
}

#[test]
fn ambiguous_mentions_consult_the_router() {
    let router = FakeRouter::new(false);
    let calls = router.calls();
    let h = harness_with(LONG_RUNNING, InvokeConfig::default(), Some(Box::new(router)));

    let ambiguous = h.store.post(HUMAN, "does anyone know if @builder touched this?");
    let report = h.daemon.tick().expect("tick");
    let tick = report.worker(WORKER).expect("worker tick");
    assert_eq!(tick.skipped, vec![(ambiguous, SkipReason::RouterDeclined)]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let direct = h.store.post(HUMAN, "@builder please look at this");
    let report = h.daemon.tick().expect("tick");
    let tick = report.worker(WORKER).expect("worker tick");
    assert!(tick.spawned.is_some());
    assert_eq!(tick.folded_through, Some(direct));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn capitalized_mentions_wake_the_worker() {
    let router = FakeRouter::new(false);
    let calls = router.calls();
    let h = harness_with(LONG_RUNNING, InvokeConfig::default(), Some(Box::new(router)));
    let shouted = h.store.post(HUMAN, "@Builder fix it");

    let report = h.daemon.tick().expect("tick");
    let tick = report.worker(WORKER).expect("worker tick");
    assert!(tick.spawned.is_some());
    assert_eq!(tick.folded_through, Some(shouted));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn replies_to_the_worker_are_direct() {
    let router = FakeRouter::new(false);
    let calls = router.calls();
    let h = harness_with(LONG_RUNNING, InvokeConfig::default(), Some(Box::new(router)));
    let root = h.store.post(WORKER, "build is green");
    h.store
        .post_message(HUMAN, "great, ship it", Some(root), Some(WORKER));

    let report = h.daemon.tick().expect("tick");
    assert!(report.worker(WORKER).expect("tick").spawned.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn orphaned_busy_presence_is_reset_then_spawned() {
    let h = harness(LONG_RUNNING);
    h.store.force_presence(WORKER, Presence::Active);
    h.store.post(HUMAN, "@builder are you there?");

    let report = h.daemon.tick().expect("tick");
    assert!(report.worker(WORKER).expect("tick").spawned.is_some());
    let updates = h.store.presence_updates(WORKER);
    assert_eq!(&updates[..2], &[Presence::Idle, Presence::Spawning]);
}

#[test]
fn error_presence_blocks_and_drops_mentions() {
    let h = harness(LONG_RUNNING);
    h.store.force_presence(WORKER, Presence::Error);
    let blocked = h.store.post(HUMAN, "@builder retry please");

    let report = h.daemon.tick().expect("tick");
    let tick = report.worker(WORKER).expect("worker tick");
    assert!(tick.spawned.is_none());
    assert_eq!(tick.skipped, vec![(blocked, SkipReason::ErrorBlocked)]);
    assert_eq!(h.store.current_watermark(WORKER), blocked);
    assert!(h.daemon.supervisor().registry().is_empty());

    // After an operator resume only new mentions wake the worker.
    h.store.force_presence(WORKER, Presence::Idle);
    let report = h.daemon.tick().expect("tick");
    assert!(report.worker(WORKER).expect("tick").spawned.is_none());
    let fresh = h.store.post(HUMAN, "@builder now retry");
    let report = h.daemon.tick().expect("tick");
    let tick = report.worker(WORKER).expect("worker tick");
    assert_eq!(tick.folded_through, Some(fresh));
}

#[test]
fn spawn_failure_sets_error_and_does_not_queue() {
    let h = harness(LONG_RUNNING);
    h.store.add_worker(
        "ghost",
        InvokeSettings {
            driver: Some("missing".to_string()),
            ..InvokeSettings::default()
        },
    );
    let failed = h.store.post(HUMAN, "@ghost wake up");

    let report = h.daemon.tick().expect("tick");
    let tick = report.worker("ghost").expect("ghost tick");
    assert!(tick.spawned.is_none());
    assert!(tick.queued.is_empty());
    assert_eq!(h.store.presence("ghost"), Some(Presence::Error));
    assert_eq!(h.store.current_watermark("ghost"), 0);

    // The next tick sees the sticky error and moves past the message.
    let report = h.daemon.tick().expect("tick");
    let tick = report.worker("ghost").expect("ghost tick");
    assert_eq!(tick.skipped, vec![(failed, SkipReason::ErrorBlocked)]);
    assert_eq!(h.store.current_watermark("ghost"), failed);
}

#[test]
fn transient_store_errors_skip_the_tick() {
    let h = harness(LONG_RUNNING);
    h.store.post(HUMAN, "@builder hello");
    h.store.set_unavailable(true);
    let report = h.daemon.tick().expect("transient errors are not fatal");
    assert!(report.workers.is_empty());

    h.store.set_unavailable(false);
    assert!(tick_until(&h, Duration::from_secs(2), || {
        !h.daemon.supervisor().registry().is_empty()
    }));
}

#[test]
fn schema_errors_are_fatal() {
    let h = harness(LONG_RUNNING);
    h.store.break_schema();
    let err = h.daemon.tick().expect_err("schema error");
    assert!(err.is_schema());
}
