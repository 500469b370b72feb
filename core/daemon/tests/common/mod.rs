#![allow(dead_code)]

use relay_daemon::config::DaemonConfig;
use relay_daemon::driver::DriverRegistry;
use relay_daemon::router::{FailOpenRouter, Router};
use relay_daemon::telemetry::UsageTelemetry;
use relay_daemon::testing::{sh_driver, FakeTelemetry, MemoryStore};
use relay_daemon::Daemon;
use relay_protocol::{InvokeConfig, InvokeSettings};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

pub const WORKER: &str = "builder";
pub const HUMAN: &str = "alice";

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub telemetry: Arc<FakeTelemetry>,
    pub daemon: Daemon,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.daemon.supervisor().shutdown();
    }
}

pub fn config(invoke: InvokeConfig) -> DaemonConfig {
    DaemonConfig {
        poll_interval_ms: 50,
        session_wait_ms: 200,
        kill_grace_ms: 500,
        invoke: InvokeConfig {
            driver: Some("sh".to_string()),
            ..invoke
        },
        ..DaemonConfig::default()
    }
}

pub fn harness(script: &str) -> Harness {
    harness_with(script, InvokeConfig::default(), None)
}

pub fn harness_with(script: &str, invoke: InvokeConfig, router: Option<Box<dyn Router>>) -> Harness {
    harness_full(script, config(invoke), router, None)
}

pub fn harness_full(
    script: &str,
    config: DaemonConfig,
    router: Option<Box<dyn Router>>,
    telemetry: Option<Arc<dyn UsageTelemetry>>,
) -> Harness {
    let fake = Arc::new(FakeTelemetry::new());
    let telemetry: Arc<dyn UsageTelemetry> = telemetry.unwrap_or_else(|| fake.clone());
    let (store, daemon) = build(script, &config, router, telemetry);
    Harness {
        store,
        telemetry: fake,
        daemon,
    }
}

/// A daemon not wrapped in a [`Harness`], for tests that `start` it.
pub fn build(
    script: &str,
    config: &DaemonConfig,
    router: Option<Box<dyn Router>>,
    telemetry: Arc<dyn UsageTelemetry>,
) -> (Arc<MemoryStore>, Daemon) {
    let mut drivers = DriverRegistry::empty();
    drivers.register("sh", sh_driver(script));
    build_with_drivers(drivers, config, router, telemetry)
}

/// Like [`harness_full`] but with caller-supplied drivers.
pub fn harness_drivers(drivers: DriverRegistry, config: DaemonConfig) -> Harness {
    let telemetry = Arc::new(FakeTelemetry::new());
    let (store, daemon) = build_with_drivers(drivers, &config, None, telemetry.clone());
    Harness {
        store,
        telemetry,
        daemon,
    }
}

pub fn build_with_drivers(
    drivers: DriverRegistry,
    config: &DaemonConfig,
    router: Option<Box<dyn Router>>,
    telemetry: Arc<dyn UsageTelemetry>,
) -> (Arc<MemoryStore>, Daemon) {
    let store = Arc::new(MemoryStore::new());
    store.add_worker(WORKER, InvokeSettings::default());
    store.add_human(HUMAN);

    let daemon = Daemon::new(
        config,
        store.clone(),
        drivers,
        telemetry,
        FailOpenRouter::new(router),
    );
    (store, daemon)
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20));
    }
    condition()
}

/// Ticks the daemon until `condition` holds.
pub fn tick_until(harness: &Harness, timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    wait_until(timeout, || {
        harness.daemon.tick().expect("tick");
        condition()
    })
}
