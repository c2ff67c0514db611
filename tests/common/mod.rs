// Shared rig for the integration tests: a simulated device, in-memory store
// and a manual clock wired into one executor.
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use follow_cycle::clock::ManualClock;
use follow_cycle::config::Config;
use follow_cycle::device::sim::{SimDevice, SimLocator, SimScript};
use follow_cycle::engine::{RateGovernor, SharedGovernor, TapJitter};
use follow_cycle::execution::ActionExecutor;
use follow_cycle::store::{Store, Target};
use std::sync::{Arc, Mutex};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

/// No waiting anywhere, generous caps.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.device.settle_ms = 0;
    config.device.launch_wait_ms = 0;
    config.limits.min_delay_seconds = 0;
    config.limits.max_delay_seconds = 0;
    config.limits.min_action_spacing_seconds = 0;
    config.limits.verify_spacing_seconds = 0;
    config.limits.max_actions_per_hour = 100;
    config
}

pub struct Rig {
    pub executor: ActionExecutor,
    pub sim: SimLocator,
    pub store: Arc<Store>,
    pub clock: ManualClock,
    pub governor: SharedGovernor,
}

pub fn rig(script: SimScript, config: &Config) -> Rig {
    let (device, sim) = SimDevice::new(script, 42);
    let store = Arc::new(Store::open_in_memory().unwrap());
    let clock = ManualClock::new(t0());
    let governor: SharedGovernor = Arc::new(Mutex::new(
        RateGovernor::with_seed(config.limits.clone(), config.local_offset(), 42).unwrap(),
    ));
    let executor = ActionExecutor::new(
        Box::new(device),
        Arc::new(sim.clone()),
        governor.clone(),
        store.clone(),
        Arc::new(clock.clone()),
        config,
    )
    .with_jitter(TapJitter::seeded(config.vision.coordinate_variance, 42));
    Rig {
        executor,
        sim,
        store,
        clock,
        governor,
    }
}

pub fn import(store: &Store, handles: &[&str]) -> Vec<Target> {
    store.import_targets(handles, t0()).unwrap();
    handles
        .iter()
        .map(|h| store.target(h).unwrap().unwrap())
        .collect()
}
