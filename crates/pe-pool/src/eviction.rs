use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(20);

/// A pool the shared sweeper can evict idle channels from.
pub trait Evictable: Send + Sync {
    fn name(&self) -> &str;

    /// Closes idle channels past their idle limit, returning how many.
    fn evict(&self) -> usize;
}

struct Registration {
    id: u64,
    pool: Weak<dyn Evictable>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    pools: Vec<Registration>,
    sweeper_running: bool,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));

fn lock_registry() -> MutexGuard<'static, Registry> {
    match REGISTRY.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Adds a pool to the process-wide registry, starting the sweeper thread
/// if it is not running.
pub(crate) fn register(pool: Weak<dyn Evictable>) -> u64 {
    let mut registry = lock_registry();
    registry.next_id += 1;
    let id = registry.next_id;
    registry.pools.push(Registration { id, pool });

    if !registry.sweeper_running {
        let spawned = thread::Builder::new()
            .name("pe-pool-evictor".to_string())
            .spawn(|| run_sweeper(&REGISTRY, SWEEP_INTERVAL));
        match spawned {
            Ok(_) => {
                registry.sweeper_running = true;
                info!(interval_secs = SWEEP_INTERVAL.as_secs(), "channel evictor started");
            }
            Err(error) => warn!(%error, "channel evictor could not start"),
        }
    }
    id
}

pub(crate) fn deregister(id: u64) {
    lock_registry().pools.retain(|registration| registration.id != id);
}

pub(crate) fn is_registered(id: u64) -> bool {
    lock_registry()
        .pools
        .iter()
        .any(|registration| registration.id == id)
}

pub fn is_sweeper_running() -> bool {
    lock_registry().sweeper_running
}

/// Runs one sweep over every live registered pool and returns the number
/// of channels evicted.
pub fn sweep_now() -> usize {
    let pools = {
        let mut registry = lock_registry();
        live_pools(&mut registry)
    };
    evict_all(&pools)
}

/// Pools for the next sweep, or `None` once nothing is registered. In that
/// case the sweeper is marked stopped so the next registration restarts it.
fn next_sweep(registry: &mut Registry) -> Option<Vec<Arc<dyn Evictable>>> {
    let pools = live_pools(registry);
    if pools.is_empty() {
        registry.sweeper_running = false;
        return None;
    }
    Some(pools)
}

fn run_sweeper(registry: &Mutex<Registry>, interval: Duration) {
    loop {
        thread::sleep(interval);

        let next = match registry.try_lock() {
            Ok(mut registry) => next_sweep(&mut registry),
            Err(TryLockError::Poisoned(poisoned)) => next_sweep(&mut poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                debug!("pool registry busy, retrying on next sweep");
                continue;
            }
        };
        let Some(pools) = next else {
            info!("channel evictor stopped, no pools registered");
            return;
        };

        evict_all(&pools);
    }
}

/// Serializes tests that sweep the process-wide registry.
#[cfg(test)]
pub(crate) fn registry_test_guard() -> MutexGuard<'static, ()> {
    static GUARD: Mutex<()> = Mutex::new(());
    match GUARD.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn live_pools(registry: &mut Registry) -> Vec<Arc<dyn Evictable>> {
    registry
        .pools
        .retain(|registration| registration.pool.strong_count() > 0);
    registry
        .pools
        .iter()
        .filter_map(|registration| registration.pool.upgrade())
        .collect()
}

fn evict_all(pools: &[Arc<dyn Evictable>]) -> usize {
    let mut total = 0;
    for pool in pools {
        let evicted = pool.evict();
        if evicted > 0 {
            debug!(pool = pool.name(), evicted, "evicted idle channels");
        }
        total += evicted;
    }
    total
}
