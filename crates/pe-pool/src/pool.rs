use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Instant;

use pe_core::ProcError;
use tracing::{debug, info, warn};

use crate::channel::{ChannelFactory, ChannelState, ManagedChannel};
use crate::config::PoolConfig;
use crate::eviction::{self, Evictable};
use crate::methods::MethodTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub max_open: i64,
}

struct IdleChannel {
    channel: ManagedChannel,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleChannel>,
    active: usize,
    closed: bool,
}

struct PoolInner {
    name: String,
    factory: Box<dyn ChannelFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    next_channel_id: AtomicU64,
    registration: Mutex<Option<u64>>,
}

/// Bounded, named pool of reusable channels.
///
/// With `max_open <= 0` pooling is disabled: every reservation creates a
/// fresh channel and every release closes it.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// A reserved channel. Dropping the handle releases it like
/// [`ConnectionPool::release_connection`].
pub struct ChannelHandle {
    channel: Option<ManagedChannel>,
    pool: Weak<PoolInner>,
    pool_name: String,
}

enum Slot {
    Idle(ManagedChannel),
    Create,
}

impl ConnectionPool {
    pub fn new(
        name: impl Into<String>,
        config: PoolConfig,
        factory: impl ChannelFactory + 'static,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            name: name.into(),
            factory: Box::new(factory),
            config,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            next_channel_id: AtomicU64::new(1),
            registration: Mutex::new(None),
        });

        if inner.config.is_pooled() {
            let evictable: Weak<dyn Evictable> = Arc::downgrade(&inner) as Weak<dyn Evictable>;
            let id = eviction::register(evictable);
            *lock(&inner.registration) = Some(id);
        }
        info!(
            pool = %inner.name,
            max_open = inner.config.max_open,
            max_idle_secs = inner.config.max_idle.as_secs_f64(),
            "connection pool created"
        );
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.inner.state);
        PoolStats {
            active: state.active,
            idle: state.idle.len(),
            max_open: self.inner.config.max_open,
        }
    }

    pub fn is_registered_for_eviction(&self) -> bool {
        lock(&self.inner.registration).is_some_and(eviction::is_registered)
    }

    /// Returns an idle channel, else a new one while under capacity, else
    /// waits up to the configured acquisition timeout.
    pub fn reserve_connection(&self) -> Result<ChannelHandle, ProcError> {
        let inner = &self.inner;
        if !inner.config.is_pooled() {
            let channel = inner.open_channel()?;
            return Ok(self.handle(channel));
        }

        let deadline = Instant::now() + inner.config.max_wait;
        loop {
            match inner.claim_slot(deadline)? {
                Slot::Idle(mut channel) => match channel.activate() {
                    Ok(()) => return Ok(self.handle(channel)),
                    Err(error) => {
                        warn!(
                            pool = %inner.name,
                            channel = channel.id(),
                            %error,
                            "discarding channel that failed activation"
                        );
                        channel.close();
                        inner.free_slot();
                    }
                },
                Slot::Create => match inner.open_channel() {
                    Ok(channel) => return Ok(self.handle(channel)),
                    Err(error) => {
                        inner.free_slot();
                        return Err(error);
                    }
                },
            }
        }
    }

    /// Returns a channel to the idle set. Failures are logged and the
    /// channel is invalidated and closed; nothing is raised to the caller.
    pub fn release_connection(&self, mut handle: ChannelHandle) {
        if let Some(channel) = handle.channel.take() {
            self.inner.give_back(channel);
        }
    }

    pub fn evict(&self) -> usize {
        self.inner.evict_expired()
    }

    /// Disposes idle channels and leaves the eviction registry. Channels
    /// already reserved are closed when they come back.
    pub fn close(&self) {
        let drained = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect::<Vec<_>>()
        };
        self.inner.available.notify_all();
        if let Some(id) = lock(&self.inner.registration).take() {
            eviction::deregister(id);
        }
        let count = drained.len();
        for mut idle in drained {
            idle.channel.close();
        }
        info!(pool = %self.inner.name, closed_idle = count, "connection pool closed");
    }

    fn handle(&self, channel: ManagedChannel) -> ChannelHandle {
        ChannelHandle {
            channel: Some(channel),
            pool: Arc::downgrade(&self.inner),
            pool_name: self.inner.name.clone(),
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolInner {
    fn open_channel(&self) -> Result<ManagedChannel, ProcError> {
        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let mut channel = ManagedChannel::new(id, self.factory.create()?);
        if let Err(error) = channel.activate() {
            channel.close();
            return Err(error);
        }
        debug!(pool = %self.name, channel = id, "channel created");
        Ok(channel)
    }

    fn claim_slot(&self, deadline: Instant) -> Result<Slot, ProcError> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return Err(ProcError::channel_invalid(format!(
                    "pool \"{}\" is closed",
                    self.name
                )));
            }
            if let Some(idle) = state.idle.pop_back() {
                state.active += 1;
                return Ok(Slot::Idle(idle.channel));
            }
            if state.active < self.config.capacity() {
                state.active += 1;
                return Ok(Slot::Create);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProcError::ResourceExhausted {
                    pool: self.name.clone(),
                    waited_ms: self.config.max_wait.as_millis() as u64,
                });
            }
            state = match self.available.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn free_slot(&self) {
        let mut state = lock(&self.state);
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn give_back(&self, mut channel: ManagedChannel) {
        if !self.config.is_pooled() {
            channel.close();
            debug!(pool = %self.name, channel = channel.id(), "unpooled channel closed");
            return;
        }

        let passivated = match channel.state() {
            ChannelState::Active | ChannelState::Idle => channel.passivate(),
            state => Err(ProcError::channel_invalid(format!(
                "channel returned in state {:?}",
                state
            ))),
        };

        let mut state = lock(&self.state);
        state.active = state.active.saturating_sub(1);
        let rejected = match passivated {
            Ok(()) if !state.closed && state.idle.len() < self.config.capacity() => {
                state.idle.push_back(IdleChannel {
                    channel,
                    since: Instant::now(),
                });
                None
            }
            Ok(()) => Some(channel),
            Err(error) => {
                warn!(
                    pool = %self.name,
                    channel = channel.id(),
                    %error,
                    "channel release failed, invalidating"
                );
                channel.invalidate();
                Some(channel)
            }
        };
        drop(state);
        self.available.notify_one();

        if let Some(mut channel) = rejected {
            channel.close();
        }
    }

    fn evict_expired(&self) -> usize {
        let expired = {
            let mut state = lock(&self.state);
            let max_idle = self.config.max_idle;
            let (expired, kept): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|idle| idle.since.elapsed() > max_idle);
            state.idle = kept.into();
            expired
        };
        let count = expired.len();
        for mut idle in expired {
            debug!(pool = %self.name, channel = idle.channel.id(), "evicting idle channel");
            idle.channel.close();
        }
        count
    }
}

impl Evictable for PoolInner {
    fn name(&self) -> &str {
        &self.name
    }

    fn evict(&self) -> usize {
        self.evict_expired()
    }
}

impl ChannelHandle {
    pub fn id(&self) -> u64 {
        self.channel.as_ref().map_or(0, ManagedChannel::id)
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn state(&self) -> ChannelState {
        self.channel
            .as_ref()
            .map_or(ChannelState::Closed, ManagedChannel::state)
    }

    pub fn methods(&self) -> Option<Arc<MethodTable>> {
        self.channel.as_ref().map(ManagedChannel::methods)
    }

    pub fn managed_mut(&mut self) -> Option<&mut ManagedChannel> {
        self.channel.as_mut()
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        let Some(mut channel) = self.channel.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(pool) => pool.give_back(channel),
            None => channel.close(),
        }
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("pool", &self.pool_name)
            .field("channel", &self.channel)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
