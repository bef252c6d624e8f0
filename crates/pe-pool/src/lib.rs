pub mod channel;
pub mod config;
pub mod eviction;
pub mod methods;
pub mod pool;

pub use channel::{Channel, ChannelFactory, ChannelState, ManagedChannel};
pub use config::{
    PoolConfig, DEFAULT_MAX_IDLE_SECS, DEFAULT_MAX_OPEN, DEFAULT_MAX_WAIT_MILLIS,
};
pub use eviction::{sweep_now, Evictable, SWEEP_INTERVAL};
pub use methods::{
    Args, MethodSpec, MethodTable, MethodTableBuilder, ParamKind, ValueKind, HIDDEN_METHODS,
};
pub use pool::{ChannelHandle, ConnectionPool, PoolStats};
