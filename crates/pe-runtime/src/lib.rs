pub mod bridge;
pub mod connection;
pub mod context;
pub mod library;
pub mod procedure;
pub mod script;


pub use bridge::{is_wrapped, unwrap, wrap, wrap_sealed, EpochMillis, ListProxy, MapProxy};
pub use connection::ConnectionProxy;
pub use context::{CallContext, CallOptions, LogEntry, DEFAULT_MAX_DEPTH};
pub use library::{CallArgs, Invocation, Library};
pub use procedure::{NativeProcedure, Procedure, ProcedureProxy};
pub use script::{
    compile, execute, CallResult, CompiledProcedure, HostFailure, LEGACY_RETURN_WARNING,
};
