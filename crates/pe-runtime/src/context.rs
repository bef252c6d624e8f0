use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use pe_core::{ProcError, Value};
use pe_pool::{ChannelHandle, ConnectionPool, MethodTable};
use tracing::{debug, info};

pub const DEFAULT_MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOptions {
    pub max_depth: usize,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// One audit record. `depth` is the call stack depth when it was written.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Request {
        depth: usize,
        signature: String,
        args: Vec<Value>,
    },
    Response {
        depth: usize,
        signature: String,
        result: Value,
    },
    Error {
        depth: usize,
        signature: String,
        causes: Vec<String>,
    },
    Message {
        depth: usize,
        signature: String,
        text: String,
    },
}

impl LogEntry {
    pub fn depth(&self) -> usize {
        match self {
            Self::Request { depth, .. }
            | Self::Response { depth, .. }
            | Self::Error { depth, .. }
            | Self::Message { depth, .. } => *depth,
        }
    }

    pub fn signature(&self) -> &str {
        match self {
            Self::Request { signature, .. }
            | Self::Response { signature, .. }
            | Self::Error { signature, .. }
            | Self::Message { signature, .. } => signature,
        }
    }
}

/// Shared slot for a reserved channel. Emptied once the lease is released.
pub(crate) type Lease = Rc<RefCell<Option<ChannelHandle>>>;

struct ContextInner {
    options: CallOptions,
    stack: RefCell<Vec<String>>,
    log: RefCell<Vec<LogEntry>>,
    leases: RefCell<Vec<(ConnectionPool, Lease)>>,
    closed: Cell<bool>,
}

/// State of one top-level invocation: the call stack, the audit log and
/// the channels reserved on its behalf. Clones share the same state.
#[derive(Clone)]
pub struct CallContext {
    inner: Rc<ContextInner>,
}

impl CallContext {
    pub fn open(options: CallOptions) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                options,
                stack: RefCell::new(Vec::new()),
                log: RefCell::new(Vec::new()),
                leases: RefCell::new(Vec::new()),
                closed: Cell::new(false),
            }),
        }
    }

    pub fn options(&self) -> &CallOptions {
        &self.inner.options
    }

    pub fn depth(&self) -> usize {
        self.inner.stack.borrow().len()
    }

    pub fn current(&self) -> Option<String> {
        self.inner.stack.borrow().last().cloned()
    }

    pub fn stack(&self) -> Vec<String> {
        self.inner.stack.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn enter(&self, signature: &str) -> Result<(), ProcError> {
        if self.is_closed() {
            return Err(ProcError::dispatch(signature, "call context is closed"));
        }
        let mut stack = self.inner.stack.borrow_mut();
        if stack.len() >= self.inner.options.max_depth {
            return Err(ProcError::dispatch(
                signature,
                format!("call depth limit of {} exceeded", self.inner.options.max_depth),
            ));
        }
        stack.push(signature.to_string());
        Ok(())
    }

    pub fn exit(&self) {
        self.inner.stack.borrow_mut().pop();
    }

    pub fn log_request(&self, signature: &str, args: &[Value]) {
        let depth = self.depth();
        debug!(depth, signature, args = args.len(), "call request");
        self.push(LogEntry::Request {
            depth,
            signature: signature.to_string(),
            args: args.to_vec(),
        });
    }

    pub fn log_response(&self, result: &Value) {
        let depth = self.depth();
        let signature = self.current().unwrap_or_default();
        debug!(depth, signature = %signature, result = result.type_name(), "call response");
        self.push(LogEntry::Response {
            depth,
            signature,
            result: result.clone(),
        });
    }

    pub fn log_error(&self, error: &ProcError) {
        let depth = self.depth();
        let signature = self.current().unwrap_or_default();
        debug!(depth, signature = %signature, code = error.code(), error = %error, "call failed");
        self.push(LogEntry::Error {
            depth,
            signature,
            causes: error.cause_chain(),
        });
    }

    pub fn log_message(&self, text: &str) {
        let depth = self.depth();
        let signature = self.current().unwrap_or_default();
        info!(depth, signature = %signature, "{}", text);
        self.push(LogEntry::Message {
            depth,
            signature,
            text: text.to_string(),
        });
    }

    fn push(&self, entry: LogEntry) {
        self.inner.log.borrow_mut().push(entry);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.log.borrow().clone()
    }

    pub fn lease_count(&self) -> usize {
        self.inner
            .leases
            .borrow()
            .iter()
            .filter(|(_, lease)| lease.borrow().is_some())
            .count()
    }

    /// The channel this context holds from `pool`, reserving one on first
    /// use. Every binding to the same pool within a context shares it.
    pub(crate) fn lease(
        &self,
        pool: &ConnectionPool,
    ) -> Result<(Lease, Arc<MethodTable>), ProcError> {
        if self.is_closed() {
            return Err(ProcError::channel_invalid("call context is closed"));
        }
        let existing = self
            .inner
            .leases
            .borrow()
            .iter()
            .find(|(held, lease)| held.name() == pool.name() && lease.borrow().is_some())
            .map(|(_, lease)| Rc::clone(lease));
        if let Some(lease) = existing {
            let table = lease.borrow().as_ref().and_then(ChannelHandle::methods);
            if let Some(table) = table {
                return Ok((lease, table));
            }
        }

        let handle = pool.reserve_connection()?;
        let table = handle.methods().ok_or_else(|| {
            ProcError::channel_invalid(format!("pool \"{}\" returned an empty handle", pool.name()))
        })?;
        Ok((self.track_lease(pool, handle), table))
    }

    pub(crate) fn track_lease(&self, pool: &ConnectionPool, handle: ChannelHandle) -> Lease {
        let lease = Rc::new(RefCell::new(Some(handle)));
        self.inner
            .leases
            .borrow_mut()
            .push((pool.clone(), Rc::clone(&lease)));
        lease
    }

    /// Releases every channel still reserved by this context and returns
    /// the audit log. Further calls through the context are refused.
    pub fn close(&self) -> Vec<LogEntry> {
        if !self.inner.closed.replace(true) {
            let leases = std::mem::take(&mut *self.inner.leases.borrow_mut());
            for (pool, lease) in leases {
                if let Some(handle) = lease.borrow_mut().take() {
                    pool.release_connection(handle);
                }
            }
        }
        self.entries()
    }
}

#[cfg(test)]
mod context_tests {
    use super::*;

    #[test]
    fn enter_and_exit_track_depth() {
        let ctx = CallContext::open(CallOptions::default());
        assert_eq!(ctx.depth(), 0);
        ctx.enter("procedure/outer").expect("enter outer");
        ctx.enter("procedure/inner").expect("enter inner");
        assert_eq!(ctx.depth(), 2);
        assert_eq!(ctx.current().as_deref(), Some("procedure/inner"));
        ctx.exit();
        assert_eq!(ctx.stack(), vec!["procedure/outer".to_string()]);
    }

    #[test]
    fn depth_limit_is_enforced() {
        let ctx = CallContext::open(CallOptions { max_depth: 2 });
        ctx.enter("a").expect("first");
        ctx.enter("b").expect("second");
        let error = ctx.enter("c").expect_err("third");
        assert_eq!(error.code(), "CALL_DISPATCH");
        assert!(error.to_string().contains("depth limit"));
    }

    #[test]
    fn log_entries_record_depth_and_signature() {
        let ctx = CallContext::open(CallOptions::default());
        ctx.enter("procedure/p").expect("enter");
        ctx.log_request("procedure/p", &[Value::Int(1)]);
        ctx.log_message("hello");
        ctx.log_error(&ProcError::host("boom"));
        ctx.log_response(&Value::Bool(true));
        ctx.exit();

        let entries = ctx.close();
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|entry| entry.depth() == 1));
        assert!(entries.iter().all(|entry| entry.signature() == "procedure/p"));
        assert_eq!(
            entries[2],
            LogEntry::Error {
                depth: 1,
                signature: "procedure/p".to_string(),
                causes: vec!["boom".to_string()],
            }
        );
    }

    #[test]
    fn closed_context_refuses_new_calls() {
        let ctx = CallContext::open(CallOptions::default());
        ctx.close();
        assert!(ctx.is_closed());
        assert!(ctx.enter("procedure/late").is_err());
    }
}
