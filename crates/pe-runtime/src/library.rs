use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use pe_core::{Binding, BindingKind, ProcError, ProcedureDef, Value, ValueMap, SOURCE_BINDING};
use pe_pool::ConnectionPool;
use rhai::Dynamic;
use tracing::{debug, warn};

use crate::bridge;
use crate::connection::ConnectionProxy;
use crate::context::{CallContext, CallOptions, LogEntry};
use crate::procedure::{NativeProcedure, Procedure, ProcedureProxy};
use crate::script::{self, CallResult};

/// Positional call arguments. Scripts calling scripts pass their values
/// through untouched; everything else passes canonical values.
pub enum CallArgs {
    Canonical(Vec<Value>),
    Wrapped(Vec<Dynamic>),
}

impl CallArgs {
    fn len(&self) -> usize {
        match self {
            Self::Canonical(values) => values.len(),
            Self::Wrapped(values) => values.len(),
        }
    }

    fn log_values(&self) -> Vec<Value> {
        match self {
            Self::Canonical(values) => values.clone(),
            Self::Wrapped(values) => values
                .iter()
                .map(|value| bridge::unwrap(value.clone()).unwrap_or(Value::Null))
                .collect(),
        }
    }

    fn into_dynamics(self) -> Vec<Option<Dynamic>> {
        match self {
            Self::Canonical(values) => values.into_iter().map(|v| Some(bridge::wrap(v))).collect(),
            Self::Wrapped(values) => values.into_iter().map(Some).collect(),
        }
    }

    fn into_values(self) -> Result<Vec<Value>, ProcError> {
        match self {
            Self::Canonical(values) => Ok(values),
            Self::Wrapped(values) => values.into_iter().map(bridge::unwrap).collect(),
        }
    }
}

#[derive(Debug)]
pub struct Invocation {
    pub result: Result<Value, ProcError>,
    pub log: Vec<LogEntry>,
}

#[derive(Default)]
struct LibraryInner {
    procedures: RefCell<IndexMap<String, Rc<Procedure>>>,
    pools: RefCell<IndexMap<String, ConnectionPool>>,
    options: RefCell<CallOptions>,
}

/// Registry of procedures and connection pools, and the entry point for
/// calling procedures. Clones share the same registry.
#[derive(Clone, Default)]
pub struct Library {
    inner: Rc<LibraryInner>,
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: CallOptions) -> Self {
        let library = Self::new();
        *library.inner.options.borrow_mut() = options;
        library
    }

    pub fn options(&self) -> CallOptions {
        self.inner.options.borrow().clone()
    }

    pub fn add_procedure(&self, procedure: Procedure) -> Rc<Procedure> {
        let procedure = Rc::new(procedure);
        let replaced = self
            .inner
            .procedures
            .borrow_mut()
            .insert(procedure.id().to_string(), Rc::clone(&procedure));
        if replaced.is_some() {
            debug!(procedure = procedure.id(), "procedure replaced");
        }
        procedure
    }

    pub fn add_script(&self, def: ProcedureDef) -> Result<Rc<Procedure>, ProcError> {
        Ok(self.add_procedure(Procedure::script(def)?))
    }

    pub fn add_native(
        &self,
        def: ProcedureDef,
        implementation: impl NativeProcedure + 'static,
    ) -> Rc<Procedure> {
        self.add_procedure(Procedure::native(def, implementation))
    }

    pub fn remove_procedure(&self, id: &str) -> Option<Rc<Procedure>> {
        self.inner.procedures.borrow_mut().shift_remove(id)
    }

    pub fn procedure(&self, id: &str) -> Result<Rc<Procedure>, ProcError> {
        self.inner
            .procedures
            .borrow()
            .get(id)
            .cloned()
            .ok_or_else(|| ProcError::not_found("procedure", id))
    }

    pub fn procedure_ids(&self) -> Vec<String> {
        self.inner.procedures.borrow().keys().cloned().collect()
    }

    pub fn add_pool(&self, pool: ConnectionPool) {
        let name = pool.name().to_string();
        if let Some(previous) = self.inner.pools.borrow_mut().insert(name, pool) {
            previous.close();
        }
    }

    pub fn pool(&self, name: &str) -> Result<ConnectionPool, ProcError> {
        self.inner
            .pools
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| ProcError::not_found("connection pool", name))
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.inner.pools.borrow().keys().cloned().collect()
    }

    pub fn close_pools(&self) {
        let pools = std::mem::take(&mut *self.inner.pools.borrow_mut());
        for pool in pools.into_values() {
            pool.close();
        }
    }

    pub fn compile_all(&self) -> Vec<(String, ProcError)> {
        let procedures = self.inner.procedures.borrow().values().cloned().collect::<Vec<_>>();
        procedures
            .into_iter()
            .filter(|procedure| procedure.is_script())
            .filter_map(|procedure| {
                procedure
                    .compiled()
                    .err()
                    .map(|error| (procedure.id().to_string(), error))
            })
            .collect()
    }

    pub fn invoke(&self, id: &str, args: Vec<Value>) -> Invocation {
        let ctx = CallContext::open(self.options());
        let result = self.call(&ctx, id, args);
        Invocation {
            result,
            log: ctx.close(),
        }
    }

    pub fn invoke_named(&self, id: &str, args: ValueMap) -> Invocation {
        let ctx = CallContext::open(self.options());
        let result = self.call_named(&ctx, id, args);
        Invocation {
            result,
            log: ctx.close(),
        }
    }

    pub fn call(&self, ctx: &CallContext, id: &str, args: Vec<Value>) -> Result<Value, ProcError> {
        let outcome = self
            .procedure(id)
            .and_then(|procedure| self.call_procedure(ctx, &procedure, CallArgs::Canonical(args)))
            .and_then(CallResult::into_value);
        if let Err(error) = &outcome {
            warn!(
                procedure = id,
                code = error.code(),
                causes = ?error.cause_chain(),
                "procedure call failed"
            );
        }
        outcome
    }

    pub fn call_named(
        &self,
        ctx: &CallContext,
        id: &str,
        args: ValueMap,
    ) -> Result<Value, ProcError> {
        let procedure = self.procedure(id)?;
        let mut args = args;
        let mut positional = Vec::new();
        for binding in procedure.argument_bindings() {
            match args.shift_remove(&binding.name) {
                Some(value) => positional.push(value),
                None => match &binding.value {
                    Some(default) => positional.push(default.clone()),
                    None => return Err(missing_argument(id, &binding.name)),
                },
            }
        }
        if let Some((unknown, _)) = args.first() {
            return Err(ProcError::InvalidArgument {
                procedure: id.to_string(),
                message: format!("unknown argument \"{}\"", unknown),
            });
        }
        self.call(ctx, id, positional)
    }

    /// Runs a procedure as one call frame: enter, log the request, run,
    /// log the response or error, exit.
    pub(crate) fn call_procedure(
        &self,
        ctx: &CallContext,
        procedure: &Rc<Procedure>,
        args: CallArgs,
    ) -> Result<CallResult, ProcError> {
        let signature = format!("procedure/{}", procedure.id());
        ctx.enter(&signature)?;
        ctx.log_request(&signature, &args.log_values());
        let outcome = self.run(ctx, procedure, args);
        match &outcome {
            Ok(result) => ctx.log_response(&result.log_value()),
            Err(error) => ctx.log_error(error),
        }
        ctx.exit();
        outcome
    }

    fn run(
        &self,
        ctx: &CallContext,
        procedure: &Rc<Procedure>,
        args: CallArgs,
    ) -> Result<CallResult, ProcError> {
        if let Some(native) = procedure.native_body() {
            let values = self.native_args(procedure, args)?;
            let result = native.call(ctx, &values).map_err(|cause| ProcError::CallDispatch {
                method: format!("procedure/{}", procedure.id()),
                message: cause.to_string(),
                cause: Some(Box::new(cause)),
            })?;
            return Ok(if ctx.depth() <= 1 {
                CallResult::Value(result)
            } else {
                CallResult::Wrapped(bridge::wrap(result))
            });
        }

        let compiled = procedure.compiled()?;
        let bound = self.bind(ctx, procedure, args)?;
        script::execute(&compiled, bound, ctx)
    }

    /// Resolves every non-source binding to its script value, in binding
    /// order.
    fn bind(
        &self,
        ctx: &CallContext,
        procedure: &Procedure,
        args: CallArgs,
    ) -> Result<Vec<Dynamic>, ProcError> {
        let id = procedure.id();
        let argument_count = procedure.argument_count();
        if args.len() > argument_count {
            return Err(too_many_arguments(id, argument_count, args.len()));
        }
        let mut args = args.into_dynamics().into_iter();

        let mut bound = Vec::new();
        for binding in procedure.bindings() {
            if binding.name == SOURCE_BINDING {
                continue;
            }
            let value = match binding.kind {
                BindingKind::Data => {
                    bridge::wrap_sealed(binding.value.clone().unwrap_or(Value::Null))
                }
                BindingKind::Argument => match args.next().flatten() {
                    Some(value) => value,
                    None => bridge::wrap(default_argument(id, &binding)?),
                },
                BindingKind::Connection => Dynamic::from(self.bind_connection(ctx, id, &binding)?),
                BindingKind::Procedure => {
                    let target = self.procedure(reference(id, &binding)?)?;
                    Dynamic::from(ProcedureProxy::new(self.clone(), target, ctx.clone()))
                }
            };
            bound.push(value);
        }
        Ok(bound)
    }

    fn bind_connection(
        &self,
        ctx: &CallContext,
        id: &str,
        binding: &Binding,
    ) -> Result<ConnectionProxy, ProcError> {
        let pool_name = reference(id, binding)?;
        let pool = self.pool(pool_name)?;
        let (lease, table) = ctx.lease(&pool)?;
        Ok(ConnectionProxy::new(pool_name, table, lease, ctx.clone()))
    }

    fn native_args(&self, procedure: &Procedure, args: CallArgs) -> Result<ValueMap, ProcError> {
        let id = procedure.id();
        let argument_count = procedure.argument_count();
        if args.len() > argument_count {
            return Err(too_many_arguments(id, argument_count, args.len()));
        }
        let mut args = args.into_values()?.into_iter();

        let mut values = ValueMap::new();
        for binding in procedure.bindings() {
            let value = match binding.kind {
                BindingKind::Data => binding.value.clone().unwrap_or(Value::Null),
                BindingKind::Argument => match args.next() {
                    Some(value) => value,
                    None => default_argument(id, &binding)?,
                },
                BindingKind::Connection | BindingKind::Procedure => continue,
            };
            values.insert(binding.name.clone(), value);
        }
        Ok(values)
    }
}

fn reference<'a>(id: &str, binding: &'a Binding) -> Result<&'a str, ProcError> {
    binding.reference().ok_or_else(|| ProcError::InvalidArgument {
        procedure: id.to_string(),
        message: format!(
            "{} binding \"{}\" has no target name",
            binding.kind.as_str(),
            binding.name
        ),
    })
}

fn default_argument(id: &str, binding: &Binding) -> Result<Value, ProcError> {
    binding
        .value
        .clone()
        .ok_or_else(|| missing_argument(id, &binding.name))
}

fn missing_argument(id: &str, name: &str) -> ProcError {
    ProcError::InvalidArgument {
        procedure: id.to_string(),
        message: format!("missing argument \"{}\"", name),
    }
}

fn too_many_arguments(id: &str, expected: usize, got: usize) -> ProcError {
    ProcError::InvalidArgument {
        procedure: id.to_string(),
        message: format!("expected at most {} arguments, got {}", expected, got),
    }
}
