use std::any::TypeId;
use std::collections::BTreeSet;
use std::sync::Arc;

use pe_core::{ProcError, Value};
use pe_pool::{MethodTable, ValueKind};
use rhai::{Array, Dynamic, Engine};

use crate::bridge::{self, script_error};
use crate::context::{CallContext, Lease};

/// Script handle for a reserved channel. Only the channel's exposed methods
/// are callable; lifecycle methods stay hidden.
#[derive(Clone)]
pub struct ConnectionProxy {
    pool: String,
    table: Arc<MethodTable>,
    lease: Lease,
    ctx: CallContext,
}

impl ConnectionProxy {
    pub(crate) fn new(pool: &str, table: Arc<MethodTable>, lease: Lease, ctx: CallContext) -> Self {
        Self {
            pool: pool.to_string(),
            table,
            lease,
            ctx,
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn methods(&self) -> Vec<String> {
        self.table.exposed_methods()
    }

    pub fn signature(&self, method: &str) -> String {
        format!("connection/{}#{}", self.pool, method)
    }

    pub fn invoke(&self, method: &str, args: Vec<Dynamic>) -> Result<Dynamic, ProcError> {
        let signature = self.signature(method);
        let values = args
            .into_iter()
            .map(bridge::unwrap)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|cause| ProcError::CallDispatch {
                method: signature.clone(),
                message: "argument has no canonical form".to_string(),
                cause: Some(Box::new(cause)),
            })?;

        self.ctx.enter(&signature)?;
        self.ctx.log_request(&signature, &values);
        let outcome = self.dispatch(&signature, method, &values);
        match &outcome {
            Ok(result) => self.ctx.log_response(result),
            Err(error) => self.ctx.log_error(error),
        }
        self.ctx.exit();
        outcome.map(bridge::wrap)
    }

    fn dispatch(
        &self,
        signature: &str,
        method: &str,
        values: &[Value],
    ) -> Result<Value, ProcError> {
        if !self.table.is_exposed(method) {
            return Err(ProcError::dispatch(
                signature,
                format!("{} is not callable on {}", method, self.table.type_name()),
            ));
        }
        let Some(spec) = self.table.resolve(method, values) else {
            let kinds = values
                .iter()
                .map(|value| ValueKind::of(value).to_string())
                .collect::<Vec<_>>();
            return Err(ProcError::dispatch(
                signature,
                format!(
                    "no overload of {}.{} accepts ({})",
                    self.table.type_name(),
                    method,
                    kinds.join(", ")
                ),
            ));
        };

        let mut lease = self.lease.borrow_mut();
        let managed = lease
            .as_mut()
            .and_then(|handle| handle.managed_mut())
            .ok_or_else(|| {
                ProcError::channel_invalid(format!("{} was already released", signature))
            })?;
        spec.call(managed.channel_mut(), values)
            .map_err(|cause| ProcError::CallDispatch {
                method: signature.to_string(),
                message: cause.to_string(),
                cause: Some(Box::new(cause)),
            })
    }
}

/// Registers script methods for every connection proxy among the bound
/// values. Each exposed method is callable with zero up to its widest
/// overload's arity so a bad argument count reaches the overload resolver.
pub(crate) fn register_methods(engine: &mut Engine, bound: &[Dynamic]) {
    let proxies = bound
        .iter()
        .filter(|value| value.is::<ConnectionProxy>())
        .map(|value| value.clone().cast::<ConnectionProxy>())
        .collect::<Vec<_>>();
    if proxies.is_empty() {
        return;
    }

    engine
        .register_type_with_name::<ConnectionProxy>("Connection")
        .register_fn("keys", |proxy: &mut ConnectionProxy| {
            proxy.methods().into_iter().map(Dynamic::from).collect::<Array>()
        })
        .register_fn("to_string", |proxy: &mut ConnectionProxy| {
            format!("connection/{}", proxy.pool())
        });

    let mut registered = BTreeSet::new();
    for proxy in &proxies {
        for method in proxy.methods() {
            let widest = proxy.table.arities(&method).into_iter().max().unwrap_or(0);
            for arity in 0..=widest {
                if registered.insert((method.clone(), arity)) {
                    register_method(engine, &method, arity);
                }
            }
        }
    }
}

#[allow(deprecated)]
fn register_method(engine: &mut Engine, method: &str, arity: usize) {
    let mut types = vec![TypeId::of::<ConnectionProxy>()];
    types.extend(std::iter::repeat(TypeId::of::<Dynamic>()).take(arity));
    let name = method.to_string();
    engine.register_raw_fn(method, types, move |_, args| {
        let proxy = args[0].clone().cast::<ConnectionProxy>();
        let values = args.iter().skip(1).map(|arg| (**arg).clone()).collect();
        proxy.invoke(&name, values).map_err(script_error)
    });
}
