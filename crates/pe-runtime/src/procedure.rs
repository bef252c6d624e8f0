use std::any::TypeId;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use pe_core::{Binding, BindingKind, ProcError, ProcedureDef, Value, ValueMap, SOURCE_BINDING};
use rhai::{Dynamic, Engine};
use tracing::debug;

use crate::bridge::{self, script_error};
use crate::context::CallContext;
use crate::library::{CallArgs, Library};
use crate::script::{self, CompiledProcedure};

pub trait NativeProcedure {
    fn call(&self, ctx: &CallContext, args: &ValueMap) -> Result<Value, ProcError>;
}

impl<F> NativeProcedure for F
where
    F: Fn(&CallContext, &ValueMap) -> Result<Value, ProcError>,
{
    fn call(&self, ctx: &CallContext, args: &ValueMap) -> Result<Value, ProcError> {
        self(ctx, args)
    }
}

enum Body {
    Script {
        compiled: RefCell<Option<Rc<CompiledProcedure>>>,
    },
    Native(Rc<dyn NativeProcedure>),
}

/// A named procedure with its bindings. Script bodies are compiled on first
/// use and recompiled after the source binding changes.
pub struct Procedure {
    id: String,
    def: RefCell<ProcedureDef>,
    body: Body,
}

impl Procedure {
    pub fn script(def: ProcedureDef) -> Result<Self, ProcError> {
        if !def.is_script() {
            return Err(ProcError::configuration(
                &def.id,
                format!("script procedure needs a \"{}\" data binding", SOURCE_BINDING),
            ));
        }
        Ok(Self {
            id: def.id.clone(),
            def: RefCell::new(def),
            body: Body::Script {
                compiled: RefCell::new(None),
            },
        })
    }

    pub fn native(def: ProcedureDef, implementation: impl NativeProcedure + 'static) -> Self {
        Self {
            id: def.id.clone(),
            def: RefCell::new(def),
            body: Body::Native(Rc::new(implementation)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> String {
        self.def.borrow().description.clone()
    }

    pub fn is_script(&self) -> bool {
        matches!(self.body, Body::Script { .. })
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.def.borrow().bindings.clone()
    }

    pub fn definition(&self) -> ProcedureDef {
        self.def.borrow().clone()
    }

    /// Names passed to the compiled script function, in binding order.
    pub fn script_arg_names(&self) -> Vec<String> {
        self.def
            .borrow()
            .bindings
            .iter()
            .filter(|binding| binding.name != SOURCE_BINDING)
            .map(|binding| binding.name.clone())
            .collect()
    }

    pub fn argument_count(&self) -> usize {
        self.def.borrow().arguments().count()
    }

    pub fn source(&self) -> Option<String> {
        self.def
            .borrow()
            .binding(SOURCE_BINDING)
            .and_then(|binding| binding.value.as_ref())
            .and_then(|value| value.as_str().map(str::to_string))
    }

    /// Replaces a binding's value. Changing the source drops the compiled
    /// form.
    pub fn set_binding_value(&self, name: &str, value: Option<Value>) -> Result<(), ProcError> {
        {
            let mut def = self.def.borrow_mut();
            let binding = def
                .bindings
                .iter_mut()
                .find(|binding| binding.name == name)
                .ok_or_else(|| ProcError::not_found("binding", format!("{}.{}", self.id, name)))?;
            binding.value = value;
        }
        if name == SOURCE_BINDING {
            if let Body::Script { compiled } = &self.body {
                compiled.borrow_mut().take();
                debug!(procedure = %self.id, "source changed, compiled form dropped");
            }
        }
        Ok(())
    }

    pub fn is_compiled(&self) -> bool {
        match &self.body {
            Body::Script { compiled } => compiled.borrow().is_some(),
            Body::Native(_) => false,
        }
    }

    pub fn compiled(&self) -> Result<Rc<CompiledProcedure>, ProcError> {
        let Body::Script { compiled } = &self.body else {
            return Err(ProcError::configuration(&self.id, "native procedures have no script"));
        };
        if let Some(existing) = compiled.borrow().as_ref() {
            return Ok(Rc::clone(existing));
        }
        let source = self.source().ok_or_else(|| {
            ProcError::configuration(
                &self.id,
                format!("\"{}\" binding must hold text", SOURCE_BINDING),
            )
        })?;
        let fresh = Rc::new(script::compile(&self.id, &self.script_arg_names(), &source)?);
        *compiled.borrow_mut() = Some(Rc::clone(&fresh));
        Ok(fresh)
    }

    pub(crate) fn native_body(&self) -> Option<Rc<dyn NativeProcedure>> {
        match &self.body {
            Body::Native(implementation) => Some(Rc::clone(implementation)),
            Body::Script { .. } => None,
        }
    }

    pub(crate) fn argument_bindings(&self) -> Vec<Binding> {
        self.def
            .borrow()
            .bindings
            .iter()
            .filter(|binding| binding.kind == BindingKind::Argument)
            .cloned()
            .collect()
    }
}

/// Script handle for a procedure binding. Calling it runs the target
/// procedure as a nested call in the same context.
#[derive(Clone)]
pub struct ProcedureProxy {
    library: Library,
    procedure: Rc<Procedure>,
    ctx: CallContext,
}

impl ProcedureProxy {
    pub(crate) fn new(library: Library, procedure: Rc<Procedure>, ctx: CallContext) -> Self {
        Self {
            library,
            procedure,
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        self.procedure.id()
    }

    pub fn call(&self, args: Vec<Dynamic>) -> Result<Dynamic, ProcError> {
        let args = if self.procedure.is_script() {
            CallArgs::Wrapped(args)
        } else {
            CallArgs::Canonical(
                args.into_iter()
                    .map(bridge::unwrap)
                    .collect::<Result<Vec<_>, _>>()?,
            )
        };
        self.library
            .call_procedure(&self.ctx, &self.procedure, args)
            .map(script::CallResult::into_dynamic)
    }
}

/// Registers a script function for every procedure binding among the bound
/// values, plus an `invoke` method on the handles themselves.
pub(crate) fn register_calls(engine: &mut Engine, names: &[String], bound: &[Dynamic]) {
    let proxies = names
        .iter()
        .zip(bound)
        .filter(|(_, value)| value.is::<ProcedureProxy>())
        .map(|(name, value)| (name.clone(), value.clone().cast::<ProcedureProxy>()))
        .collect::<Vec<_>>();
    if proxies.is_empty() {
        return;
    }

    engine
        .register_type_with_name::<ProcedureProxy>("Procedure")
        .register_fn("to_string", |proxy: &mut ProcedureProxy| {
            format!("procedure/{}", proxy.id())
        });

    let mut invoke_arities = BTreeSet::new();
    for (name, proxy) in &proxies {
        let arity = proxy.procedure.argument_count();
        for count in 0..=arity {
            register_direct_call(engine, name, count, proxy.clone());
            invoke_arities.insert(count);
        }
    }
    for count in invoke_arities {
        register_invoke(engine, count);
    }
}

#[allow(deprecated)]
fn register_direct_call(engine: &mut Engine, name: &str, arity: usize, proxy: ProcedureProxy) {
    let types = vec![TypeId::of::<Dynamic>(); arity];
    engine.register_raw_fn(name, types, move |_, args| {
        let values = args.iter().map(|arg| (**arg).clone()).collect();
        proxy.call(values).map_err(script_error)
    });
}

#[allow(deprecated)]
fn register_invoke(engine: &mut Engine, arity: usize) {
    let mut types = vec![TypeId::of::<ProcedureProxy>()];
    types.extend(std::iter::repeat(TypeId::of::<Dynamic>()).take(arity));
    engine.register_raw_fn("invoke", types, move |_, args| {
        let proxy = args[0].clone().cast::<ProcedureProxy>();
        let values = args.iter().skip(1).map(|arg| (**arg).clone()).collect();
        proxy.call(values).map_err(script_error)
    });
}

#[cfg(test)]
mod procedure_tests {
    use super::*;

    fn adder() -> ProcedureDef {
        ProcedureDef::new(
            "math.add",
            vec![
                Binding::data(SOURCE_BINDING, "return a + b;"),
                Binding::argument("a"),
                Binding::argument_with_default("b", 1),
            ],
        )
    }

    #[test]
    fn script_procedures_require_source() {
        let def = ProcedureDef::new("empty", vec![Binding::argument("a")]);
        let error = Procedure::script(def).err().expect("missing source");
        assert_eq!(error.code(), "POOL_CONFIG");
    }

    #[test]
    fn compiled_form_is_cached_until_source_changes() {
        let procedure = Procedure::script(adder()).expect("procedure");
        assert!(!procedure.is_compiled());
        let first = procedure.compiled().expect("compile");
        let second = procedure.compiled().expect("cached");
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(first.arg_names(), ["a".to_string(), "b".to_string()]);

        procedure
            .set_binding_value(SOURCE_BINDING, Some(Value::from("return a * b;")))
            .expect("update source");
        assert!(!procedure.is_compiled());
        let third = procedure.compiled().expect("recompile");
        assert!(!Rc::ptr_eq(&first, &third));
    }

    #[test]
    fn other_binding_changes_keep_the_compiled_form() {
        let procedure = Procedure::script(adder()).expect("procedure");
        procedure.compiled().expect("compile");
        procedure
            .set_binding_value("b", Some(Value::Int(5)))
            .expect("update default");
        assert!(procedure.is_compiled());
        let error = procedure
            .set_binding_value("missing", None)
            .expect_err("unknown binding");
        assert_eq!(error.code(), "NOT_FOUND");
    }

    #[test]
    fn native_procedures_have_no_script() {
        let procedure = Procedure::native(
            ProcedureDef::new("system.now", Vec::new()),
            |_: &CallContext, _: &ValueMap| -> Result<Value, ProcError> { Ok(Value::Int(0)) },
        );
        assert!(!procedure.is_script());
        assert!(procedure.compiled().is_err());
        assert!(procedure.native_body().is_some());
    }
}
