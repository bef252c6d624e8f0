use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use pe_core::{ProcError, Value, ValueMap};

use crate::channel::Channel;

/// Lifecycle and identity methods never exposed to scripts.
pub const HIDDEN_METHODS: &[&str] = &[
    "validate",
    "activate",
    "passivate",
    "invalidate",
    "close",
    "equals",
    "hash_code",
    "to_string",
    "type_name",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    String,
    Timestamp,
    List,
    Map,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Timestamp,
    List,
    Map,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Int(_) => Self::Int,
            Value::Float(_) => Self::Float,
            Value::String(_) => Self::String,
            Value::Timestamp(_) => Self::Timestamp,
            Value::List(_) => Self::List,
            Value::Map(_) => Self::Map,
        }
    }
}

impl ParamKind {
    pub fn is_primitive(self) -> bool {
        matches!(self, Self::Bool | Self::Int)
    }

    /// Match score for one argument, `None` when it cannot bind.
    ///
    /// Primitives only take their exact kind. Reference parameters take an
    /// assignable value or null.
    pub fn score(self, arg: ValueKind) -> Option<u8> {
        match (self, arg) {
            (Self::Bool, ValueKind::Bool) | (Self::Int, ValueKind::Int) => Some(4),
            (Self::Bool | Self::Int, _) => None,
            (_, ValueKind::Null) => Some(1),
            (Self::Float, ValueKind::Float)
            | (Self::String, ValueKind::String)
            | (Self::Timestamp, ValueKind::Timestamp)
            | (Self::List, ValueKind::List)
            | (Self::Map, ValueKind::Map) => Some(4),
            (Self::Float, ValueKind::Int) => Some(3),
            (Self::Any, _) => Some(2),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "boolean",
            Self::Int => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Timestamp => "timestamp",
            Self::List => "list",
            Self::Map => "map",
        };
        f.write_str(name)
    }
}

pub struct Args<'a> {
    method: &'a str,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    pub fn new(method: &'a str, values: &'a [Value]) -> Self {
        Self { method, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    pub fn get(&self, index: usize) -> &'a Value {
        const NULL: &Value = &Value::Null;
        self.values.get(index).unwrap_or(NULL)
    }

    pub fn str(&self, index: usize) -> Result<&'a str, ProcError> {
        self.get(index)
            .as_str()
            .ok_or_else(|| self.mismatch(index, "string"))
    }

    pub fn int(&self, index: usize) -> Result<i64, ProcError> {
        self.get(index)
            .as_i64()
            .ok_or_else(|| self.mismatch(index, "integer"))
    }

    pub fn float(&self, index: usize) -> Result<f64, ProcError> {
        self.get(index)
            .as_f64()
            .ok_or_else(|| self.mismatch(index, "number"))
    }

    pub fn bool(&self, index: usize) -> Result<bool, ProcError> {
        self.get(index)
            .as_bool()
            .ok_or_else(|| self.mismatch(index, "boolean"))
    }

    pub fn list(&self, index: usize) -> Result<&'a [Value], ProcError> {
        self.get(index)
            .as_list()
            .ok_or_else(|| self.mismatch(index, "list"))
    }

    pub fn map(&self, index: usize) -> Result<&'a ValueMap, ProcError> {
        self.get(index)
            .as_map()
            .ok_or_else(|| self.mismatch(index, "map"))
    }

    fn mismatch(&self, index: usize, expected: &str) -> ProcError {
        ProcError::dispatch(
            self.method,
            format!(
                "argument {} must be {}, got {}",
                index,
                expected,
                self.get(index).type_name()
            ),
        )
    }
}

pub type MethodHandler =
    Arc<dyn Fn(&mut dyn Channel, &Args<'_>) -> Result<Value, ProcError> + Send + Sync>;

#[derive(Clone)]
pub struct MethodSpec {
    pub name: String,
    pub params: Vec<ParamKind>,
    handler: MethodHandler,
}

impl MethodSpec {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn call(&self, channel: &mut dyn Channel, args: &[Value]) -> Result<Value, ProcError> {
        (self.handler)(channel, &Args::new(&self.name, args))
    }

    fn score(&self, kinds: &[ValueKind]) -> Option<u32> {
        if self.params.len() != kinds.len() {
            return None;
        }
        let mut total = 0u32;
        for (param, kind) in self.params.iter().zip(kinds) {
            total += param.score(*kind)? as u32;
        }
        Some(total)
    }
}

impl fmt::Debug for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodSpec")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

type ResolutionKey = (String, Vec<ValueKind>);

/// Per-type method registry, built once and shared by every channel of the
/// type. Overload resolution results are cached per call-site signature.
pub struct MethodTable {
    type_name: &'static str,
    methods: IndexMap<String, Vec<MethodSpec>>,
    resolved: Mutex<HashMap<ResolutionKey, Option<usize>>>,
}

impl MethodTable {
    pub fn builder<C: Channel>() -> MethodTableBuilder<C> {
        MethodTableBuilder {
            type_name: short_type_name(type_name::<C>()),
            methods: IndexMap::new(),
            _channel: PhantomData,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Every registered method name, hidden ones included.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn exposed_methods(&self) -> Vec<String> {
        self.methods
            .keys()
            .filter(|name| !HIDDEN_METHODS.contains(&name.as_str()))
            .cloned()
            .collect()
    }

    pub fn is_exposed(&self, name: &str) -> bool {
        self.methods.contains_key(name) && !HIDDEN_METHODS.contains(&name)
    }

    pub fn overloads(&self, name: &str) -> &[MethodSpec] {
        self.methods.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn arities(&self, name: &str) -> Vec<usize> {
        let mut arities = self
            .overloads(name)
            .iter()
            .map(MethodSpec::arity)
            .collect::<Vec<_>>();
        arities.sort_unstable();
        arities.dedup();
        arities
    }

    /// Best-scoring overload for the runtime argument kinds; ties go to the
    /// first registered.
    pub fn resolve(&self, name: &str, args: &[Value]) -> Option<&MethodSpec> {
        let kinds = args.iter().map(ValueKind::of).collect::<Vec<_>>();
        let key = (name.to_string(), kinds);

        let cached = match self.resolved.lock() {
            Ok(cache) => cache.get(&key).copied(),
            Err(poisoned) => poisoned.into_inner().get(&key).copied(),
        };
        let index = match cached {
            Some(index) => index,
            None => {
                let index = self.find_best(name, &key.1);
                match self.resolved.lock() {
                    Ok(mut cache) => cache.insert(key, index),
                    Err(poisoned) => poisoned.into_inner().insert(key, index),
                };
                index
            }
        };
        index.and_then(|index| self.overloads(name).get(index))
    }

    pub fn invoke(
        &self,
        channel: &mut dyn Channel,
        name: &str,
        args: &[Value],
    ) -> Result<Value, ProcError> {
        let spec = self.resolve(name, args).ok_or_else(|| {
            ProcError::dispatch(
                name,
                format!(
                    "no overload of {}.{} accepts ({})",
                    self.type_name,
                    name,
                    args.iter()
                        .map(|arg| ValueKind::of(arg).to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )
        })?;
        spec.call(channel, args)
    }

    fn find_best(&self, name: &str, kinds: &[ValueKind]) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (index, spec) in self.overloads(name).iter().enumerate() {
            let Some(score) = spec.score(kinds) else {
                continue;
            };
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((index, score));
            }
        }
        best.map(|(index, _)| index)
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("type_name", &self.type_name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct MethodTableBuilder<C> {
    type_name: &'static str,
    methods: IndexMap<String, Vec<MethodSpec>>,
    _channel: PhantomData<fn() -> C>,
}

impl<C: Channel> MethodTableBuilder<C> {
    pub fn method<F>(self, name: &str, params: &[ParamKind], handler: F) -> Self
    where
        F: Fn(&mut C, &Args<'_>) -> Result<Value, ProcError> + Send + Sync + 'static,
    {
        let type_name = self.type_name;
        self.raw_method(
            name,
            params,
            Arc::new(move |channel: &mut dyn Channel, args: &Args<'_>| {
                let typed = channel
                    .as_any_mut()
                    .downcast_mut::<C>()
                    .ok_or_else(|| ProcError::host(format!("channel is not a {}", type_name)))?;
                handler(typed, args)
            }),
        )
    }

    /// Adds the identity methods every channel type carries. Lifecycle
    /// transitions stay with the managed channel and have no table entry.
    pub fn build(self) -> MethodTable {
        let type_name = self.type_name;
        let identity: MethodHandler = Arc::new(move |_: &mut dyn Channel, _: &Args<'_>| {
            Ok(Value::String(type_name.to_string()))
        });
        let table = self
            .raw_method("to_string", &[], Arc::clone(&identity))
            .raw_method("type_name", &[], identity);

        MethodTable {
            type_name,
            methods: table.methods,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    fn raw_method(mut self, name: &str, params: &[ParamKind], handler: MethodHandler) -> Self {
        let overloads = self.methods.entry(name.to_string()).or_default();
        if overloads.iter().any(|spec| spec.params == params) {
            return self;
        }
        overloads.push(MethodSpec {
            name: name.to_string(),
            params: params.to_vec(),
            handler,
        });
        self
    }
}

fn short_type_name(full: &'static str) -> &'static str {
    full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod methods_tests {
    use std::any::Any;

    use once_cell::sync::Lazy;

    use super::*;

    struct Ledger {
        entries: Vec<String>,
    }

    impl Channel for Ledger {
        fn close(&mut self) {}

        fn methods(&self) -> Arc<MethodTable> {
            static TABLE: Lazy<Arc<MethodTable>> = Lazy::new(|| {
                Arc::new(
                    MethodTable::builder::<Ledger>()
                        .method("put", &[ParamKind::Int], |ledger, args| {
                            ledger.entries.push(format!("int:{}", args.int(0)?));
                            Ok(Value::from("int"))
                        })
                        .method("put", &[ParamKind::Float], |ledger, args| {
                            ledger.entries.push(format!("float:{}", args.float(0)?));
                            Ok(Value::from("float"))
                        })
                        .method("put", &[ParamKind::String], |_, _| Ok(Value::from("string")))
                        .method("put", &[ParamKind::Any], |_, _| Ok(Value::from("any")))
                        .method("flag", &[ParamKind::Bool], |_, args| {
                            Ok(Value::Bool(!args.bool(0)?))
                        })
                        .method("size", &[], |ledger, _| {
                            Ok(Value::Int(ledger.entries.len() as i64))
                        })
                        .build(),
                )
            });
            Arc::clone(&TABLE)
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn ledger() -> Ledger {
        Ledger {
            entries: Vec::new(),
        }
    }

    #[test]
    fn overloads_prefer_exact_kinds() {
        let mut channel = ledger();
        let table = channel.methods();
        let call = |channel: &mut Ledger, value: Value| {
            table
                .invoke(channel, "put", &[value])
                .expect("put should dispatch")
        };
        assert_eq!(call(&mut channel, Value::Int(3)), Value::from("int"));
        assert_eq!(call(&mut channel, Value::Float(1.5)), Value::from("float"));
        assert_eq!(call(&mut channel, Value::from("x")), Value::from("string"));
        assert_eq!(call(&mut channel, Value::List(Vec::new())), Value::from("any"));
        assert_eq!(channel.entries, vec!["int:3", "float:1.5"]);
    }

    #[test]
    fn primitives_reject_null_while_references_accept_it() {
        let mut channel = ledger();
        let table = channel.methods();
        let error = table
            .invoke(&mut channel, "flag", &[Value::Null])
            .expect_err("null must not bind to boolean");
        assert_eq!(error.code(), "CALL_DISPATCH");
        assert!(error.to_string().contains("null"));

        let put = table.resolve("put", &[Value::Null]).expect("null binds");
        assert_eq!(put.params, vec![ParamKind::Float]);
        assert!(table.resolve("flag", &[Value::Int(1)]).is_none());
        assert!(table.resolve("size", &[Value::Int(1)]).is_none());
    }

    #[test]
    fn exposed_methods_hide_lifecycle_and_identity() {
        let table = ledger().methods();
        assert_eq!(table.exposed_methods(), vec!["put", "flag", "size"]);
        for hidden in ["validate", "activate", "passivate", "close", "invalidate"] {
            assert!(!table.method_names().any(|name| name == hidden));
            assert!(!table.is_exposed(hidden));
        }
        assert!(table.method_names().any(|name| name == "type_name"));
        assert_eq!(table.type_name(), "Ledger");
        assert_eq!(table.arities("put"), vec![1]);
    }

    #[test]
    fn resolution_is_cached_per_signature() {
        let table = ledger().methods();
        let first = table.resolve("put", &[Value::Int(1)]).expect("resolve") as *const MethodSpec;
        let second = table.resolve("put", &[Value::Int(2)]).expect("resolve") as *const MethodSpec;
        assert_eq!(first, second);
        let cache = table.resolved.lock().expect("cache lock");
        assert!(cache.contains_key(&("put".to_string(), vec![ValueKind::Int])));
    }
}
