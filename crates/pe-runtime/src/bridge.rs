use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use pe_core::{ProcError, Value, ValueMap};
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Position, FLOAT, INT};

pub const LIST_TYPE: &str = "ListProxy";
pub const MAP_TYPE: &str = "MapProxy";
pub const TIMESTAMP_TYPE: &str = "Timestamp";

/// Script-side timestamp, milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EpochMillis(pub i64);

impl EpochMillis {
    pub fn millis(&mut self) -> INT {
        self.0
    }
}

enum Slot {
    Canonical(Value),
    Script(Dynamic),
    /// The canonical value has moved into the cache entry for this slot.
    Cached,
}

struct ListState {
    slots: Vec<Slot>,
    cache: HashMap<usize, Dynamic>,
    sealed: bool,
}

struct MapState {
    slots: IndexMap<String, Slot>,
    cache: HashMap<String, Dynamic>,
    sealed: bool,
}

/// Lazy script view over a canonical list. Elements are wrapped on first
/// read and the wrapped element is reused until its slot is overwritten.
#[derive(Clone)]
pub struct ListProxy {
    state: Rc<RefCell<ListState>>,
}

/// Lazy script view over a canonical map, preserving insertion order.
#[derive(Clone)]
pub struct MapProxy {
    state: Rc<RefCell<MapState>>,
}

fn read_slot<K>(slot: &mut Slot, cache: &mut HashMap<K, Dynamic>, key: K, sealed: bool) -> Dynamic
where
    K: std::hash::Hash + Eq,
{
    match slot {
        Slot::Script(value) => value.clone(),
        Slot::Cached => cache.get(&key).cloned().unwrap_or(Dynamic::UNIT),
        Slot::Canonical(_) => {
            let Slot::Canonical(value) = std::mem::replace(slot, Slot::Cached) else {
                return Dynamic::UNIT;
            };
            let wrapped = wrap_value(value, sealed);
            cache.insert(key, wrapped.clone());
            wrapped
        }
    }
}

fn sealed_error(type_name: &str) -> Box<EvalAltResult> {
    format!("{} is read-only", type_name).into()
}

/// The engine writes a property back through its setter after calling a
/// method on it. A sealed proxy accepts such a write when nothing changed.
fn is_write_back(current: &Dynamic, new: &Dynamic) -> bool {
    if current.is::<ListProxy>() && new.is::<ListProxy>() {
        return current
            .clone()
            .cast::<ListProxy>()
            .ptr_eq(&new.clone().cast::<ListProxy>());
    }
    if current.is::<MapProxy>() && new.is::<MapProxy>() {
        return current
            .clone()
            .cast::<MapProxy>()
            .ptr_eq(&new.clone().cast::<MapProxy>());
    }
    if current.is::<EpochMillis>() && new.is::<EpochMillis>() {
        return current.clone().cast::<EpochMillis>() == new.clone().cast::<EpochMillis>();
    }
    let scalar = current.is_unit()
        || current.is_bool()
        || current.is_int()
        || current.is_float()
        || current.is_char()
        || current.is_string();
    scalar && current.type_id() == new.type_id() && current.to_string() == new.to_string()
}

fn shift(stamp: EpochMillis, delta: INT) -> Result<EpochMillis, Box<EvalAltResult>> {
    stamp
        .0
        .checked_add(delta)
        .map(EpochMillis)
        .ok_or_else(|| format!("timestamp {} shifted by {} overflows", stamp.0, delta).into())
}

impl ListProxy {
    pub fn new(values: Vec<Value>) -> Self {
        Self::build(values, false)
    }

    pub fn sealed(values: Vec<Value>) -> Self {
        Self::build(values, true)
    }

    fn build(values: Vec<Value>, sealed: bool) -> Self {
        Self {
            state: Rc::new(RefCell::new(ListState {
                slots: values.into_iter().map(Slot::Canonical).collect(),
                cache: HashMap::new(),
                sealed,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.state.borrow().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.state.borrow().sealed
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    /// Element at `index`, or unit for a negative or out-of-range index.
    pub fn get(&self, index: INT) -> Dynamic {
        let Ok(index) = usize::try_from(index) else {
            return Dynamic::UNIT;
        };
        let mut state = self.state.borrow_mut();
        let ListState {
            slots,
            cache,
            sealed,
        } = &mut *state;
        match slots.get_mut(index) {
            Some(slot) => read_slot(slot, cache, index, *sealed),
            None => Dynamic::UNIT,
        }
    }

    /// Stores a script value at `index`, growing the list with nulls when
    /// the index is past the end.
    pub fn set(&self, index: INT, value: Dynamic) -> Result<(), Box<EvalAltResult>> {
        if self.is_sealed() {
            let in_range = usize::try_from(index).map_or(false, |slot| slot < self.len());
            if in_range && is_write_back(&self.get(index), &value.flatten()) {
                return Ok(());
            }
            return Err(sealed_error(LIST_TYPE));
        }
        let mut state = self.state.borrow_mut();
        let index = usize::try_from(index)
            .map_err(|_| Box::<EvalAltResult>::from(format!("list index {} is negative", index)))?;
        while state.slots.len() <= index {
            state.slots.push(Slot::Canonical(Value::Null));
        }
        state.slots[index] = Slot::Script(value.flatten());
        state.cache.remove(&index);
        Ok(())
    }

    pub fn push(&self, value: Dynamic) -> Result<(), Box<EvalAltResult>> {
        let mut state = self.state.borrow_mut();
        if state.sealed {
            return Err(sealed_error(LIST_TYPE));
        }
        state.slots.push(Slot::Script(value.flatten()));
        Ok(())
    }

    pub fn set_len(&self, len: INT) -> Result<(), Box<EvalAltResult>> {
        let mut state = self.state.borrow_mut();
        if state.sealed {
            return Err(sealed_error(LIST_TYPE));
        }
        let len = usize::try_from(len)
            .map_err(|_| Box::<EvalAltResult>::from(format!("list length {} is negative", len)))?;
        if len < state.slots.len() {
            state.slots.truncate(len);
            state.cache.retain(|index, _| *index < len);
        } else {
            while state.slots.len() < len {
                state.slots.push(Slot::Canonical(Value::Null));
            }
        }
        Ok(())
    }

    pub fn remove(&self, index: INT) -> Result<Dynamic, Box<EvalAltResult>> {
        let mut state = self.state.borrow_mut();
        if state.sealed {
            return Err(sealed_error(LIST_TYPE));
        }
        let Ok(index) = usize::try_from(index) else {
            return Ok(Dynamic::UNIT);
        };
        if index >= state.slots.len() {
            return Ok(Dynamic::UNIT);
        }
        let sealed = state.sealed;
        let slot = state.slots.remove(index);
        let removed = match slot {
            Slot::Canonical(value) => wrap_value(value, sealed),
            Slot::Script(value) => value,
            Slot::Cached => state.cache.remove(&index).unwrap_or(Dynamic::UNIT),
        };
        state.cache.remove(&index);
        let shifted = std::mem::take(&mut state.cache)
            .into_iter()
            .map(|(key, value)| if key > index { (key - 1, value) } else { (key, value) })
            .collect();
        state.cache = shifted;
        Ok(removed)
    }

    pub fn to_value(&self) -> Result<Value, ProcError> {
        Unwrapper::default().list(self)
    }
}

impl IntoIterator for ListProxy {
    type Item = Dynamic;
    type IntoIter = std::vec::IntoIter<Dynamic>;

    fn into_iter(self) -> Self::IntoIter {
        let len = self.len() as INT;
        (0..len)
            .map(|index| self.get(index))
            .collect::<Vec<_>>()
            .into_iter()
    }
}

impl MapProxy {
    pub fn new(entries: ValueMap) -> Self {
        Self::build(entries, false)
    }

    pub fn sealed(entries: ValueMap) -> Self {
        Self::build(entries, true)
    }

    fn build(entries: ValueMap, sealed: bool) -> Self {
        Self {
            state: Rc::new(RefCell::new(MapState {
                slots: entries
                    .into_iter()
                    .filter(|(key, _)| !key.is_empty())
                    .map(|(key, value)| (key, Slot::Canonical(value)))
                    .collect(),
                cache: HashMap::new(),
                sealed,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.state.borrow().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.state.borrow().sealed
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.borrow().slots.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.borrow().slots.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Dynamic {
        let mut state = self.state.borrow_mut();
        let MapState {
            slots,
            cache,
            sealed,
        } = &mut *state;
        match slots.get_mut(key) {
            Some(slot) => read_slot(slot, cache, key.to_string(), *sealed),
            None => Dynamic::UNIT,
        }
    }

    pub fn set(&self, key: &str, value: Dynamic) -> Result<(), Box<EvalAltResult>> {
        if self.is_sealed() {
            if self.contains(key) && is_write_back(&self.get(key), &value.flatten()) {
                return Ok(());
            }
            return Err(sealed_error(MAP_TYPE));
        }
        let mut state = self.state.borrow_mut();
        if key.is_empty() {
            return Err("map keys must not be empty".into());
        }
        state
            .slots
            .insert(key.to_string(), Slot::Script(value.flatten()));
        state.cache.remove(key);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<Dynamic, Box<EvalAltResult>> {
        let mut state = self.state.borrow_mut();
        if state.sealed {
            return Err(sealed_error(MAP_TYPE));
        }
        let sealed = state.sealed;
        let cached = state.cache.remove(key);
        let slot = state.slots.shift_remove(key);
        let removed = match slot {
            Some(Slot::Canonical(value)) => wrap_value(value, sealed),
            Some(Slot::Script(value)) => value,
            Some(Slot::Cached) => cached.unwrap_or(Dynamic::UNIT),
            None => Dynamic::UNIT,
        };
        Ok(removed)
    }

    pub fn to_value(&self) -> Result<Value, ProcError> {
        Unwrapper::default().map(self)
    }
}

/// Converts a canonical value into its script representation. Containers
/// become lazy proxies; nothing below the top level is converted yet.
pub fn wrap(value: Value) -> Dynamic {
    wrap_value(value, false)
}

pub fn wrap_sealed(value: Value) -> Dynamic {
    wrap_value(value, true)
}

fn wrap_value(value: Value, sealed: bool) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(value) => Dynamic::from_bool(value),
        Value::Int(value) => Dynamic::from_int(value as INT),
        Value::Float(value) => Dynamic::from_float(value as FLOAT),
        Value::String(value) => Dynamic::from(value),
        Value::Timestamp(value) => Dynamic::from(EpochMillis(value.timestamp_millis())),
        Value::List(values) => Dynamic::from(ListProxy::build(values, sealed)),
        Value::Map(entries) => Dynamic::from(MapProxy::build(entries, sealed)),
    }
}

/// True when the value is a proxy produced by [`wrap`] rather than a plain
/// script value.
pub fn is_wrapped(value: &Dynamic) -> bool {
    value.is::<ListProxy>() || value.is::<MapProxy>()
}

pub fn unwrap(value: Dynamic) -> Result<Value, ProcError> {
    Unwrapper::default().value(value)
}

#[derive(Default)]
struct Unwrapper {
    visiting: Vec<usize>,
}

impl Unwrapper {
    fn value(&mut self, value: Dynamic) -> Result<Value, ProcError> {
        let value = value.flatten();
        if value.is_unit() {
            return Ok(Value::Null);
        }
        if value.is::<bool>() {
            return Ok(Value::Bool(value.cast::<bool>()));
        }
        if value.is::<INT>() {
            return Ok(Value::Int(value.cast::<INT>()));
        }
        if value.is::<FLOAT>() {
            return Ok(Value::from_number(value.cast::<FLOAT>()));
        }
        if value.is::<ImmutableString>() {
            return Ok(Value::from_tagged_string(
                value.cast::<ImmutableString>().to_string(),
            ));
        }
        if value.is::<char>() {
            return Ok(Value::String(value.cast::<char>().to_string()));
        }
        if value.is::<EpochMillis>() {
            let EpochMillis(millis) = value.cast::<EpochMillis>();
            return Value::timestamp_millis(millis)
                .ok_or_else(|| ProcError::host(format!("timestamp {} is out of range", millis)));
        }
        if value.is::<ListProxy>() {
            return self.list(&value.cast::<ListProxy>());
        }
        if value.is::<MapProxy>() {
            return self.map(&value.cast::<MapProxy>());
        }
        if value.is::<Array>() {
            let array = value.cast::<Array>();
            let mut out = Vec::with_capacity(array.len());
            for item in array {
                out.push(self.value(item)?);
            }
            return Ok(Value::List(out));
        }
        if value.is::<Map>() {
            let map = value.cast::<Map>();
            let mut out = ValueMap::with_capacity(map.len());
            for (key, item) in map {
                if key.is_empty() {
                    continue;
                }
                out.insert(key.to_string(), self.value(item)?);
            }
            return Ok(Value::Map(out));
        }

        Err(ProcError::host(format!(
            "script value of type {} has no canonical form",
            value.type_name()
        )))
    }

    fn enter(&mut self, address: usize) -> Result<(), ProcError> {
        if self.visiting.contains(&address) {
            return Err(ProcError::host("cyclic structure cannot be unwrapped"));
        }
        self.visiting.push(address);
        Ok(())
    }

    fn list(&mut self, proxy: &ListProxy) -> Result<Value, ProcError> {
        self.enter(Rc::as_ptr(&proxy.state) as *const () as usize)?;
        let items = {
            let state = proxy.state.borrow();
            state
                .slots
                .iter()
                .enumerate()
                .map(|(index, slot)| match slot {
                    Slot::Canonical(value) => Ok(value.clone()),
                    Slot::Script(value) => Err(value.clone()),
                    Slot::Cached => Err(state.cache.get(&index).cloned().unwrap_or(Dynamic::UNIT)),
                })
                .collect::<Vec<_>>()
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(match item {
                Ok(value) => value,
                Err(value) => self.value(value)?,
            });
        }
        self.visiting.pop();
        Ok(Value::List(out))
    }

    fn map(&mut self, proxy: &MapProxy) -> Result<Value, ProcError> {
        self.enter(Rc::as_ptr(&proxy.state) as *const () as usize)?;
        let entries = {
            let state = proxy.state.borrow();
            state
                .slots
                .iter()
                .map(|(key, slot)| {
                    let item = match slot {
                        Slot::Canonical(value) => Ok(value.clone()),
                        Slot::Script(value) => Err(value.clone()),
                        Slot::Cached => Err(state.cache.get(key).cloned().unwrap_or(Dynamic::UNIT)),
                    };
                    (key.clone(), item)
                })
                .collect::<Vec<_>>()
        };
        let mut out = ValueMap::with_capacity(entries.len());
        for (key, item) in entries {
            let value = match item {
                Ok(value) => value,
                Err(value) => self.value(value)?,
            };
            out.insert(key, value);
        }
        self.visiting.pop();
        Ok(Value::Map(out))
    }
}

/// Script text for a value: strings are printed raw, containers as JSON.
pub fn render(value: &Dynamic) -> String {
    if value.is::<ImmutableString>() {
        return value.clone().cast::<ImmutableString>().to_string();
    }
    match unwrap(value.clone()) {
        Ok(canonical) => canonical.to_string(),
        Err(_) => value.to_string(),
    }
}

fn render_proxy(value: Dynamic) -> String {
    match unwrap(value) {
        Ok(canonical) => canonical.to_json().to_string(),
        Err(error) => format!("<{}>", error),
    }
}

pub(crate) fn script_error(error: ProcError) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(crate::script::HostFailure(error)),
        Position::NONE,
    ))
}

pub fn register_bridge(engine: &mut Engine) {
    engine
        .register_type_with_name::<ListProxy>(LIST_TYPE)
        .register_indexer_get(|list: &mut ListProxy, index: INT| list.get(index))
        .register_indexer_set(|list: &mut ListProxy, index: INT, value: Dynamic| {
            list.set(index, value)
        })
        .register_get("length", |list: &mut ListProxy| list.len() as INT)
        .register_set("length", |list: &mut ListProxy, len: INT| list.set_len(len))
        .register_fn("len", |list: &mut ListProxy| list.len() as INT)
        .register_fn("is_empty", |list: &mut ListProxy| list.is_empty())
        .register_fn("push", |list: &mut ListProxy, value: Dynamic| list.push(value))
        .register_fn("remove", |list: &mut ListProxy, index: INT| list.remove(index))
        .register_fn("to_string", |list: &mut ListProxy| {
            render_proxy(Dynamic::from(list.clone()))
        })
        .register_fn("to_debug", |list: &mut ListProxy| {
            render_proxy(Dynamic::from(list.clone()))
        })
        .register_iterator::<ListProxy>();

    engine
        .register_type_with_name::<MapProxy>(MAP_TYPE)
        .register_indexer_get(|map: &mut MapProxy, key: ImmutableString| map.get(&key))
        .register_indexer_set(|map: &mut MapProxy, key: ImmutableString, value: Dynamic| {
            map.set(&key, value)
        })
        .register_fn("len", |map: &mut MapProxy| map.len() as INT)
        .register_fn("is_empty", |map: &mut MapProxy| map.is_empty())
        .register_fn("contains", |map: &mut MapProxy, key: ImmutableString| {
            map.contains(&key)
        })
        .register_fn("remove", |map: &mut MapProxy, key: ImmutableString| map.remove(&key))
        .register_fn("keys", |map: &mut MapProxy| {
            map.keys().into_iter().map(Dynamic::from).collect::<Array>()
        })
        .register_fn("to_string", |map: &mut MapProxy| {
            render_proxy(Dynamic::from(map.clone()))
        })
        .register_fn("to_debug", |map: &mut MapProxy| {
            render_proxy(Dynamic::from(map.clone()))
        });

    engine
        .register_type_with_name::<EpochMillis>(TIMESTAMP_TYPE)
        .register_get("millis", EpochMillis::millis)
        .register_fn("timestamp", |millis: INT| EpochMillis(millis))
        .register_fn("to_string", |stamp: &mut EpochMillis| format!("@{}", stamp.0))
        .register_fn("to_debug", |stamp: &mut EpochMillis| format!("@{}", stamp.0))
        .register_fn("==", |left: EpochMillis, right: EpochMillis| left == right)
        .register_fn("!=", |left: EpochMillis, right: EpochMillis| left != right)
        .register_fn("<", |left: EpochMillis, right: EpochMillis| left < right)
        .register_fn(">", |left: EpochMillis, right: EpochMillis| left > right)
        .register_fn("<=", |left: EpochMillis, right: EpochMillis| left <= right)
        .register_fn(">=", |left: EpochMillis, right: EpochMillis| left >= right)
        .register_fn("+", |stamp: EpochMillis, delta: INT| shift(stamp, delta))
        .register_fn("+", |delta: INT, stamp: EpochMillis| shift(stamp, delta))
        .register_fn("-", |stamp: EpochMillis, delta: INT| {
            let delta = delta
                .checked_neg()
                .ok_or_else(|| Box::<EvalAltResult>::from("timestamp offset overflows"))?;
            shift(stamp, delta)
        })
        .register_fn("-", |left: EpochMillis, right: EpochMillis| {
            left.0
                .checked_sub(right.0)
                .ok_or_else(|| Box::<EvalAltResult>::from("timestamp difference overflows"))
        });
}

#[cfg(test)]
mod bridge_tests {
    use super::*;

    fn sample_map() -> Value {
        let mut inner = ValueMap::new();
        inner.insert("id".to_string(), Value::Int(7));
        inner.insert(
            "tags".to_string(),
            Value::List(vec![Value::from("a"), Value::from("b")]),
        );
        let mut outer = ValueMap::new();
        outer.insert("row".to_string(), Value::Map(inner));
        outer.insert("ratio".to_string(), Value::Float(0.5));
        outer.insert("title".to_string(), Value::from("report"));
        Value::Map(outer)
    }

    #[test]
    fn unwrap_of_wrap_reproduces_nested_values() {
        let original = sample_map();
        let wrapped = wrap(original.clone());
        assert!(is_wrapped(&wrapped));
        assert_eq!(unwrap(wrapped).expect("unwrap"), original);
    }

    #[test]
    fn scalars_map_to_native_script_types() {
        assert!(wrap(Value::Null).is_unit());
        assert!(wrap(Value::Int(3)).is::<INT>());
        assert!(wrap(Value::Float(1.5)).is::<FLOAT>());
        assert!(wrap(Value::from("x")).is::<ImmutableString>());
        assert!(!is_wrapped(&wrap(Value::Int(3))));

        let stamp = Value::timestamp_millis(1_700_000_000_123).expect("timestamp");
        let wrapped = wrap(stamp.clone());
        assert!(wrapped.is::<EpochMillis>());
        assert_eq!(unwrap(wrapped).expect("unwrap"), stamp);
    }

    #[test]
    fn whole_floats_narrow_and_fractions_survive() {
        assert_eq!(
            unwrap(Dynamic::from_float(4.0)).expect("unwrap"),
            Value::Int(4)
        );
        assert_eq!(
            unwrap(Dynamic::from_float(4.25)).expect("unwrap"),
            Value::Float(4.25)
        );
    }

    #[test]
    fn tagged_strings_unwrap_to_timestamps() {
        let value = unwrap(Dynamic::from("@1000".to_string())).expect("unwrap");
        assert_eq!(value, Value::timestamp_millis(1000).expect("timestamp"));
        let plain = unwrap(Dynamic::from("@10x".to_string())).expect("unwrap");
        assert_eq!(plain, Value::from("@10x"));
    }

    #[test]
    fn repeated_reads_return_the_same_child_proxy() {
        let proxy = ListProxy::new(vec![Value::List(vec![Value::Int(1)])]);
        let first = proxy.get(0).cast::<ListProxy>();
        let second = proxy.get(0).cast::<ListProxy>();
        assert!(first.ptr_eq(&second));

        first.push(Dynamic::from_int(2)).expect("push");
        assert_eq!(
            proxy.to_value().expect("unwrap"),
            Value::List(vec![Value::List(vec![Value::Int(1), Value::Int(2)])])
        );
    }

    #[test]
    fn overwriting_a_slot_drops_its_cached_child() {
        let proxy = ListProxy::new(vec![Value::List(vec![Value::Int(1)])]);
        let before = proxy.get(0).cast::<ListProxy>();
        proxy.set(0, Dynamic::from_int(9)).expect("set");
        assert!(proxy.get(0).is::<INT>());
        before.push(Dynamic::from_int(2)).expect("push");
        assert_eq!(
            proxy.to_value().expect("unwrap"),
            Value::List(vec![Value::Int(9)])
        );
    }

    #[test]
    fn length_changes_truncate_and_pad() {
        let proxy = ListProxy::new(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        proxy.set_len(2).expect("shrink");
        assert_eq!(proxy.len(), 2);
        assert!(proxy.get(2).is_unit());

        proxy.set_len(4).expect("grow");
        assert_eq!(
            proxy.to_value().expect("unwrap"),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Null, Value::Null])
        );
        assert!(proxy.get(-1).is_unit());
        assert!(proxy.get(99).is_unit());
    }

    #[test]
    fn writing_past_the_end_grows_with_nulls() {
        let proxy = ListProxy::new(Vec::new());
        proxy.set(2, Dynamic::from("z".to_string())).expect("set");
        assert_eq!(
            proxy.to_value().expect("unwrap"),
            Value::List(vec![Value::Null, Value::Null, Value::from("z")])
        );
    }

    #[test]
    fn removal_shifts_cached_entries() {
        let proxy = ListProxy::new(vec![
            Value::Int(0),
            Value::List(vec![Value::Int(1)]),
            Value::List(vec![Value::Int(2)]),
        ]);
        let last = proxy.get(2).cast::<ListProxy>();
        proxy.remove(0).expect("remove");
        let moved = proxy.get(1).cast::<ListProxy>();
        assert!(last.ptr_eq(&moved));
        assert_eq!(proxy.len(), 2);
    }

    #[test]
    fn map_proxy_preserves_order_and_deletes() {
        let proxy = sample_map().as_map().cloned().map(MapProxy::new).expect("map");
        assert_eq!(proxy.keys(), vec!["row", "ratio", "title"]);
        proxy.remove("ratio").expect("remove");
        proxy.set("extra", Dynamic::from_bool(true)).expect("set");
        assert_eq!(proxy.keys(), vec!["row", "title", "extra"]);
        assert!(proxy.get("missing").is_unit());
        assert!(proxy.set("", Dynamic::UNIT).is_err());
    }

    #[test]
    fn sealed_proxies_reject_writes() {
        let proxy = ListProxy::sealed(vec![Value::List(vec![Value::Int(1)])]);
        assert!(proxy.push(Dynamic::UNIT).is_err());
        let child = proxy.get(0).cast::<ListProxy>();
        assert!(child.is_sealed());
        assert!(child.set(0, Dynamic::UNIT).is_err());
    }

    #[test]
    fn sealed_proxies_accept_unchanged_write_back() {
        let mut entries = ValueMap::new();
        entries.insert("items".to_string(), ints_value(&[1, 2]));
        let proxy = MapProxy::sealed(entries);
        let items = proxy.get("items");
        assert!(proxy.set("items", items).is_ok());
        assert!(proxy.set("items", Dynamic::from_int(1)).is_err());

        let mut engine = Engine::new();
        register_bridge(&mut engine);
        let mut scope = rhai::Scope::new();
        scope.push_dynamic("config", Dynamic::from(proxy));
        let len = engine
            .eval_with_scope::<INT>(&mut scope, "config.items.len()")
            .expect("method call on sealed property");
        assert_eq!(len, 2);
    }

    #[test]
    fn sealed_write_back_needs_an_existing_equal_slot() {
        let mut entries = ValueMap::new();
        entries.insert("at".to_string(), stamp(5_000));
        let proxy = MapProxy::sealed(entries);
        assert!(proxy.set("at", Dynamic::from(EpochMillis(5_000))).is_ok());
        assert!(proxy.set("at", Dynamic::from(EpochMillis(0))).is_err());

        let list = ListProxy::sealed(vec![Value::Int(1)]);
        assert!(list.set(0, Dynamic::from_int(1)).is_ok());
        assert!(list.set(99, Dynamic::UNIT).is_err());
        assert!(list.set(-1, Dynamic::UNIT).is_err());
        assert_eq!(list.len(), 1);
    }

    fn stamp(millis: i64) -> Value {
        Value::timestamp_millis(millis).expect("timestamp")
    }

    #[test]
    fn timestamps_support_ordering_and_offsets() {
        let mut engine = Engine::new();
        register_bridge(&mut engine);
        let checks = engine
            .eval::<bool>(
                r#"
                let a = timestamp(1000);
                let b = a + 500;
                b - a == 500 && b >= a && a <= a && (b - 500) == a && (250 + a).millis == 1250
                "#,
            )
            .expect("timestamp script");
        assert!(checks);

        let shifted = engine
            .eval::<Dynamic>("let t = timestamp(10); t += 5; t")
            .expect("compound assignment");
        assert_eq!(unwrap(shifted).expect("unwrap"), stamp(15));

        let error = engine
            .eval::<Dynamic>("timestamp(9223372036854775807) + 1")
            .expect_err("overflow");
        assert!(error.to_string().contains("overflows"));
    }

    fn ints_value(values: &[i64]) -> Value {
        Value::List(values.iter().copied().map(Value::Int).collect())
    }

    #[test]
    fn native_script_containers_unwrap_and_drop_empty_keys() {
        let mut map = Map::new();
        map.insert("".into(), Dynamic::from_int(1));
        map.insert("n".into(), Dynamic::from_array(vec![Dynamic::from_int(2)]));
        let value = unwrap(Dynamic::from_map(map)).expect("unwrap");
        let mut expected = ValueMap::new();
        expected.insert("n".to_string(), Value::List(vec![Value::Int(2)]));
        assert_eq!(value, Value::Map(expected));
    }

    #[test]
    fn self_containing_list_is_rejected() {
        let proxy = ListProxy::new(Vec::new());
        proxy.push(Dynamic::from(proxy.clone())).expect("push");
        let error = proxy.to_value().expect_err("cycle");
        assert!(error.to_string().contains("cyclic"));
    }

    #[test]
    fn scripts_use_proxies_like_containers() {
        let mut engine = Engine::new();
        register_bridge(&mut engine);
        let mut scope = rhai::Scope::new();
        scope.push_dynamic("data", wrap(sample_map()));
        let result = engine
            .eval_with_scope::<Dynamic>(
                &mut scope,
                r#"
                data.row.tags.push("c");
                data["count"] = data.row.tags.length;
                let total = 0;
                for tag in data.row.tags { total += tag.len(); }
                data.total = total;
                data
                "#,
            )
            .expect("script");
        let value = unwrap(result).expect("unwrap");
        let map = value.as_map().expect("map");
        assert_eq!(map.get("count"), Some(&Value::Int(3)));
        assert_eq!(map.get("total"), Some(&Value::Int(3)));
        assert_eq!(
            map["row"].as_map().expect("row")["tags"],
            Value::List(vec![Value::from("a"), Value::from("b"), Value::from("c")])
        );
    }
}
