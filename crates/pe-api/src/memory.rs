use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;
use pe_core::{ProcError, Value, ValueMap};
use pe_pool::{Args, Channel, ChannelFactory, MethodTable, ParamKind};
use tracing::debug;

/// Entries shared by every channel of one memory pool.
pub type MemoryStore = Arc<Mutex<ValueMap>>;

/// In-process key/value channel. Every channel from the same pool sees the
/// same store.
pub struct MemoryChannel {
    store: MemoryStore,
    open: bool,
}

impl MemoryChannel {
    pub fn new(store: MemoryStore) -> Self {
        Self { store, open: true }
    }

    fn entries(&self) -> Result<MutexGuard<'_, ValueMap>, ProcError> {
        if !self.open {
            return Err(ProcError::channel_invalid("memory channel is closed"));
        }
        Ok(match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    fn get(&mut self, args: &Args<'_>) -> Result<Value, ProcError> {
        let key = args.str(0)?;
        Ok(self.entries()?.get(key).cloned().unwrap_or(Value::Null))
    }

    fn get_or(&mut self, args: &Args<'_>) -> Result<Value, ProcError> {
        let key = args.str(0)?;
        Ok(self
            .entries()?
            .get(key)
            .cloned()
            .unwrap_or_else(|| args.get(1).clone()))
    }

    fn put(&mut self, args: &Args<'_>) -> Result<Value, ProcError> {
        let key = args.str(0)?;
        if key.is_empty() {
            return Err(ProcError::host("memory keys must not be empty"));
        }
        let previous = self.entries()?.insert(key.to_string(), args.get(1).clone());
        Ok(previous.unwrap_or(Value::Null))
    }

    fn remove(&mut self, args: &Args<'_>) -> Result<Value, ProcError> {
        let key = args.str(0)?;
        Ok(self.entries()?.shift_remove(key).unwrap_or(Value::Null))
    }

    fn list_keys(&mut self) -> Result<Value, ProcError> {
        Ok(Value::List(
            self.entries()?.keys().cloned().map(Value::String).collect(),
        ))
    }

    fn size(&mut self) -> Result<Value, ProcError> {
        Ok(Value::Int(self.entries()?.len() as i64))
    }

    fn clear(&mut self) -> Result<Value, ProcError> {
        let mut entries = self.entries()?;
        let removed = entries.len();
        entries.clear();
        Ok(Value::Int(removed as i64))
    }
}

static METHODS: Lazy<Arc<MethodTable>> = Lazy::new(|| {
    Arc::new(
        MethodTable::builder::<MemoryChannel>()
            .method("get", &[ParamKind::String], MemoryChannel::get)
            .method("get", &[ParamKind::String, ParamKind::Any], MemoryChannel::get_or)
            .method("put", &[ParamKind::String, ParamKind::Any], MemoryChannel::put)
            .method("remove", &[ParamKind::String], MemoryChannel::remove)
            .method("list_keys", &[], |channel, _| channel.list_keys())
            .method("size", &[], |channel, _| channel.size())
            .method("clear", &[], |channel, _| channel.clear())
            .build(),
    )
});

impl Channel for MemoryChannel {
    fn activate(&mut self) -> Result<(), ProcError> {
        if self.open {
            Ok(())
        } else {
            Err(ProcError::channel_invalid("memory channel is closed"))
        }
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn methods(&self) -> Arc<MethodTable> {
        Arc::clone(&METHODS)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Factory for a memory pool, optionally seeded from the pool's `data`
/// property.
pub struct MemoryFactory {
    store: MemoryStore,
}

impl MemoryFactory {
    pub fn new(seed: ValueMap) -> Self {
        Self {
            store: Arc::new(Mutex::new(seed)),
        }
    }

    pub fn from_properties(pool: &str, properties: &ValueMap) -> Result<Self, ProcError> {
        match properties.get("data") {
            None | Some(Value::Null) => Ok(Self::new(ValueMap::new())),
            Some(Value::Map(seed)) => Ok(Self::new(seed.clone())),
            Some(other) => Err(ProcError::configuration(
                pool,
                format!("data must be an object, got {}", other.type_name()),
            )),
        }
    }

    pub fn store(&self) -> MemoryStore {
        Arc::clone(&self.store)
    }
}

impl ChannelFactory for MemoryFactory {
    fn create(&self) -> Result<Box<dyn Channel>, ProcError> {
        debug!("memory channel opened");
        Ok(Box::new(MemoryChannel::new(Arc::clone(&self.store))))
    }
}

#[cfg(test)]
mod memory_tests {
    use super::*;

    fn channel() -> MemoryChannel {
        MemoryChannel::new(Arc::new(Mutex::new(ValueMap::new())))
    }

    fn call(channel: &mut MemoryChannel, method: &str, args: &[Value]) -> Result<Value, ProcError> {
        let table = channel.methods();
        table.invoke(channel, method, args)
    }

    #[test]
    fn put_get_and_remove_round_trip() {
        let mut channel = channel();
        assert_eq!(
            call(&mut channel, "put", &[Value::from("a"), Value::Int(1)]).expect("put"),
            Value::Null
        );
        assert_eq!(
            call(&mut channel, "put", &[Value::from("a"), Value::Int(2)]).expect("replace"),
            Value::Int(1)
        );
        assert_eq!(call(&mut channel, "get", &[Value::from("a")]).expect("get"), Value::Int(2));
        assert_eq!(
            call(&mut channel, "get", &[Value::from("zz"), Value::from("fallback")])
                .expect("get_or"),
            Value::from("fallback")
        );
        assert_eq!(
            call(&mut channel, "remove", &[Value::from("a")]).expect("remove"),
            Value::Int(2)
        );
        assert_eq!(call(&mut channel, "size", &[]).expect("size"), Value::Int(0));
    }

    #[test]
    fn channels_of_one_factory_share_entries() {
        let factory = MemoryFactory::new(ValueMap::new());
        let mut first = factory.create().expect("first");
        let mut second = factory.create().expect("second");
        let table = first.methods();
        table
            .invoke(first.as_mut(), "put", &[Value::from("k"), Value::from("v")])
            .expect("put");
        assert_eq!(
            table.invoke(second.as_mut(), "list_keys", &[]).expect("list_keys"),
            Value::List(vec![Value::from("k")])
        );
    }

    #[test]
    fn seed_data_must_be_an_object() {
        let mut properties = ValueMap::new();
        properties.insert("data".to_string(), Value::Int(3));
        let error = MemoryFactory::from_properties("cache", &properties)
            .err()
            .expect("non-object seed");
        assert_eq!(error.code(), "POOL_CONFIG");
    }

    #[test]
    fn closed_channels_refuse_work() {
        let mut channel = channel();
        channel.close();
        assert!(channel.activate().is_err());
        let error = call(&mut channel, "size", &[]).expect_err("closed");
        assert_eq!(error.code(), "CHANNEL_INVALID");
    }
}
