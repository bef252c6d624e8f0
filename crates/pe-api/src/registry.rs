use std::sync::Arc;

use indexmap::IndexMap;
use pe_core::{ProcError, ValueMap};
use pe_pool::{Channel, ChannelFactory, ConnectionPool, PoolConfig};
use tracing::info;

use crate::definition::{PoolDefinition, MEMORY_POOL_TYPE};
use crate::memory::MemoryFactory;

/// Builds a channel factory for one pool from its connection properties.
pub type FactoryBuilder =
    Box<dyn Fn(&str, &ValueMap) -> Result<Arc<dyn ChannelFactory>, ProcError>>;

/// Channel types a definition may name in a pool's `type` field.
pub struct ChannelTypes {
    builders: IndexMap<String, FactoryBuilder>,
}

impl Default for ChannelTypes {
    fn default() -> Self {
        let mut types = Self::empty();
        types.register(MEMORY_POOL_TYPE, |pool, properties| {
            let factory = MemoryFactory::from_properties(pool, properties)?;
            Ok(Arc::new(factory) as Arc<dyn ChannelFactory>)
        });
        types
    }
}

impl ChannelTypes {
    pub fn empty() -> Self {
        Self {
            builders: IndexMap::new(),
        }
    }

    pub fn register<F>(&mut self, channel_type: &str, builder: F)
    where
        F: Fn(&str, &ValueMap) -> Result<Arc<dyn ChannelFactory>, ProcError> + 'static,
    {
        self.builders
            .insert(channel_type.to_string(), Box::new(builder));
    }

    pub fn names(&self) -> Vec<String> {
        self.builders.keys().cloned().collect()
    }

    /// Creates the named pool, reading its sizing from the definition.
    pub fn create_pool(
        &self,
        name: &str,
        definition: &PoolDefinition,
    ) -> Result<ConnectionPool, ProcError> {
        let builder = self.builders.get(&definition.channel_type).ok_or_else(|| {
            ProcError::configuration(
                name,
                format!(
                    "unknown channel type \"{}\" (known: {})",
                    definition.channel_type,
                    self.names().join(", ")
                ),
            )
        })?;
        let config = PoolConfig::from_properties(name, &definition.properties)?;
        let factory = builder(name, &definition.properties)?;
        info!(pool = name, channel_type = %definition.channel_type, "pool defined");
        Ok(ConnectionPool::new(
            name,
            config,
            move || -> Result<Box<dyn Channel>, ProcError> { factory.create() },
        ))
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    #[test]
    fn memory_type_is_built_in() {
        let types = ChannelTypes::default();
        assert_eq!(types.names(), vec![MEMORY_POOL_TYPE.to_string()]);
        let definition = PoolDefinition::new(MEMORY_POOL_TYPE).with_property("maxOpen", 2);
        let pool = types.create_pool("cache", &definition).expect("pool");
        assert_eq!(pool.config().max_open, 2);
        let handle = pool.reserve_connection().expect("reserve");
        pool.release_connection(handle);
        pool.close();
    }

    #[test]
    fn unknown_types_and_bad_sizes_fail() {
        let types = ChannelTypes::default();
        let error = types
            .create_pool("db", &PoolDefinition::new("postgres"))
            .expect_err("unknown type");
        assert_eq!(error.code(), "POOL_CONFIG");
        assert!(error.to_string().contains("memory"));

        let error = types
            .create_pool(
                "cache",
                &PoolDefinition::new(MEMORY_POOL_TYPE).with_property("maxOpen", "lots"),
            )
            .expect_err("bad maxOpen");
        assert!(error.to_string().contains("maxOpen"));
    }
}
