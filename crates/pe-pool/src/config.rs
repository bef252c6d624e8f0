use std::time::Duration;

use indexmap::IndexMap;
use pe_core::{ProcError, Value};

pub const DEFAULT_MAX_OPEN: i64 = 4;
pub const DEFAULT_MAX_IDLE_SECS: f64 = 600.0;
pub const DEFAULT_MAX_WAIT_MILLIS: u64 = 500;

pub const MAX_OPEN_KEY: &str = "maxOpen";
pub const MAX_IDLE_SECS_KEY: &str = "maxIdleSecs";
pub const MAX_WAIT_MILLIS_KEY: &str = "maxWaitMillis";

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Zero or less disables pooling.
    pub max_open: i64,
    pub max_idle: Duration,
    pub max_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: DEFAULT_MAX_OPEN,
            max_idle: Duration::from_secs_f64(DEFAULT_MAX_IDLE_SECS),
            max_wait: Duration::from_millis(DEFAULT_MAX_WAIT_MILLIS),
        }
    }
}

impl PoolConfig {
    pub fn unpooled() -> Self {
        Self {
            max_open: 0,
            ..Self::default()
        }
    }

    pub fn with_max_open(mut self, max_open: i64) -> Self {
        self.max_open = max_open;
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn is_pooled(&self) -> bool {
        self.max_open > 0
    }

    pub fn capacity(&self) -> usize {
        self.max_open.max(0) as usize
    }

    /// Reads pool parameters from connection properties. Unknown keys are
    /// ignored; a recognized key holding a non-numeric value is an error.
    pub fn from_properties(
        pool: &str,
        properties: &IndexMap<String, Value>,
    ) -> Result<Self, ProcError> {
        let mut config = Self::default();

        if let Some(max_open) = numeric_property(pool, properties, MAX_OPEN_KEY)? {
            config.max_open = max_open.trunc() as i64;
        }
        if let Some(max_idle) = numeric_property(pool, properties, MAX_IDLE_SECS_KEY)? {
            if max_idle < 0.0 {
                return Err(ProcError::configuration(
                    pool,
                    format!("{} must not be negative", MAX_IDLE_SECS_KEY),
                ));
            }
            config.max_idle = Duration::try_from_secs_f64(max_idle).map_err(|_| {
                ProcError::configuration(
                    pool,
                    format!("{} of {} is out of range", MAX_IDLE_SECS_KEY, max_idle),
                )
            })?;
        }
        if let Some(max_wait) = numeric_property(pool, properties, MAX_WAIT_MILLIS_KEY)? {
            if max_wait < 0.0 {
                return Err(ProcError::configuration(
                    pool,
                    format!("{} must not be negative", MAX_WAIT_MILLIS_KEY),
                ));
            }
            config.max_wait = Duration::from_millis(max_wait as u64);
        }

        Ok(config)
    }
}

fn numeric_property(
    pool: &str,
    properties: &IndexMap<String, Value>,
    key: &str,
) -> Result<Option<f64>, ProcError> {
    let invalid = |found: &Value| {
        ProcError::configuration(
            pool,
            format!("{} must be numeric, got \"{}\"", key, found),
        )
    };
    match properties.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Int(value)) => Ok(Some(*value as f64)),
        Some(Value::Float(value)) if value.is_finite() => Ok(Some(*value)),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(found @ Value::String(text)) => match text.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Some(value)),
            _ => Err(invalid(found)),
        },
        Some(found) => Err(invalid(found)),
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    fn props(entries: &[(&str, Value)]) -> IndexMap<String, Value> {
        entries
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn missing_properties_use_defaults() {
        let config = PoolConfig::from_properties("db", &IndexMap::new()).expect("defaults");
        assert_eq!(config, PoolConfig::default());
        assert!(config.is_pooled());
        assert_eq!(config.capacity(), DEFAULT_MAX_OPEN as usize);
    }

    #[test]
    fn numeric_strings_and_numbers_are_accepted() {
        let config = PoolConfig::from_properties(
            "db",
            &props(&[
                (MAX_OPEN_KEY, Value::from("2")),
                (MAX_IDLE_SECS_KEY, Value::Float(0.5)),
                (MAX_WAIT_MILLIS_KEY, Value::Int(50)),
                ("url", Value::from("mem://")),
            ]),
        )
        .expect("config");
        assert_eq!(config.max_open, 2);
        assert_eq!(config.max_idle, Duration::from_millis(500));
        assert_eq!(config.max_wait, Duration::from_millis(50));
    }

    #[test]
    fn non_numeric_values_fail_with_configuration_error() {
        let properties = props(&[(MAX_OPEN_KEY, Value::from("many"))]);
        let error =
            PoolConfig::from_properties("db", &properties).expect_err("non-numeric maxOpen");
        assert_eq!(error.code(), "POOL_CONFIG");
        assert!(error.to_string().contains("maxOpen"));

        let error = PoolConfig::from_properties(
            "db",
            &props(&[(MAX_IDLE_SECS_KEY, Value::Bool(true))]),
        )
        .expect_err("boolean maxIdleSecs");
        assert!(error.to_string().contains("maxIdleSecs"));
    }

    #[test]
    fn oversized_idle_limit_is_a_configuration_error() {
        let error = PoolConfig::from_properties(
            "db",
            &props(&[(MAX_IDLE_SECS_KEY, Value::Float(1e30))]),
        )
        .expect_err("idle limit beyond Duration");
        assert_eq!(error.code(), "POOL_CONFIG");
        assert!(error.to_string().contains("out of range"));

        let config = PoolConfig::from_properties(
            "db",
            &props(&[(MAX_WAIT_MILLIS_KEY, Value::Float(1e30))]),
        )
        .expect("wait saturates");
        assert_eq!(config.max_wait, Duration::from_millis(u64::MAX));
    }

    #[test]
    fn zero_or_negative_max_open_disables_pooling() {
        let config = PoolConfig::from_properties("db", &props(&[(MAX_OPEN_KEY, Value::Int(-1))]))
            .expect("config");
        assert!(!config.is_pooled());
        assert_eq!(config.capacity(), 0);
        assert!(!PoolConfig::unpooled().is_pooled());
    }
}
