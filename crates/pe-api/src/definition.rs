use indexmap::IndexMap;
use pe_core::{ProcError, ProcedureDef, Value, ValueMap, SOURCE_BINDING};
use serde::{Deserialize, Serialize};

pub const MEMORY_POOL_TYPE: &str = "memory";

fn default_pool_type() -> String {
    MEMORY_POOL_TYPE.to_string()
}

/// A pool entry: the channel type plus its connection properties
/// (`maxOpen`, `maxIdleSecs`, `maxWaitMillis` and type-specific keys).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolDefinition {
    #[serde(rename = "type", default = "default_pool_type")]
    pub channel_type: String,
    #[serde(flatten)]
    pub properties: ValueMap,
}

impl PoolDefinition {
    pub fn new(channel_type: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            properties: ValueMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Definitions {
    #[serde(default)]
    pub pools: IndexMap<String, PoolDefinition>,
    #[serde(default)]
    pub procedures: Vec<ProcedureDef>,
}

impl Definitions {
    pub fn from_json_str(origin: &str, text: &str) -> Result<Self, ProcError> {
        let mut definitions = serde_json::from_str::<Self>(text).map_err(|error| {
            ProcError::configuration(origin, format!("definition file is invalid: {}", error))
        })?;
        definitions.normalize_sources();
        Ok(definitions)
    }

    /// Source bindings may be written as an array of lines.
    fn normalize_sources(&mut self) {
        for procedure in &mut self.procedures {
            for binding in &mut procedure.bindings {
                if binding.name != SOURCE_BINDING {
                    continue;
                }
                if let Some(Value::List(lines)) = &binding.value {
                    let joined = lines
                        .iter()
                        .map(|line| {
                            line.as_str()
                                .map(str::to_string)
                                .unwrap_or_else(|| line.to_string())
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    binding.value = Some(Value::String(joined));
                }
            }
        }
    }

    /// Folds another set of definitions into this one. Later entries with
    /// the same pool name or procedure id fail instead of replacing.
    pub fn merge(&mut self, origin: &str, other: Definitions) -> Result<(), ProcError> {
        for (name, pool) in other.pools {
            if self.pools.contains_key(&name) {
                return Err(ProcError::configuration(
                    origin,
                    format!("pool \"{}\" is defined more than once", name),
                ));
            }
            self.pools.insert(name, pool);
        }
        for procedure in other.procedures {
            if self.procedures.iter().any(|known| known.id == procedure.id) {
                return Err(ProcError::configuration(
                    origin,
                    format!("procedure \"{}\" is defined more than once", procedure.id),
                ));
            }
            self.procedures.push(procedure);
        }
        Ok(())
    }
}

#[cfg(test)]
mod definition_tests {
    use pe_core::BindingKind;

    use super::*;

    const SAMPLE: &str = r#"{
        "pools": { "kv": { "type": "memory", "maxOpen": 2, "maxIdleSecs": 60 } },
        "procedures": [
            { "id": "demo/add", "bindings": [
                { "name": "code", "kind": "data", "value": "a + b" },
                { "name": "a", "kind": "argument", "description": "left" },
                { "name": "b", "kind": "argument", "value": 1 } ] },
            { "id": "demo/lines", "bindings": [
                { "name": "code", "kind": "data", "value": ["let x = 1;", "return x;"] },
                { "name": "since", "kind": "argument", "value": "@1000" } ] }
        ]
    }"#;

    #[test]
    fn parses_pools_and_procedures() {
        let definitions = Definitions::from_json_str("sample.json", SAMPLE).expect("parse");
        let pool = &definitions.pools["kv"];
        assert_eq!(pool.channel_type, MEMORY_POOL_TYPE);
        assert_eq!(pool.properties.get("maxOpen"), Some(&Value::Int(2)));

        let add = &definitions.procedures[0];
        assert_eq!(add.id, "demo/add");
        assert_eq!(add.bindings[1].kind, BindingKind::Argument);
        assert_eq!(add.bindings[1].description, "left");
        assert_eq!(add.bindings[2].value, Some(Value::Int(1)));
    }

    #[test]
    fn source_lines_are_joined_and_tags_become_timestamps() {
        let definitions = Definitions::from_json_str("sample.json", SAMPLE).expect("parse");
        let lines = &definitions.procedures[1];
        assert_eq!(
            lines.binding(SOURCE_BINDING).and_then(|b| b.value.clone()),
            Some(Value::from("let x = 1;\nreturn x;"))
        );
        assert_eq!(
            lines.binding("since").and_then(|b| b.value.clone()),
            Value::timestamp_millis(1000)
        );
    }

    #[test]
    fn missing_pool_type_defaults_to_memory() {
        let definitions =
            Definitions::from_json_str("p.json", r#"{"pools":{"cache":{"maxOpen":"3"}}}"#)
                .expect("parse");
        assert_eq!(definitions.pools["cache"].channel_type, MEMORY_POOL_TYPE);
        assert!(definitions.procedures.is_empty());
    }

    #[test]
    fn malformed_json_is_a_configuration_error() {
        let error = Definitions::from_json_str("bad.json", "{ nope").expect_err("invalid");
        assert_eq!(error.code(), "POOL_CONFIG");
        assert!(error.to_string().contains("bad.json"));
    }

    #[test]
    fn merging_rejects_duplicates() {
        let mut base = Definitions::from_json_str("a.json", SAMPLE).expect("parse");
        let again = Definitions::from_json_str("b.json", SAMPLE).expect("parse");
        let error = base.merge("b.json", again).expect_err("duplicate");
        assert!(error.to_string().contains("more than once"));

        let extra = Definitions::from_json_str(
            "c.json",
            r#"{"procedures":[{"id":"demo/other","bindings":[]}]}"#,
        )
        .expect("parse");
        base.merge("c.json", extra).expect("merge");
        assert_eq!(base.procedures.len(), 3);
    }
}
