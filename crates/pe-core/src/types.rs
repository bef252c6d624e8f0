use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Name of the DATA binding holding a script procedure's body.
pub const SOURCE_BINDING: &str = "code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingKind {
    Data,
    Connection,
    Procedure,
    Argument,
}

impl BindingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Connection => "connection",
            Self::Procedure => "procedure",
            Self::Argument => "argument",
        }
    }
}

/// Named, typed input wired into a procedure.
///
/// DATA and ARGUMENT bindings carry a literal value (for arguments, the
/// default). CONNECTION and PROCEDURE bindings carry the referenced pool
/// name or procedure id as a string value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub kind: BindingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Binding {
    pub fn new(name: impl Into<String>, kind: BindingKind, value: Option<Value>) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            description: String::new(),
        }
    }

    pub fn data(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(name, BindingKind::Data, Some(value.into()))
    }

    pub fn argument(name: impl Into<String>) -> Self {
        Self::new(name, BindingKind::Argument, None)
    }

    pub fn argument_with_default(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self::new(name, BindingKind::Argument, Some(default.into()))
    }

    pub fn connection(name: impl Into<String>, pool: impl Into<String>) -> Self {
        Self::new(name, BindingKind::Connection, Some(Value::String(pool.into())))
    }

    pub fn procedure(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(name, BindingKind::Procedure, Some(Value::String(id.into())))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Pool name or procedure id for reference bindings.
    pub fn reference(&self) -> Option<&str> {
        match self.kind {
            BindingKind::Connection | BindingKind::Procedure => {
                self.value.as_ref().and_then(Value::as_str)
            }
            BindingKind::Data | BindingKind::Argument => None,
        }
    }
}

/// Procedure definition as supplied by a persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

impl ProcedureDef {
    pub fn new(id: impl Into<String>, bindings: Vec<Binding>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            bindings,
        }
    }

    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.bindings.iter().find(|binding| binding.name == name)
    }

    pub fn is_script(&self) -> bool {
        self.binding(SOURCE_BINDING)
            .is_some_and(|binding| binding.kind == BindingKind::Data)
    }

    pub fn arguments(&self) -> impl Iterator<Item = &Binding> {
        self.bindings
            .iter()
            .filter(|binding| binding.kind == BindingKind::Argument)
    }
}

#[cfg(test)]
mod types_tests {
    use super::*;

    #[test]
    fn binding_definitions_deserialize_from_json() {
        let def: ProcedureDef = serde_json::from_str(
            r#"{
              "id": "demo/lookup",
              "bindings": [
                { "name": "code", "kind": "data", "value": "kv.get(key)" },
                { "name": "kv", "kind": "connection", "value": "store" },
                { "name": "key", "kind": "argument", "description": "lookup key" }
              ]
            }"#,
        )
        .expect("definition should parse");
        assert!(def.is_script());
        assert_eq!(def.bindings[1].reference(), Some("store"));
        assert_eq!(def.arguments().count(), 1);
        assert_eq!(def.bindings[2].description, "lookup key");
        assert_eq!(def.bindings[2].value, None);
    }

    #[test]
    fn native_definitions_are_not_scripts() {
        let def = ProcedureDef::new("native/echo", vec![Binding::argument("text")]);
        assert!(!def.is_script());
        assert_eq!(Binding::data("x", 1).reference(), None);
    }
}
