//! Definition Documents
//!
//! The structured input of plan compilation. A definition is a tree of
//! named fields (`pipeline`, `stages`, `stage`, `step`, ...) whose values
//! are arbitrary JSON-like data. Schema validation happens upstream; here
//! a document only needs to be well-formed YAML or JSON.
//!
//! # Example YAML Format
//!
//! ```yaml
//! pipeline:
//!   identifier: release
//!   name: Release
//!   stages:
//!     - stage:
//!         identifier: build
//!         spec:
//!           execution:
//!             steps:
//!               - step:
//!                   identifier: compile
//!                   type: ShellScript
//!                   spec:
//!                     script: make
//! ```

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde_json::{Map, Value};

use crate::error::CompileError;

/// A named element of a definition, with the dotted path it was found at.
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionField {
    pub name: String,
    pub value: Value,
    pub path: String,
}

impl DefinitionField {
    pub fn new(name: impl Into<String>, value: Value, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            path: path.into(),
        }
    }

    /// Builds the field for a sub-element `name` of this field's object.
    pub fn child(&self, name: &str) -> Option<DefinitionField> {
        self.value
            .get(name)
            .filter(|v| !v.is_null())
            .map(|v| DefinitionField::new(name, v.clone(), format!("{}.{}", self.path, name)))
    }

    /// Like [`child`](Self::child) but a missing value is a compile error.
    pub fn require_child(&self, name: &str) -> Result<DefinitionField, CompileError> {
        self.child(name).ok_or_else(|| CompileError::MissingField {
            path: self.path.clone(),
            field: name.to_string(),
        })
    }

    pub fn as_object(&self) -> Result<&Map<String, Value>, CompileError> {
        self.value.as_object().ok_or_else(|| CompileError::InvalidField {
            path: self.path.clone(),
            field: self.name.clone(),
            reason: "expected an object".to_string(),
        })
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.value.get(name).and_then(Value::as_str)
    }

    pub fn require_str(&self, name: &str) -> Result<&str, CompileError> {
        match self.value.get(name) {
            None | Some(Value::Null) => Err(CompileError::MissingField {
                path: self.path.clone(),
                field: name.to_string(),
            }),
            Some(Value::String(s)) if s.trim().is_empty() => Err(CompileError::MissingField {
                path: self.path.clone(),
                field: name.to_string(),
            }),
            Some(Value::String(s)) => Ok(s.as_str()),
            Some(_) => Err(CompileError::InvalidField {
                path: self.path.clone(),
                field: name.to_string(),
                reason: "expected a string".to_string(),
            }),
        }
    }

    pub fn bool_field(&self, name: &str) -> bool {
        self.value.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Splits a list of single-key objects (`- step: {...}`) into fields.
    ///
    /// Each element must be an object with exactly one key.
    pub fn elements(&self) -> Result<Vec<DefinitionField>, CompileError> {
        let items = self.value.as_array().ok_or_else(|| CompileError::InvalidField {
            path: self.path.clone(),
            field: self.name.clone(),
            reason: "expected a list".to_string(),
        })?;

        let mut fields = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let path = format!("{}[{}]", self.path, index);
            let object = item.as_object().filter(|o| o.len() == 1).ok_or_else(|| {
                CompileError::InvalidField {
                    path: path.clone(),
                    field: self.name.clone(),
                    reason: "each element must be an object with a single key".to_string(),
                }
            })?;

            for (key, value) in object {
                fields.push(DefinitionField::new(
                    key.clone(),
                    value.clone(),
                    format!("{}.{}", path, key),
                ));
            }
        }
        Ok(fields)
    }

    /// Identifier of this element, if it declares one.
    pub fn identifier(&self) -> Option<&str> {
        self.str_field("identifier")
    }
}

/// A whole definition document.
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub root: DefinitionField,
}

impl Definition {
    /// Wraps an already-parsed document. The document must be an object
    /// with exactly one top-level key.
    pub fn from_value(value: Value) -> Result<Self, CompileError> {
        let object = value.as_object().ok_or_else(|| {
            CompileError::Parse("definition must be a mapping".to_string())
        })?;

        if object.len() != 1 {
            return Err(CompileError::Parse(format!(
                "definition must have exactly one top-level key, found {}",
                object.len()
            )));
        }

        let (name, inner) = object
            .iter()
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
            .ok_or_else(|| CompileError::Parse("empty definition".to_string()))?;

        Ok(Self {
            root: DefinitionField::new(name.clone(), inner, name),
        })
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, CompileError> {
        let value: Value = serde_yaml::from_str(content)
            .map_err(|e| CompileError::Parse(format!("invalid YAML: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_json_str(content: &str) -> Result<Self, CompileError> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| CompileError::Parse(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Display name of the document: `name`, then `identifier`, then the key.
    pub fn name(&self) -> &str {
        self.root
            .str_field("name")
            .or_else(|| self.root.identifier())
            .unwrap_or(&self.root.name)
    }
}

/// Loads a definition from a `.yaml`, `.yml` or `.json` file.
///
/// # Example
///
/// ```rust,no_run
/// use planrunner::plan::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_definition("pipeline.yaml")?;
///     println!("Loaded '{}'", definition.name());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: impl AsRef<Path>) -> Result<Definition, CompileError> {
    let path = path.as_ref();
    info!("Loading definition from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        CompileError::Parse(format!(
            "failed to read '{}': {}. Check that the file exists and is readable",
            path.display(),
            e
        ))
    })?;

    debug!("Definition loaded ({} bytes)", content.len());

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        Definition::from_json_str(&content)
    } else {
        Definition::from_yaml_str(&content)
    }
}

/// Parses a timeout written as seconds (`30`) or with a unit suffix
/// (`45s`, `10m`, `2h`).
pub fn parse_timeout_secs(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            let (digits, unit) = match s.char_indices().last() {
                Some((idx, c)) if c.is_ascii_alphabetic() => (&s[..idx], c),
                _ => (s, 's'),
            };
            let amount: u64 = digits.trim().parse().ok()?;
            match unit {
                's' => Some(amount),
                'm' => Some(amount * 60),
                'h' => Some(amount * 3600),
                'd' => Some(amount * 86_400),
                _ => None,
            }
        }
        _ => None,
    }
}
