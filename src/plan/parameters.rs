//! Step Parameters
//!
//! Parameters are a closed sum type keyed by `kind`. Step types that are
//! not built in carry their spec as [`StepParameters::Custom`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::Visibility;

/// Parameters of a plan node, one variant per payload kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepParameters {
    /// Containers and parameterless steps.
    #[default]
    None,
    Shell(ShellParameters),
    Approval(ApprovalParameters),
    Custom(CustomParameters),
}

impl StepParameters {
    /// Discriminator of this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Shell(_) => "shell",
            Self::Approval(_) => "approval",
            Self::Custom(_) => "custom",
        }
    }

    /// Serializes to a JSON value; used by expression resolution.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// A shell script shipped to a delegate.
///
/// ```yaml
/// type: ShellScript
/// spec:
///   script: echo "built $VERSION"
///   env:
///     VERSION: "1.2"
///   outputVariables: [VERSION]
///   delegateSelectors: [linux]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShellParameters {
    pub script: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Variables exported back as outputs after the script finishes.
    #[serde(rename = "outputVariables", default)]
    pub output_variables: Vec<String>,
    #[serde(rename = "delegateSelectors", default)]
    pub delegate_selectors: Vec<String>,
    #[serde(rename = "outputScope", default)]
    pub output_scope: Visibility,
}

/// A manual approval gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalParameters {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub approvers: Vec<String>,
}

/// Opaque spec for step types the engine does not know about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomParameters {
    #[serde(default)]
    pub spec: Value,
}
