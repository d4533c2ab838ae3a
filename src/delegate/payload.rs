//! Task Payload Codecs
//!
//! The engine does not interpret task parameters once they are encoded.
//! Each [`PayloadKind`] has one entry in a static codec table; encoding
//! and decoding always go through the table.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DispatchError;

/// Discriminator of an encoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadKind {
    Shell,
    Json,
}

/// A bash script and its environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShellTask {
    pub script: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub output_variables: Vec<String>,
}

/// Decoded task parameters, one variant per payload kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskParameters {
    Shell(ShellTask),
    Json(Value),
}

impl TaskParameters {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Shell(_) => PayloadKind::Shell,
            Self::Json(_) => PayloadKind::Json,
        }
    }
}

/// Opaque bytes plus their discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub kind: PayloadKind,
    pub bytes: Vec<u8>,
}

struct Codec {
    encode: fn(&TaskParameters) -> Result<Vec<u8>, DispatchError>,
    decode: fn(&[u8]) -> Result<TaskParameters, DispatchError>,
}

fn encode_shell(parameters: &TaskParameters) -> Result<Vec<u8>, DispatchError> {
    match parameters {
        TaskParameters::Shell(shell) => {
            serde_json::to_vec(shell).map_err(|e| DispatchError::Payload(e.to_string()))
        }
        other => Err(DispatchError::Payload(format!(
            "shell codec cannot encode {:?} parameters",
            other.kind()
        ))),
    }
}

fn decode_shell(bytes: &[u8]) -> Result<TaskParameters, DispatchError> {
    serde_json::from_slice(bytes)
        .map(TaskParameters::Shell)
        .map_err(|e| DispatchError::Payload(e.to_string()))
}

fn encode_json(parameters: &TaskParameters) -> Result<Vec<u8>, DispatchError> {
    match parameters {
        TaskParameters::Json(value) => {
            serde_json::to_vec(value).map_err(|e| DispatchError::Payload(e.to_string()))
        }
        other => Err(DispatchError::Payload(format!(
            "json codec cannot encode {:?} parameters",
            other.kind()
        ))),
    }
}

fn decode_json(bytes: &[u8]) -> Result<TaskParameters, DispatchError> {
    serde_json::from_slice(bytes)
        .map(TaskParameters::Json)
        .map_err(|e| DispatchError::Payload(e.to_string()))
}

static CODECS: Lazy<HashMap<PayloadKind, Codec>> = Lazy::new(|| {
    let mut codecs = HashMap::new();
    codecs.insert(
        PayloadKind::Shell,
        Codec {
            encode: encode_shell,
            decode: decode_shell,
        },
    );
    codecs.insert(
        PayloadKind::Json,
        Codec {
            encode: encode_json,
            decode: decode_json,
        },
    );
    codecs
});

fn codec(kind: PayloadKind) -> Result<&'static Codec, DispatchError> {
    CODECS
        .get(&kind)
        .ok_or_else(|| DispatchError::Payload(format!("no codec for {:?}", kind)))
}

impl TaskPayload {
    pub fn encode(parameters: &TaskParameters) -> Result<Self, DispatchError> {
        let kind = parameters.kind();
        let bytes = (codec(kind)?.encode)(parameters)?;
        Ok(Self { kind, bytes })
    }

    pub fn decode(&self) -> Result<TaskParameters, DispatchError> {
        (codec(self.kind)?.decode)(&self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shell_payload_through_codec() {
        let parameters = TaskParameters::Shell(ShellTask {
            script: "echo $A".into(),
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
            output_variables: vec!["A".into()],
        });

        let payload = TaskPayload::encode(&parameters).unwrap();
        assert_eq!(payload.kind, PayloadKind::Shell);
        assert_eq!(payload.decode().unwrap(), parameters);
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let payload = TaskPayload {
            kind: PayloadKind::Shell,
            bytes: b"[1, 2, 3]".to_vec(),
        };
        assert!(matches!(payload.decode(), Err(DispatchError::Payload(_))));
    }

    #[test]
    fn test_json_payload_kind() {
        let payload = TaskPayload::encode(&TaskParameters::Json(json!({"url": "x"}))).unwrap();
        assert_eq!(payload.kind, PayloadKind::Json);
        assert!(matches!(payload.decode().unwrap(), TaskParameters::Json(_)));
    }
}
