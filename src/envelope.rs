//! Wire envelopes exchanged between a host and an embedded tool.
//!
//! Every message on the transport is a JSON object tagged by `type`:
//!
//! ```text
//! { type: "handshake",    path?: string, supportedMethods: [{ name, returns: "Promise" }] }
//! { type: "methodcall",   callId: string, name: string, args: any[] }
//! { type: "methodreturn", callId: string, value: any }
//! { type: "methodthrow",  callId: string, error: { message: string, stack?: string, name?: string } }
//! ```
//!
//! Decoding is strict about the tag and the primitive kind of every required
//! field, and lenient about unknown extra fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error class carried in [`ErrorPayload::name`] when a call names a
/// capability the callee does not expose.
pub const UNSUPPORTED_METHOD: &str = "UnsupportedMethod";

/// A received message that is not a well-formed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("protocol violation: {reason}")]
pub struct ProtocolViolation {
    pub reason: String,
}

impl ProtocolViolation {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// What a capability hands back across the boundary. Only promises exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Returns {
    Promise,
}

/// One invokable capability, as advertised in a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub returns: Returns,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            returns: Returns::Promise,
        }
    }
}

/// Serialized form of a thrown error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            name: None,
        }
    }

    pub fn unsupported_method(method: &str) -> Self {
        Self {
            message: format!("unsupported method: {method}"),
            stack: None,
            name: Some(UNSUPPORTED_METHOD.to_string()),
        }
    }

    pub fn is_unsupported_method(&self) -> bool {
        self.name.as_deref() == Some(UNSUPPORTED_METHOD)
    }
}

/// The tagged union carried by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    #[serde(rename_all = "camelCase")]
    Handshake {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        supported_methods: Vec<MethodDescriptor>,
    },
    #[serde(rename_all = "camelCase")]
    MethodCall {
        call_id: String,
        name: String,
        args: Vec<Value>,
    },
    #[serde(rename_all = "camelCase")]
    MethodReturn {
        call_id: String,
        // Peers may omit `value` for an empty result.
        #[serde(default)]
        value: Value,
    },
    #[serde(rename_all = "camelCase")]
    MethodThrow { call_id: String, error: ErrorPayload },
}

const KNOWN_TYPES: [&str; 4] = ["handshake", "methodcall", "methodreturn", "methodthrow"];

impl Envelope {
    /// Validate and decode a message received from the transport.
    pub fn from_value(value: Value) -> Result<Self, ProtocolViolation> {
        let tag = match value.get("type") {
            Some(Value::String(tag)) => tag.clone(),
            Some(other) => {
                return Err(ProtocolViolation::new(format!(
                    "`type` must be a string, got {}",
                    kind_of(other)
                )))
            }
            None if value.is_object() => return Err(ProtocolViolation::new("missing `type`")),
            None => {
                return Err(ProtocolViolation::new(format!(
                    "envelope must be an object, got {}",
                    kind_of(&value)
                )))
            }
        };
        if !KNOWN_TYPES.contains(&tag.as_str()) {
            return Err(ProtocolViolation::new(format!("unknown type `{tag}`")));
        }
        serde_json::from_value(value)
            .map_err(|e| ProtocolViolation::new(format!("malformed `{tag}`: {e}")))
    }

    /// Decode from JSON text (the stream transport's body format).
    pub fn from_json(text: &str) -> Result<Self, ProtocolViolation> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolViolation::new(format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Correlation id of call/return/throw envelopes.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Envelope::Handshake { .. } => None,
            Envelope::MethodCall { call_id, .. }
            | Envelope::MethodReturn { call_id, .. }
            | Envelope::MethodThrow { call_id, .. } => Some(call_id),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Handshake { .. } => "handshake",
            Envelope::MethodCall { .. } => "methodcall",
            Envelope::MethodReturn { .. } => "methodreturn",
            Envelope::MethodThrow { .. } => "methodthrow",
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
