//! Capability tables: the named operations one side exposes to its peer.
//!
//! A table is built against a declared [`CapabilityInterface`]. Registering a
//! name the interface does not declare, registering a name twice, or leaving
//! a declared name without a handler are all rejected before the table can be
//! used, so the handshake always advertises exactly what the table can serve.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::envelope::{Envelope, ErrorPayload, MethodDescriptor};
use crate::error::RegistrationError;

/// Failure raised by a capability; becomes a `methodthrow` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CapabilityError {
    pub message: String,
    pub stack: Option<String>,
}

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl From<serde_json::Error> for CapabilityError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(format!("invalid arguments: {e}"))
    }
}

impl From<CapabilityError> for ErrorPayload {
    fn from(e: CapabilityError) -> Self {
        ErrorPayload {
            message: e.message,
            stack: e.stack,
            name: None,
        }
    }
}

pub type CapabilityResult = Result<Value, CapabilityError>;
pub type CapabilityFuture = Pin<Box<dyn Future<Output = CapabilityResult> + Send>>;

type Handler = Arc<dyn Fn(Vec<Value>) -> CapabilityFuture + Send + Sync>;

/// Deserialize positional argument `index`. A missing argument is read as
/// `null`, so `Option<T>` parameters may be omitted by the caller.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, CapabilityError> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| CapabilityError::new(format!("invalid argument {index}: {e}")))
}

/// The set of method names one side promises to implement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityInterface {
    name: String,
    methods: Vec<String>,
}

impl CapabilityInterface {
    pub fn new<I, S>(name: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen: Vec<String> = Vec::new();
        for method in methods {
            let method = method.into();
            if !seen.contains(&method) {
                seen.push(method);
            }
        }
        Self {
            name: name.into(),
            methods: seen,
        }
    }

    /// The operations a host expects from an embedded tool.
    pub fn embedded_tool() -> Self {
        Self::new(
            "embedded-tool",
            ["hasUnsavedChanges", "navigate", "saveState", "restoreState"],
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn declares(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// Collects handlers for a declared interface.
pub struct CapabilityTableBuilder {
    interface: CapabilityInterface,
    handlers: HashMap<String, Handler>,
}

impl CapabilityTableBuilder {
    /// Register an operation that completes synchronously.
    pub fn register_sync<F>(&mut self, name: &str, f: F) -> Result<&mut Self, RegistrationError>
    where
        F: Fn(Vec<Value>) -> CapabilityResult + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |args| -> CapabilityFuture {
            let out = f(args);
            Box::pin(async move { out })
        });
        self.insert(name, handler)
    }

    /// Register an operation that completes asynchronously.
    pub fn register_async<F, Fut>(&mut self, name: &str, f: F) -> Result<&mut Self, RegistrationError>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CapabilityResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| -> CapabilityFuture { Box::pin(f(args)) });
        self.insert(name, handler)
    }

    fn insert(&mut self, name: &str, handler: Handler) -> Result<&mut Self, RegistrationError> {
        if !self.interface.declares(name) {
            return Err(RegistrationError::Undeclared {
                interface: self.interface.name.clone(),
                name: name.to_string(),
            });
        }
        if self.handlers.contains_key(name) {
            return Err(RegistrationError::Duplicate {
                name: name.to_string(),
            });
        }
        self.handlers.insert(name.to_string(), handler);
        Ok(self)
    }

    pub fn build(self) -> Result<CapabilityTable, RegistrationError> {
        let missing: Vec<String> = self
            .interface
            .methods
            .iter()
            .filter(|m| !self.handlers.contains_key(*m))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(RegistrationError::Missing {
                interface: self.interface.name.clone(),
                names: missing,
            });
        }
        Ok(CapabilityTable {
            order: self.interface.methods,
            handlers: self.handlers,
        })
    }
}

/// Immutable name → handler registry served to the peer.
#[derive(Clone, Default)]
pub struct CapabilityTable {
    order: Vec<String>,
    handlers: HashMap<String, Handler>,
}

impl std::fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityTable")
            .field("methods", &self.order)
            .finish()
    }
}

impl CapabilityTable {
    pub fn builder(interface: CapabilityInterface) -> CapabilityTableBuilder {
        CapabilityTableBuilder {
            interface,
            handlers: HashMap::new(),
        }
    }

    /// A side that exposes nothing (a pure caller).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// What our handshake advertises, in declaration order.
    pub fn descriptors(&self) -> Vec<MethodDescriptor> {
        self.order.iter().map(MethodDescriptor::new).collect()
    }

    /// Run one incoming call and produce its terminal envelope.
    ///
    /// Always yields exactly one `methodreturn` or `methodthrow` carrying
    /// `call_id`, whether the handler returns, fails, or panics.
    pub async fn dispatch(&self, call_id: String, name: String, args: Vec<Value>) -> Envelope {
        let Some(handler) = self.handlers.get(&name).cloned() else {
            tracing::debug!(%call_id, method = %name, "call to unsupported method");
            return Envelope::MethodThrow {
                call_id,
                error: ErrorPayload::unsupported_method(&name),
            };
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| (*handler)(args))) {
            Ok(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(panic_error(&name, payload)),
            },
            Err(payload) => Err(panic_error(&name, payload)),
        };

        match outcome {
            Ok(value) => Envelope::MethodReturn { call_id, value },
            Err(e) => {
                tracing::debug!(%call_id, method = %name, error = %e, "capability failed");
                Envelope::MethodThrow {
                    call_id,
                    error: e.into(),
                }
            }
        }
    }
}

fn panic_error(method: &str, payload: Box<dyn Any + Send>) -> CapabilityError {
    let detail = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    };
    tracing::warn!(method, %detail, "capability panicked");
    CapabilityError::new(detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn interface() -> CapabilityInterface {
        CapabilityInterface::new("test", ["navigate", "saveState"])
    }

    #[test]
    fn undeclared_registration_is_rejected() {
        let mut builder = CapabilityTable::builder(interface());
        let err = builder
            .register_sync("restoreState", |_| Ok(Value::Null))
            .err()
            .expect("undeclared");
        assert_eq!(
            err,
            RegistrationError::Undeclared {
                interface: "test".into(),
                name: "restoreState".into()
            }
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut builder = CapabilityTable::builder(interface());
        builder.register_sync("navigate", |_| Ok(Value::Null)).unwrap();
        let err = builder
            .register_sync("navigate", |_| Ok(Value::Null))
            .err()
            .expect("duplicate");
        assert_eq!(
            err,
            RegistrationError::Duplicate {
                name: "navigate".into()
            }
        );
    }

    #[test]
    fn build_requires_every_declared_method() {
        let mut builder = CapabilityTable::builder(interface());
        builder.register_sync("navigate", |_| Ok(Value::Null)).unwrap();
        let err = builder.build().expect_err("saveState missing");
        assert_eq!(
            err,
            RegistrationError::Missing {
                interface: "test".into(),
                names: vec!["saveState".into()]
            }
        );
    }

    #[test]
    fn descriptors_follow_declaration_order() {
        let mut builder = CapabilityTable::builder(interface());
        builder
            .register_sync("saveState", |_| Ok(Value::Null))
            .unwrap()
            .register_sync("navigate", |_| Ok(Value::Null))
            .unwrap();
        let table = builder.build().unwrap();
        let names: Vec<_> = table.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["navigate", "saveState"]);
    }

    #[test]
    fn arg_reads_missing_as_null() {
        let args = vec![json!("/x")];
        assert_eq!(arg::<String>(&args, 0).unwrap(), "/x");
        assert_eq!(arg::<Option<u32>>(&args, 1).unwrap(), None);
        assert!(arg::<u32>(&args, 0).is_err());
    }

    #[tokio::test]
    async fn dispatch_converts_sync_panic_to_throw() {
        let mut builder = CapabilityTable::builder(CapabilityInterface::new("t", ["boom"]));
        builder
            .register_sync("boom", |_| panic!("exploded"))
            .unwrap();
        let table = builder.build().unwrap();
        let env = table.dispatch("1".into(), "boom".into(), vec![]).await;
        match env {
            Envelope::MethodThrow { call_id, error } => {
                assert_eq!(call_id, "1");
                assert_eq!(error.message, "exploded");
            }
            other => panic!("expected throw, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_unknown_name_throws_unsupported() {
        let table = CapabilityTable::empty();
        let env = table.dispatch("9".into(), "nope".into(), vec![]).await;
        match env {
            Envelope::MethodThrow { call_id, error } => {
                assert_eq!(call_id, "9");
                assert!(error.is_unsupported_method());
            }
            other => panic!("expected throw, got {other:?}"),
        }
    }
}
