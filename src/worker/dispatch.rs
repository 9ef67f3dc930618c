//! Operation registry and dispatcher.
//!
//! The registry maps case-insensitive operation names (and aliases) to plain
//! handler functions. It is filled once at worker startup and never mutated
//! afterwards. The dispatcher is the single place where handler errors and
//! panics become failure responses.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error};

use crate::backend::{AutomationBackend, BackendError};
use crate::transport::protocol::{OperationRequest, OperationResponse};

use super::handlers;

/// Failure of a single operation, before it is turned into a response.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("{field} is required for {operation}")]
    MissingParameter { field: String, operation: String },

    #[error("invalid parameters for {operation}: {message}")]
    InvalidParameters { operation: String, message: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{0}")]
    Failed(String),
}

impl OperationError {
    /// Short class name reported in response diagnostics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingParameter { .. } | Self::InvalidParameters { .. } => "validation",
            Self::Backend(e) => e.kind(),
            Self::Failed(_) => "operation",
        }
    }

    pub fn invalid(operation: &str, message: impl Into<String>) -> Self {
        Self::InvalidParameters {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

/// Errors building a registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("operation '{0}' is already registered")]
    Duplicate(String),

    #[error("cannot alias '{alias}' to unregistered operation '{target}'")]
    UnknownTarget { alias: String, target: String },
}

/// Handler signature. Handlers are plain functions; all state they need
/// arrives through the context.
pub type Handler = fn(&OperationContext<'_>) -> Result<Value, OperationError>;

/// Everything a handler may touch while serving one request.
pub struct OperationContext<'a> {
    /// Canonical operation name (not the alias the caller used).
    pub operation: &'a str,
    pub parameters: &'a Map<String, Value>,
    pub backend: &'a dyn AutomationBackend,
    pub registry: &'a OperationRegistry,
}

impl OperationContext<'_> {
    /// Project the parameter bag into a typed struct.
    ///
    /// A missing required field becomes `"<field> is required for <op>"`.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, OperationError> {
        serde_json::from_value(Value::Object(self.parameters.clone()))
            .map_err(|e| projection_error(self.operation, &e))
    }
}

fn projection_error(operation: &str, err: &serde_json::Error) -> OperationError {
    let message = err.to_string();
    let missing = message
        .strip_prefix("missing field `")
        .and_then(|rest| rest.split('`').next());
    match missing {
        Some(field) => OperationError::MissingParameter {
            field: field.to_string(),
            operation: operation.to_string(),
        },
        None => OperationError::invalid(operation, message),
    }
}

/// A canonical operation and the names that resolve to it.
#[derive(Clone)]
pub struct RegisteredOperation {
    pub name: String,
    pub aliases: Vec<String>,
    handler: Handler,
}

impl std::fmt::Debug for RegisteredOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredOperation")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .finish_non_exhaustive()
    }
}

/// Case-insensitive name → handler table.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    operations: Vec<RegisteredOperation>,
    index: HashMap<String, usize>,
}

impl OperationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The full operation vocabulary served by the worker.
    pub fn standard() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        handlers::register_all(&mut registry)?;
        Ok(registry)
    }

    /// Register a canonical operation.
    pub fn register(&mut self, name: &str, handler: Handler) -> Result<(), RegistryError> {
        let key = name.to_ascii_lowercase();
        if self.index.contains_key(&key) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.index.insert(key, self.operations.len());
        self.operations.push(RegisteredOperation {
            name: name.to_string(),
            aliases: Vec::new(),
            handler,
        });
        Ok(())
    }

    /// Add an alternate name for an already registered operation.
    pub fn alias(&mut self, alias: &str, target: &str) -> Result<(), RegistryError> {
        let key = alias.to_ascii_lowercase();
        if self.index.contains_key(&key) {
            return Err(RegistryError::Duplicate(alias.to_string()));
        }
        let slot = *self
            .index
            .get(&target.to_ascii_lowercase())
            .ok_or_else(|| RegistryError::UnknownTarget {
                alias: alias.to_string(),
                target: target.to_string(),
            })?;
        self.index.insert(key, slot);
        self.operations[slot].aliases.push(alias.to_string());
        Ok(())
    }

    /// Look up by canonical name or alias, ignoring case.
    pub fn resolve(&self, name: &str) -> Option<&RegisteredOperation> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|slot| &self.operations[*slot])
    }

    /// Canonical names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.iter().map(|op| op.name.as_str()).collect();
        names.sort_unstable_by_key(|n| n.to_ascii_lowercase());
        names
    }

    /// Registered operations in registration order.
    pub fn operations(&self) -> &[RegisteredOperation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Routes requests to handlers against one backend.
pub struct Dispatcher {
    registry: OperationRegistry,
    backend: Arc<dyn AutomationBackend>,
}

impl Dispatcher {
    pub fn new(registry: OperationRegistry, backend: Arc<dyn AutomationBackend>) -> Self {
        Self { registry, backend }
    }

    /// Dispatcher over the standard registry.
    pub fn standard(backend: Arc<dyn AutomationBackend>) -> Result<Self, RegistryError> {
        Ok(Self::new(OperationRegistry::standard()?, backend))
    }

    pub const fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Parse one raw request line and dispatch it. Never fails: protocol
    /// errors come back as failure responses.
    pub fn handle_line(&self, line: &[u8]) -> OperationResponse {
        match serde_json::from_slice::<OperationRequest>(line) {
            Ok(request) => self.dispatch(&request.operation, &request.parameters),
            Err(e) => {
                debug!(error = %e, "Rejecting malformed request");
                OperationResponse::failure_with(format!("Invalid request: {e}"), "protocol", None)
            }
        }
    }

    /// Run one operation. Total: unknown names, handler errors and handler
    /// panics all produce a failure response.
    pub fn dispatch(&self, name: &str, parameters: &Map<String, Value>) -> OperationResponse {
        let Some(operation) = self.registry.resolve(name) else {
            return OperationResponse::failure_with(
                format!(
                    "Unknown operation: {name}. Supported operations: {}",
                    self.registry.names().join(", ")
                ),
                "unsupported_operation",
                None,
            );
        };

        let ctx = OperationContext {
            operation: &operation.name,
            parameters,
            backend: self.backend.as_ref(),
            registry: &self.registry,
        };

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (operation.handler)(&ctx)));
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(Ok(data)) => {
                debug!(operation = %operation.name, elapsed_ms, "Operation succeeded");
                OperationResponse::success(data)
            }
            Ok(Err(e)) => {
                debug!(operation = %operation.name, elapsed_ms, error = %e, "Operation failed");
                OperationResponse::failure_with(e.to_string(), e.kind(), source_chain(&e))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(operation = %operation.name, panic = %message, "Handler panicked");
                OperationResponse::failure_with(
                    format!("{} failed: {message}", operation.name),
                    "panic",
                    Some(std::backtrace::Backtrace::force_capture().to_string()),
                )
            }
        }
    }
}

fn source_chain(err: &dyn std::error::Error) -> Option<String> {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        chain.push(source.to_string());
        current = source.source();
    }
    (!chain.is_empty()).then(|| chain.join(": "))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
