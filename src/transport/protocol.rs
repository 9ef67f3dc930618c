//! Envelope types exchanged between host and worker.
//!
//! One request line in, one response line out. The envelope is deliberately
//! loose: `parameters` is an open bag that each handler projects into its own
//! typed struct, so new operations never require a protocol change.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Request sent from host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Operation name, matched case-insensitively by the worker's registry.
    pub operation: String,

    /// Loosely typed parameter bag. Absent or `null` means empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub parameters: Map<String, Value>,
}

impl OperationRequest {
    /// Create a request with an empty parameter bag.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            parameters: Map::new(),
        }
    }

    /// Create a request from an existing parameter bag.
    pub fn with_parameters(operation: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            operation: operation.into(),
            parameters,
        }
    }

    /// Add a single parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Auxiliary failure details. Callers must not depend on their presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDiagnostics {
    /// Short machine-readable failure class (`validation`, `timeout`, `panic`, ...).
    pub error_type: String,

    /// Free-form detail such as an error source chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Response sent from worker to host.
///
/// `success == true` implies `error == None`; `success == false` implies
/// `data == Null`. The constructors uphold this; decoders treat any present
/// `error` as authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<ResponseDiagnostics>,
}

impl OperationResponse {
    /// Successful response carrying `data`.
    pub fn success(data: impl Into<Value>) -> Self {
        Self {
            success: true,
            data: data.into(),
            error: None,
            diagnostics: None,
        }
    }

    /// Failed response with no diagnostics.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(message.into()),
            diagnostics: None,
        }
    }

    /// Failed response tagged with an error class.
    pub fn failure_with(
        message: impl Into<String>,
        error_type: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            diagnostics: Some(ResponseDiagnostics {
                error_type: error_type.into(),
                detail,
            }),
            ..Self::failure(message)
        }
    }

    /// Whether the operation succeeded. A present `error` always wins.
    pub fn is_success(&self) -> bool {
        self.success && self.error.is_none()
    }

    /// The error class from diagnostics, if any.
    pub fn error_type(&self) -> Option<&str> {
        self.diagnostics.as_ref().map(|d| d.error_type.as_str())
    }

    /// Collapse into `Ok(data)` or `Err(message)`.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None if self.success => Ok(self.data),
            None => Err("operation failed without an error message".to_string()),
        }
    }

    /// Decode the data payload into a typed value.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, String> {
        let data = self.into_result()?;
        serde_json::from_value(data).map_err(|e| format!("unexpected response data: {e}"))
    }
}
