//! Typed request and response adapters.
//!
//! Each request type serializes structurally into the generic envelope, so
//! anything sent through these types can also be sent by hand with
//! `OperationRequest`. The same types are the parameter schemas of the MCP
//! tools.

use rmcp::schemars;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RequestDefaults;
use crate::transport::OperationRequest;

pub use crate::backend::ElementInfo;

/// Extra host-side time granted on top of a `WaitForElement` bound.
const WAIT_DEADLINE_SLACK_SECS: u64 = 5;

/// A request with a fixed operation name.
pub trait TypedRequest: Serialize + Send {
    const OPERATION: &'static str;

    /// Fill unset optional fields from configuration.
    fn apply_defaults(&mut self, _defaults: &RequestDefaults) {}

    /// Host deadline in seconds; 0 means the configured default.
    fn timeout_seconds(&self) -> u64 {
        0
    }

    /// Serialize into the generic envelope.
    fn to_envelope(&self) -> Result<OperationRequest, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(parameters) => {
                Ok(OperationRequest::with_parameters(Self::OPERATION, parameters))
            }
            other => Err(serde::ser::Error::custom(format!(
                "request must serialize to an object, got {other}"
            ))),
        }
    }
}

/// Requests that only name a target element.
macro_rules! element_request {
    ($(#[$meta:meta])* $name:ident => $operation:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            /// Id of the target element, as returned by find_elements.
            pub element_id: String,

            /// Deadline in seconds; omitted or 0 uses the server default.
            #[serde(default, skip_serializing)]
            pub timeout_seconds: Option<u64>,
        }

        impl $name {
            pub fn new(element_id: impl Into<String>) -> Self {
                Self {
                    element_id: element_id.into(),
                    timeout_seconds: None,
                }
            }
        }

        impl TypedRequest for $name {
            const OPERATION: &'static str = $operation;

            fn timeout_seconds(&self) -> u64 {
                self.timeout_seconds.unwrap_or(0)
            }
        }
    };
}

element_request!(
    /// Describe one element.
    ElementInfoRequest => "GetElementInfo"
);
element_request!(
    /// Invoke (click) an element.
    InvokeRequest => "Invoke"
);
element_request!(
    /// Read an element's value.
    GetValueRequest => "GetValue"
);
element_request!(
    /// Flip a toggleable element.
    ToggleRequest => "Toggle"
);
element_request!(
    /// Select an item, deselecting its siblings.
    SelectItemRequest => "SelectItem"
);
element_request!(
    /// Read an element's text.
    GetTextRequest => "GetText"
);
element_request!(
    /// Row and column counts of a grid.
    GridInfoRequest => "GetGridInfo"
);

/// Search for elements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FindElementsRequest {
    /// Element name, matched case-insensitively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation_id: Option<String>,

    /// Control type such as Button, Edit or Window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// Search below this element instead of the whole desktop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// "children" or "descendants" (default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,

    /// Deadline in seconds; omitted or 0 uses the server default.
    #[serde(default, skip_serializing)]
    pub timeout_seconds: Option<u64>,
}

impl TypedRequest for FindElementsRequest {
    const OPERATION: &'static str = "FindElements";

    fn apply_defaults(&mut self, defaults: &RequestDefaults) {
        self.max_results.get_or_insert(defaults.max_results);
    }

    fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds.unwrap_or(0)
    }
}

/// Wait until an element matching the criteria exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WaitForElementRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// How long to keep polling, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl TypedRequest for WaitForElementRequest {
    const OPERATION: &'static str = "WaitForElement";

    fn apply_defaults(&mut self, defaults: &RequestDefaults) {
        self.timeout_seconds.get_or_insert(defaults.wait_timeout_seconds);
    }

    /// The host deadline outlasts the polling bound so the worker can report
    /// "not found" itself.
    fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds
            .map_or(0, |wait| wait.saturating_add(WAIT_DEADLINE_SLACK_SECS))
    }
}

/// Set the value of an editable element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetValueRequest {
    pub element_id: String,
    pub value: String,

    /// Deadline in seconds; omitted or 0 uses the server default.
    #[serde(default, skip_serializing)]
    pub timeout_seconds: Option<u64>,
}

impl TypedRequest for SetValueRequest {
    const OPERATION: &'static str = "SetValue";

    fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds.unwrap_or(0)
    }
}

/// Minimize, maximize or restore a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetWindowStateRequest {
    pub element_id: String,

    /// "normal", "minimized" or "maximized".
    pub state: String,

    /// Deadline in seconds; omitted or 0 uses the server default.
    #[serde(default, skip_serializing)]
    pub timeout_seconds: Option<u64>,
}

impl TypedRequest for SetWindowStateRequest {
    const OPERATION: &'static str = "SetWindowState";

    fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds.unwrap_or(0)
    }
}

/// Scroll a scrollable element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScrollRequest {
    pub element_id: String,

    /// "up", "down", "left" or "right".
    pub direction: String,

    /// Number of scroll steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,

    /// Deadline in seconds; omitted or 0 uses the server default.
    #[serde(default, skip_serializing)]
    pub timeout_seconds: Option<u64>,
}

impl TypedRequest for ScrollRequest {
    const OPERATION: &'static str = "ScrollElement";

    fn apply_defaults(&mut self, defaults: &RequestDefaults) {
        self.amount.get_or_insert(defaults.scroll_amount);
    }

    fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds.unwrap_or(0)
    }
}

/// One cell of a grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GridItemRequest {
    pub element_id: String,
    pub row: usize,
    pub column: usize,

    #[serde(default, skip_serializing)]
    pub timeout_seconds: Option<u64>,
}

impl TypedRequest for GridItemRequest {
    const OPERATION: &'static str = "GetGridItem";

    fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds.unwrap_or(0)
    }
}

/// Result of `Toggle` and `GetToggleState`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleState {
    pub toggle_state: String,
}

/// Result of `ScrollElement`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollPosition {
    pub horizontal_percent: f64,
    pub vertical_percent: f64,
}

/// Result of `GetGridInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridInfo {
    pub row_count: usize,
    pub column_count: usize,
}
