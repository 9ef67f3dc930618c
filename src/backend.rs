//! Automation backend trait and implementations.
//!
//! The backend is the native accessibility layer that actually finds and
//! manipulates UI elements. Every call may fail, block indefinitely, or take
//! the whole process down; the worker process exists so that none of that
//! reaches the host.

mod memory;

pub use memory::{Fault, FixtureElement, MemoryBackend};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors reported by a backend. Only the message and `kind()` cross the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("element '{0}' not found")]
    ElementNotFound(String),

    #[error("element '{element}' does not support {what}")]
    NotSupported { element: String, what: String },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Failed(String),
}

impl BackendError {
    /// Stable short name used in response diagnostics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ElementNotFound(_) => "not_found",
            Self::NotSupported { .. } => "not_supported",
            Self::AccessDenied(_) => "access_denied",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Failed(_) => "backend",
        }
    }
}

/// Where a search starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    /// Root element id; `None` searches the whole desktop.
    pub root: Option<String>,
    /// Search the full subtree rather than direct children only.
    pub descendants: bool,
}

impl Scope {
    pub const fn desktop() -> Self {
        Self {
            root: None,
            descendants: true,
        }
    }

    pub fn subtree(root: impl Into<String>) -> Self {
        Self {
            root: Some(root.into()),
            descendants: true,
        }
    }

    pub fn children(root: impl Into<String>) -> Self {
        Self {
            root: Some(root.into()),
            descendants: false,
        }
    }
}

/// Element search criteria. Unset fields match anything; set fields match
/// case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    pub name: Option<String>,
    pub automation_id: Option<String>,
    pub control_type: Option<String>,
    pub class_name: Option<String>,
    pub max_results: Option<usize>,
}

/// Screen rectangle in desktop coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Snapshot of an element as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementInfo {
    pub id: String,
    pub name: String,
    pub automation_id: String,
    pub control_type: String,
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub is_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Rect>,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowState {
    Normal,
    Minimized,
    Maximized,
}

impl WindowState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Minimized => "minimized",
            Self::Maximized => "maximized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// A named action on an element, tagged with the pattern it requires.
#[derive(Debug, Clone, PartialEq)]
pub enum Capability {
    Invoke,
    Toggle,
    Expand,
    Collapse,
    Select,
    AddToSelection,
    RemoveFromSelection,
    GetSelection,
    GetRangeValue,
    SetWindowState(WindowState),
    CloseWindow,
    Move { x: f64, y: f64 },
    Resize { width: f64, height: f64 },
    Scroll { direction: ScrollDirection, amount: f64 },
    GetText,
    SelectText { start: usize, length: usize },
    GetGridInfo,
    GetGridItem { row: usize, column: usize },
    GetTableHeaders,
}

impl Capability {
    /// The control pattern an element must expose for this action.
    pub const fn pattern(&self) -> &'static str {
        match self {
            Self::Invoke => "Invoke",
            Self::Toggle => "Toggle",
            Self::Expand | Self::Collapse => "ExpandCollapse",
            Self::Select | Self::AddToSelection | Self::RemoveFromSelection => "SelectionItem",
            Self::GetSelection => "Selection",
            Self::GetRangeValue => "RangeValue",
            Self::SetWindowState(_) | Self::CloseWindow => "Window",
            Self::Move { .. } | Self::Resize { .. } => "Transform",
            Self::Scroll { .. } => "Scroll",
            Self::GetText | Self::SelectText { .. } => "Text",
            Self::GetGridInfo | Self::GetGridItem { .. } => "Grid",
            Self::GetTableHeaders => "Table",
        }
    }
}

/// Native accessibility capability surface.
///
/// Calls are blocking and are only ever made from inside a single dispatch
/// handler, so the worker's error boundary and the host's deadline both apply.
pub trait AutomationBackend: Send + Sync {
    /// Find elements matching `criteria` within `scope`, in tree order.
    fn find_elements(
        &self,
        scope: &Scope,
        criteria: &SearchCriteria,
    ) -> Result<Vec<ElementInfo>, BackendError>;

    /// Describe a single element.
    fn element_info(&self, element_id: &str) -> Result<ElementInfo, BackendError>;

    /// Read a named property.
    fn get_property(&self, element_id: &str, property: &str) -> Result<Value, BackendError>;

    /// Write a named property.
    fn set_property(
        &self,
        element_id: &str,
        property: &str,
        value: Value,
    ) -> Result<(), BackendError>;

    /// Perform a capability and return whatever it produces.
    fn invoke(&self, element_id: &str, capability: &Capability) -> Result<Value, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_patterns() {
        assert_eq!(Capability::Invoke.pattern(), "Invoke");
        assert_eq!(Capability::Collapse.pattern(), "ExpandCollapse");
        assert_eq!(
            Capability::SetWindowState(WindowState::Maximized).pattern(),
            "Window"
        );
        assert_eq!(
            Capability::GetGridItem { row: 0, column: 1 }.pattern(),
            "Grid"
        );
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(BackendError::ElementNotFound("x".into()).kind(), "not_found");
        assert_eq!(BackendError::Failed("x".into()).kind(), "backend");
        assert_eq!(
            BackendError::NotSupported {
                element: "x".into(),
                what: "the Toggle pattern".into()
            }
            .to_string(),
            "element 'x' does not support the Toggle pattern"
        );
    }

    #[test]
    fn window_state_wire_names() {
        let state: WindowState = serde_json::from_str(r#""maximized""#).unwrap();
        assert_eq!(state, WindowState::Maximized);
        assert_eq!(state.as_str(), "maximized");
    }
}
