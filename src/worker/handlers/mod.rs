//! Operation handlers, grouped by the control pattern they drive.
//!
//! Each handler projects the parameter bag into a small typed struct, makes
//! one backend call, and returns plain JSON. Backend errors convert through
//! `?` into `OperationError`, so no backend type escapes the worker.

mod builtin;
mod elements;
mod grid;
mod interaction;
mod selection;
mod text;
mod window;

use serde::Deserialize;

use super::dispatch::{OperationRegistry, RegistryError};

/// Register every operation the worker serves.
pub fn register_all(registry: &mut OperationRegistry) -> Result<(), RegistryError> {
    builtin::register(registry)?;
    elements::register(registry)?;
    interaction::register(registry)?;
    selection::register(registry)?;
    window::register(registry)?;
    text::register(registry)?;
    grid::register(registry)?;
    Ok(())
}

/// Parameters for operations that only need a target element.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ElementTarget {
    element_id: String,
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use serde_json::Value;

    use crate::backend::MemoryBackend;
    use crate::transport::protocol::OperationResponse;
    use crate::worker::dispatch::Dispatcher;

    /// A small desktop exercising every pattern.
    pub const DESKTOP: &str = r#"{
        "elements": [
            {"id": "MainWindow", "name": "Editor", "controlType": "Window",
             "patterns": ["Window", "Transform"],
             "bounds": {"x": 10, "y": 10, "width": 800, "height": 600}},
            {"id": "OkButton", "parentId": "MainWindow", "name": "OK",
             "controlType": "Button", "patterns": ["Invoke"]},
            {"id": "CancelButton", "parentId": "MainWindow", "name": "Cancel",
             "controlType": "Button", "patterns": ["Invoke"], "isEnabled": false},
            {"id": "WrapCheck", "parentId": "MainWindow", "name": "Word wrap",
             "controlType": "CheckBox", "patterns": ["Toggle"],
             "properties": {"ToggleState": "Off"}},
            {"id": "NameBox", "parentId": "MainWindow", "name": "Name",
             "controlType": "Edit", "patterns": ["Value", "Text"],
             "properties": {"Value": "hello world"}},
            {"id": "Zoom", "parentId": "MainWindow", "controlType": "Slider",
             "patterns": ["RangeValue"],
             "properties": {"RangeValue": 100, "Minimum": 10, "Maximum": 400}},
            {"id": "FileMenu", "parentId": "MainWindow", "name": "File",
             "controlType": "MenuItem", "patterns": ["ExpandCollapse"]},
            {"id": "Fonts", "parentId": "MainWindow", "controlType": "List",
             "patterns": ["Selection", "Scroll"]},
            {"id": "FontArial", "parentId": "Fonts", "name": "Arial",
             "controlType": "ListItem", "patterns": ["SelectionItem"]},
            {"id": "FontMono", "parentId": "Fonts", "name": "Mono",
             "controlType": "ListItem", "patterns": ["SelectionItem"]},
            {"id": "Sheet", "parentId": "MainWindow", "controlType": "DataGrid",
             "patterns": ["Grid", "Table"],
             "properties": {"ColumnHeaders": ["Name", "Size"]}},
            {"id": "Cell00", "parentId": "Sheet", "name": "a.txt",
             "controlType": "DataItem", "properties": {"Row": 0, "Column": 0}},
            {"id": "Cell01", "parentId": "Sheet", "name": "12 KB",
             "controlType": "DataItem", "properties": {"Row": 0, "Column": 1}},
            {"id": "Flaky", "parentId": "MainWindow", "name": "Flaky",
             "controlType": "Button", "patterns": ["Invoke"],
             "fault": {"kind": "error", "message": "RPC server unavailable"}}
        ]
    }"#;

    pub fn dispatcher() -> Dispatcher {
        let backend = MemoryBackend::from_json(DESKTOP).unwrap();
        Dispatcher::standard(Arc::new(backend)).unwrap()
    }

    pub fn call(dispatcher: &Dispatcher, operation: &str, parameters: Value) -> OperationResponse {
        let bag = parameters.as_object().cloned().unwrap_or_default();
        dispatcher.dispatch(operation, &bag)
    }
}
