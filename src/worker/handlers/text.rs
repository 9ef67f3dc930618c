//! Text pattern operations.

use serde::Deserialize;
use serde_json::{json, Value};

use super::ElementTarget;
use crate::backend::Capability;
use crate::worker::dispatch::{OperationContext, OperationError, OperationRegistry, RegistryError};

pub(super) fn register(registry: &mut OperationRegistry) -> Result<(), RegistryError> {
    registry.register("GetText", get_text)?;
    registry.register("SelectText", select_text)?;
    Ok(())
}

fn get_text(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    Ok(ctx.backend.invoke(&p.element_id, &Capability::GetText)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectTextParams {
    element_id: String,
    start_index: usize,
    length: usize,
}

fn select_text(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: SelectTextParams = ctx.params()?;
    let selected = ctx.backend.invoke(
        &p.element_id,
        &Capability::SelectText {
            start: p.start_index,
            length: p.length,
        },
    )?;
    Ok(json!({ "selectedText": selected }))
}

#[cfg(test)]
mod tests {
    use crate::worker::handlers::testing::{call, dispatcher};
    use serde_json::json;

    #[test]
    fn get_text_falls_back_to_value() {
        let resp = call(&dispatcher(), "GetText", json!({"elementId": "NameBox"}));
        assert_eq!(resp.data, json!("hello world"));
    }

    #[test]
    fn select_text_range() {
        let d = dispatcher();
        let resp = call(
            &d,
            "SelectText",
            json!({"elementId": "NameBox", "startIndex": 0, "length": 5}),
        );
        assert_eq!(resp.data, json!({"selectedText": "hello"}));

        let resp = call(
            &d,
            "SelectText",
            json!({"elementId": "NameBox", "startIndex": 8, "length": 10}),
        );
        assert_eq!(resp.error_type(), Some("invalid_argument"));

        let resp = call(&d, "SelectText", json!({"elementId": "NameBox", "length": 1}));
        assert_eq!(resp.error.as_deref(), Some("startIndex is required for SelectText"));
    }
}
