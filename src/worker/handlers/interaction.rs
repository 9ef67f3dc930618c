//! Invoke, toggle, expand/collapse, value and range-value operations.

use serde::Deserialize;
use serde_json::{json, Value};

use super::ElementTarget;
use crate::backend::Capability;
use crate::worker::dispatch::{OperationContext, OperationError, OperationRegistry, RegistryError};

pub(super) fn register(registry: &mut OperationRegistry) -> Result<(), RegistryError> {
    registry.register("Invoke", invoke)?;
    registry.alias("Click", "Invoke")?;
    registry.register("Toggle", toggle)?;
    registry.register("GetToggleState", get_toggle_state)?;
    registry.register("Expand", expand)?;
    registry.register("Collapse", collapse)?;
    registry.register("SetValue", set_value)?;
    registry.register("GetValue", get_value)?;
    registry.register("SetRangeValue", set_range_value)?;
    registry.register("GetRangeValue", get_range_value)?;
    Ok(())
}

fn invoke(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    ctx.backend.invoke(&p.element_id, &Capability::Invoke)?;
    Ok(json!("Element invoked successfully"))
}

fn toggle(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    let state = ctx.backend.invoke(&p.element_id, &Capability::Toggle)?;
    Ok(json!({ "toggleState": state }))
}

fn get_toggle_state(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    let state = ctx.backend.get_property(&p.element_id, "ToggleState")?;
    Ok(json!({ "toggleState": state }))
}

fn expand(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    let state = ctx.backend.invoke(&p.element_id, &Capability::Expand)?;
    Ok(json!({ "expandCollapseState": state }))
}

fn collapse(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    let state = ctx.backend.invoke(&p.element_id, &Capability::Collapse)?;
    Ok(json!({ "expandCollapseState": state }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetValueParams {
    element_id: String,
    value: String,
}

fn set_value(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: SetValueParams = ctx.params()?;
    ctx.backend.set_property(&p.element_id, "Value", json!(p.value))?;
    Ok(json!("Value set successfully"))
}

fn get_value(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    Ok(ctx.backend.get_property(&p.element_id, "Value")?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangeValueParams {
    element_id: String,
    value: f64,
}

fn set_range_value(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: RangeValueParams = ctx.params()?;
    if !p.value.is_finite() {
        return Err(OperationError::invalid(ctx.operation, "value must be a finite number"));
    }
    ctx.backend.set_property(&p.element_id, "RangeValue", json!(p.value))?;
    Ok(json!("Range value set successfully"))
}

fn get_range_value(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    Ok(ctx.backend.invoke(&p.element_id, &Capability::GetRangeValue)?)
}

#[cfg(test)]
mod tests {
    use crate::worker::handlers::testing::{call, dispatcher};
    use serde_json::json;

    #[test]
    fn click_alias_invokes() {
        let resp = call(&dispatcher(), "click", json!({"elementId": "OkButton"}));
        assert_eq!(resp.data, json!("Element invoked successfully"));
    }

    #[test]
    fn invoke_requires_element_id() {
        let resp = call(&dispatcher(), "Invoke", json!({}));
        assert_eq!(resp.error.as_deref(), Some("elementId is required for Invoke"));
        assert_eq!(resp.error_type(), Some("validation"));
    }

    #[test]
    fn disabled_element_is_access_denied() {
        let resp = call(&dispatcher(), "Invoke", json!({"elementId": "CancelButton"}));
        assert_eq!(resp.error_type(), Some("access_denied"));
    }

    #[test]
    fn toggle_flips_state() {
        let d = dispatcher();
        let resp = call(&d, "Toggle", json!({"elementId": "WrapCheck"}));
        assert_eq!(resp.data, json!({"toggleState": "On"}));
        let resp = call(&d, "GetToggleState", json!({"elementId": "WrapCheck"}));
        assert_eq!(resp.data, json!({"toggleState": "On"}));
    }

    #[test]
    fn toggle_unsupported_pattern() {
        let resp = call(&dispatcher(), "Toggle", json!({"elementId": "OkButton"}));
        assert_eq!(
            resp.error.as_deref(),
            Some("element 'OkButton' does not support the Toggle pattern")
        );
        assert_eq!(resp.error_type(), Some("not_supported"));
    }

    #[test]
    fn expand_then_collapse() {
        let d = dispatcher();
        let resp = call(&d, "Expand", json!({"elementId": "FileMenu"}));
        assert_eq!(resp.data["expandCollapseState"], "Expanded");
        let resp = call(&d, "Collapse", json!({"elementId": "FileMenu"}));
        assert_eq!(resp.data["expandCollapseState"], "Collapsed");
    }

    #[test]
    fn set_and_get_value() {
        let d = dispatcher();
        let resp = call(&d, "SetValue", json!({"elementId": "NameBox", "value": "bye"}));
        assert_eq!(resp.data, json!("Value set successfully"));
        let resp = call(&d, "GetValue", json!({"elementId": "NameBox"}));
        assert_eq!(resp.data, json!("bye"));
    }

    #[test]
    fn set_value_wrong_type_is_validation_error() {
        let resp = call(&dispatcher(), "SetValue", json!({"elementId": "NameBox", "value": 3}));
        assert_eq!(resp.error_type(), Some("validation"));
        assert!(resp
            .error
            .unwrap()
            .starts_with("invalid parameters for SetValue:"));
    }

    #[test]
    fn range_value_bounds() {
        let d = dispatcher();
        let resp = call(&d, "SetRangeValue", json!({"elementId": "Zoom", "value": 150}));
        assert!(resp.is_success());
        let resp = call(&d, "GetRangeValue", json!({"elementId": "Zoom"}));
        assert_eq!(resp.data["value"].as_f64(), Some(150.0));
        assert_eq!(resp.data["maximum"], json!(400));

        let resp = call(&d, "SetRangeValue", json!({"elementId": "Zoom", "value": 500}));
        assert_eq!(resp.error_type(), Some("invalid_argument"));
    }

    #[test]
    fn range_value_on_plain_button_is_not_supported() {
        let resp = call(&dispatcher(), "GetRangeValue", json!({"elementId": "OkButton"}));
        assert!(!resp.success);
        assert_eq!(resp.error_type(), Some("not_supported"));
    }
}
