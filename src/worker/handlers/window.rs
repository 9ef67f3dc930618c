//! Window state, transform, and scroll operations.

use serde::Deserialize;
use serde_json::{json, Value};

use super::ElementTarget;
use crate::backend::{Capability, ScrollDirection, WindowState};
use crate::worker::dispatch::{OperationContext, OperationError, OperationRegistry, RegistryError};

pub(super) fn register(registry: &mut OperationRegistry) -> Result<(), RegistryError> {
    registry.register("SetWindowState", set_window_state)?;
    registry.register("CloseWindow", close_window)?;
    registry.register("MoveElement", move_element)?;
    registry.register("ResizeElement", resize_element)?;
    registry.register("ScrollElement", scroll_element)?;
    registry.alias("Scroll", "ScrollElement")?;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WindowStateParams {
    element_id: String,
    state: WindowState,
}

fn set_window_state(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: WindowStateParams = ctx.params()?;
    let state = ctx
        .backend
        .invoke(&p.element_id, &Capability::SetWindowState(p.state))?;
    Ok(json!({ "windowState": state }))
}

fn close_window(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    ctx.backend.invoke(&p.element_id, &Capability::CloseWindow)?;
    Ok(json!("Window closed successfully"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveParams {
    element_id: String,
    x: f64,
    y: f64,
}

fn move_element(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: MoveParams = ctx.params()?;
    Ok(ctx
        .backend
        .invoke(&p.element_id, &Capability::Move { x: p.x, y: p.y })?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResizeParams {
    element_id: String,
    width: f64,
    height: f64,
}

fn resize_element(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ResizeParams = ctx.params()?;
    if p.width <= 0.0 || p.height <= 0.0 {
        return Err(OperationError::invalid(
            ctx.operation,
            "width and height must be positive",
        ));
    }
    Ok(ctx.backend.invoke(
        &p.element_id,
        &Capability::Resize {
            width: p.width,
            height: p.height,
        },
    )?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrollParams {
    element_id: String,
    direction: ScrollDirection,
    #[serde(default)]
    amount: Option<f64>,
}

fn scroll_element(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ScrollParams = ctx.params()?;
    let amount = p.amount.unwrap_or(1.0);
    if !(amount.is_finite() && amount > 0.0) {
        return Err(OperationError::invalid(ctx.operation, "amount must be positive"));
    }
    Ok(ctx.backend.invoke(
        &p.element_id,
        &Capability::Scroll {
            direction: p.direction,
            amount,
        },
    )?)
}

#[cfg(test)]
mod tests {
    use crate::worker::handlers::testing::{call, dispatcher};
    use serde_json::json;

    #[test]
    fn window_state_round_trip() {
        let d = dispatcher();
        let resp = call(
            &d,
            "SetWindowState",
            json!({"elementId": "MainWindow", "state": "maximized"}),
        );
        assert_eq!(resp.data, json!({"windowState": "maximized"}));

        let resp = call(
            &d,
            "SetWindowState",
            json!({"elementId": "MainWindow", "state": "fullscreen"}),
        );
        assert_eq!(resp.error_type(), Some("validation"));
    }

    #[test]
    fn move_and_resize_update_bounds() {
        let d = dispatcher();
        let resp = call(&d, "MoveElement", json!({"elementId": "MainWindow", "x": 50, "y": 60}));
        assert_eq!(resp.data["x"].as_f64(), Some(50.0));
        assert_eq!(resp.data["width"].as_f64(), Some(800.0));

        let resp = call(
            &d,
            "ResizeElement",
            json!({"elementId": "MainWindow", "width": 640, "height": 480}),
        );
        assert_eq!(resp.data["height"].as_f64(), Some(480.0));
        assert_eq!(resp.data["y"].as_f64(), Some(60.0));

        let resp = call(
            &d,
            "ResizeElement",
            json!({"elementId": "MainWindow", "width": 0, "height": 480}),
        );
        assert_eq!(resp.error_type(), Some("validation"));
    }

    #[test]
    fn scroll_clamps() {
        let d = dispatcher();
        let resp = call(
            &d,
            "Scroll",
            json!({"elementId": "Fonts", "direction": "down", "amount": 3}),
        );
        assert_eq!(resp.data["verticalPercent"].as_f64(), Some(30.0));
        let resp = call(
            &d,
            "ScrollElement",
            json!({"elementId": "Fonts", "direction": "up", "amount": 9}),
        );
        assert_eq!(resp.data["verticalPercent"].as_f64(), Some(0.0));
    }

    #[test]
    fn close_window_removes_children() {
        let d = dispatcher();
        let resp = call(&d, "CloseWindow", json!({"elementId": "MainWindow"}));
        assert!(resp.is_success());
        let resp = call(&d, "GetElementInfo", json!({"elementId": "OkButton"}));
        assert_eq!(resp.error_type(), Some("not_found"));
    }
}
