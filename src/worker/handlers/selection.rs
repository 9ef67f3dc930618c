//! Selection-item and selection-container operations.

use serde_json::{json, Value};

use super::ElementTarget;
use crate::backend::Capability;
use crate::worker::dispatch::{OperationContext, OperationError, OperationRegistry, RegistryError};

pub(super) fn register(registry: &mut OperationRegistry) -> Result<(), RegistryError> {
    registry.register("SelectItem", select_item)?;
    registry.alias("Select", "SelectItem")?;
    registry.register("AddToSelection", add_to_selection)?;
    registry.register("RemoveFromSelection", remove_from_selection)?;
    registry.register("GetSelection", get_selection)?;
    Ok(())
}

fn select_item(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    ctx.backend.invoke(&p.element_id, &Capability::Select)?;
    Ok(json!("Item selected successfully"))
}

fn add_to_selection(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    ctx.backend.invoke(&p.element_id, &Capability::AddToSelection)?;
    Ok(json!("Item added to selection"))
}

fn remove_from_selection(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    ctx.backend.invoke(&p.element_id, &Capability::RemoveFromSelection)?;
    Ok(json!("Item removed from selection"))
}

/// `elementId` names the selection container, not an item.
fn get_selection(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    Ok(ctx.backend.invoke(&p.element_id, &Capability::GetSelection)?)
}
