//! Grid and table operations.

use serde::Deserialize;
use serde_json::Value;

use super::ElementTarget;
use crate::backend::Capability;
use crate::worker::dispatch::{OperationContext, OperationError, OperationRegistry, RegistryError};

pub(super) fn register(registry: &mut OperationRegistry) -> Result<(), RegistryError> {
    registry.register("GetGridInfo", get_grid_info)?;
    registry.register("GetGridItem", get_grid_item)?;
    registry.register("GetTableHeaders", get_table_headers)?;
    Ok(())
}

fn get_grid_info(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    Ok(ctx.backend.invoke(&p.element_id, &Capability::GetGridInfo)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridItemParams {
    element_id: String,
    row: usize,
    column: usize,
}

fn get_grid_item(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: GridItemParams = ctx.params()?;
    Ok(ctx.backend.invoke(
        &p.element_id,
        &Capability::GetGridItem {
            row: p.row,
            column: p.column,
        },
    )?)
}

fn get_table_headers(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    Ok(ctx.backend.invoke(&p.element_id, &Capability::GetTableHeaders)?)
}
