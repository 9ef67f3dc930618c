//! Operations answered by the worker itself, without touching the backend.

use serde_json::{json, Value};

use crate::worker::dispatch::{OperationContext, OperationError, OperationRegistry, RegistryError};

pub(super) fn register(registry: &mut OperationRegistry) -> Result<(), RegistryError> {
    registry.register("Ping", ping)?;
    registry.register("ListOperations", list_operations)?;
    registry.alias("GetCapabilities", "ListOperations")?;
    Ok(())
}

/// Liveness probe; the host sends this to every freshly spawned worker.
fn ping(_ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    Ok(json!("pong"))
}

fn list_operations(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let mut operations: Vec<Value> = ctx
        .registry
        .operations()
        .iter()
        .map(|op| json!({ "name": op.name, "aliases": op.aliases }))
        .collect();
    operations.sort_by_key(|op| op["name"].as_str().unwrap_or_default().to_ascii_lowercase());
    Ok(Value::Array(operations))
}

#[cfg(test)]
mod tests {
    use crate::worker::handlers::testing::{call, dispatcher};
    use serde_json::json;

    #[test]
    fn ping_pongs() {
        let resp = call(&dispatcher(), "ping", json!({}));
        assert_eq!(resp.data, json!("pong"));
    }

    #[test]
    fn list_operations_includes_aliases() {
        let resp = call(&dispatcher(), "ListOperations", json!({}));
        let ops = resp.data.as_array().unwrap();
        let invoke = ops.iter().find(|op| op["name"] == "Invoke").unwrap();
        assert_eq!(invoke["aliases"], json!(["Click"]));
        assert!(ops.iter().any(|op| op["name"] == "Ping"));
    }
}
