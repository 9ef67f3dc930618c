//! Element discovery: search, inspection, and waiting for elements to appear.

use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};

use super::ElementTarget;
use crate::backend::{Scope, SearchCriteria};
use crate::worker::dispatch::{OperationContext, OperationError, OperationRegistry, RegistryError};

const DEFAULT_MAX_RESULTS: usize = 100;
const DEFAULT_WAIT_SECONDS: u64 = 10;
const DEFAULT_POLL_MS: u64 = 250;

pub(super) fn register(registry: &mut OperationRegistry) -> Result<(), RegistryError> {
    registry.register("FindElements", find_elements)?;
    registry.alias("Search", "FindElements")?;
    registry.register("GetElementInfo", get_element_info)?;
    registry.alias("GetElementProperties", "GetElementInfo")?;
    registry.register("GetProperty", get_property)?;
    registry.register("WaitForElement", wait_for_element)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SearchDepth {
    Children,
    #[default]
    Descendants,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    automation_id: Option<String>,
    #[serde(default)]
    control_type: Option<String>,
    #[serde(default)]
    class_name: Option<String>,
    /// Root of the search; the whole desktop when absent.
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    scope: SearchDepth,
    #[serde(default)]
    max_results: Option<usize>,
}

impl SearchParams {
    fn scope(&self) -> Scope {
        Scope {
            root: self.parent_id.clone(),
            descendants: matches!(self.scope, SearchDepth::Descendants),
        }
    }

    fn criteria(&self, operation: &str) -> Result<SearchCriteria, OperationError> {
        let max_results = self.max_results.unwrap_or(DEFAULT_MAX_RESULTS);
        if max_results == 0 {
            return Err(OperationError::invalid(operation, "maxResults must be at least 1"));
        }
        Ok(SearchCriteria {
            name: self.name.clone(),
            automation_id: self.automation_id.clone(),
            control_type: self.control_type.clone(),
            class_name: self.class_name.clone(),
            max_results: Some(max_results),
        })
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = [
            ("name", &self.name),
            ("automationId", &self.automation_id),
            ("controlType", &self.control_type),
            ("className", &self.class_name),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| format!("{key}={v}")))
        .collect();
        if parts.is_empty() {
            "any element".to_string()
        } else {
            parts.join(", ")
        }
    }
}

fn find_elements(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: SearchParams = ctx.params()?;
    let found = ctx.backend.find_elements(&p.scope(), &p.criteria(ctx.operation)?)?;
    Ok(json!(found))
}

fn get_element_info(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: ElementTarget = ctx.params()?;
    Ok(json!(ctx.backend.element_info(&p.element_id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertyParams {
    element_id: String,
    property: String,
}

fn get_property(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: PropertyParams = ctx.params()?;
    Ok(ctx.backend.get_property(&p.element_id, &p.property)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitParams {
    #[serde(flatten)]
    search: SearchParams,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
}

/// Polls the backend until a match appears. The host deadline still applies
/// on top of this internal bound.
fn wait_for_element(ctx: &OperationContext<'_>) -> Result<Value, OperationError> {
    let p: WaitParams = ctx.params()?;
    let timeout = Duration::from_secs(p.timeout_seconds.unwrap_or(DEFAULT_WAIT_SECONDS));
    let poll = Duration::from_millis(p.poll_interval_ms.unwrap_or(DEFAULT_POLL_MS).max(10));
    let scope = p.search.scope();
    let criteria = SearchCriteria {
        max_results: Some(1),
        ..p.search.criteria(ctx.operation)?
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(element) = ctx.backend.find_elements(&scope, &criteria)?.into_iter().next() {
            return Ok(json!(element));
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(OperationError::Failed(format!(
                "no element matching {} appeared within {}s",
                p.search.describe(),
                timeout.as_secs()
            )));
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}
