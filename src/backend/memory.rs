//! In-memory backend driven by a JSON desktop fixture.
//!
//! Models a desktop as a flat list of elements linked by `parentId`, in tree
//! order. Used on hosts without a native accessibility layer and in tests.
//! Elements can carry a `fault` that makes any action on them hang, abort the
//! process, or fail, which is how a misbehaving native call is reproduced.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{
    AutomationBackend, BackendError, Capability, ElementInfo, Rect, Scope, ScrollDirection,
    SearchCriteria,
};

/// Percentage moved per scroll unit.
const SCROLL_STEP_PERCENT: f64 = 10.0;

/// Simulated native failure attached to an element.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Fault {
    /// Block the calling thread forever.
    Hang,
    /// Abort the whole process.
    Crash,
    /// Fail with the given message.
    Error { message: String },
}

/// One element as written in a fixture file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureElement {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub automation_id: Option<String>,
    #[serde(default = "default_control_type")]
    pub control_type: String,
    #[serde(default)]
    pub class_name: String,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default)]
    pub bounds: Option<Rect>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub fault: Option<Fault>,
}

fn default_control_type() -> String {
    "Custom".into()
}

const fn default_enabled() -> bool {
    true
}

impl FixtureElement {
    fn info(&self) -> ElementInfo {
        ElementInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            automation_id: self.automation_id.clone().unwrap_or_else(|| self.id.clone()),
            control_type: self.control_type.clone(),
            class_name: self.class_name.clone(),
            parent_id: self.parent_id.clone(),
            is_enabled: self.is_enabled,
            bounds: self.bounds,
            patterns: self.patterns.clone(),
        }
    }

    fn supports(&self, pattern: &str) -> bool {
        self.patterns.iter().any(|p| p.eq_ignore_ascii_case(pattern))
    }

    fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).or_else(|| {
            self.properties
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    fn matches(&self, criteria: &SearchCriteria) -> bool {
        fn eq(wanted: Option<&String>, actual: &str) -> bool {
            wanted.map_or(true, |w| w.eq_ignore_ascii_case(actual))
        }
        let automation_id = self.automation_id.as_deref().unwrap_or(&self.id);
        eq(criteria.name.as_ref(), &self.name)
            && eq(criteria.automation_id.as_ref(), automation_id)
            && eq(criteria.control_type.as_ref(), &self.control_type)
            && eq(criteria.class_name.as_ref(), &self.class_name)
    }
}

#[derive(Debug, Default, Deserialize)]
struct Fixture {
    #[serde(default)]
    elements: Vec<FixtureElement>,
}

/// Backend over an in-memory element tree.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    elements: Mutex<Vec<FixtureElement>>,
}

impl MemoryBackend {
    /// An empty desktop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from elements in tree order.
    pub fn with_elements(elements: Vec<FixtureElement>) -> Self {
        Self {
            elements: Mutex::new(elements),
        }
    }

    /// Parse a fixture document: `{"elements": [...]}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let fixture: Fixture =
            serde_json::from_str(json).context("Failed to parse desktop fixture")?;
        Ok(Self::with_elements(fixture.elements))
    }

    /// Load a fixture file.
    pub fn from_fixture_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read desktop fixture: {}", path.display()))?;
        let backend = Self::from_json(&json)?;
        debug!(path = %path.display(), elements = backend.lock().len(), "Loaded desktop fixture");
        Ok(backend)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FixtureElement>> {
        self.elements.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check existence, enablement and pattern support, returning the fault
    /// to fire. The lock is released before the fault runs.
    fn preflight(&self, element_id: &str, pattern: &str) -> Result<Option<Fault>, BackendError> {
        let elements = self.lock();
        let element = find(&elements, element_id)?;
        if !element.is_enabled {
            return Err(BackendError::AccessDenied(format!(
                "element '{element_id}' is disabled"
            )));
        }
        if !element.supports(pattern) {
            return Err(BackendError::NotSupported {
                element: element_id.to_string(),
                what: format!("the {pattern} pattern"),
            });
        }
        Ok(element.fault.clone())
    }
}

fn find<'a>(elements: &'a [FixtureElement], id: &str) -> Result<&'a FixtureElement, BackendError> {
    elements
        .iter()
        .find(|e| e.id == id)
        .ok_or_else(|| BackendError::ElementNotFound(id.to_string()))
}

fn find_mut<'a>(
    elements: &'a mut [FixtureElement],
    id: &str,
) -> Result<&'a mut FixtureElement, BackendError> {
    elements
        .iter_mut()
        .find(|e| e.id == id)
        .ok_or_else(|| BackendError::ElementNotFound(id.to_string()))
}

/// Whether `element` sits below `root`. Bounded walk so a cyclic fixture
/// cannot loop forever.
fn is_descendant(elements: &[FixtureElement], element: &FixtureElement, root: &str) -> bool {
    let mut parent = element.parent_id.as_deref();
    for _ in 0..elements.len() {
        match parent {
            Some(p) if p == root => return true,
            Some(p) => {
                parent = elements.iter().find(|e| e.id == p).and_then(|e| e.parent_id.as_deref());
            }
            None => return false,
        }
    }
    false
}

fn fire(fault: Option<Fault>, element_id: &str) -> Result<(), BackendError> {
    match fault {
        None => Ok(()),
        Some(Fault::Hang) => {
            warn!(element = %element_id, "Simulated hang");
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }
        Some(Fault::Crash) => {
            warn!(element = %element_id, "Simulated crash");
            std::process::abort();
        }
        Some(Fault::Error { message }) => Err(BackendError::Failed(message)),
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64)
}

fn text_of(element: &FixtureElement) -> String {
    element
        .property("Text")
        .or_else(|| element.property("Value"))
        .and_then(Value::as_str)
        .map_or_else(|| element.name.clone(), str::to_string)
}

fn grid_position(element: &FixtureElement) -> Option<(usize, usize)> {
    let row = element.property("Row")?.as_u64()?;
    let column = element.property("Column")?.as_u64()?;
    Some((usize::try_from(row).ok()?, usize::try_from(column).ok()?))
}

impl AutomationBackend for MemoryBackend {
    fn find_elements(
        &self,
        scope: &Scope,
        criteria: &SearchCriteria,
    ) -> Result<Vec<ElementInfo>, BackendError> {
        let elements = self.lock();
        if let Some(root) = &scope.root {
            find(&elements, root)?;
        }

        let limit = criteria.max_results.unwrap_or(usize::MAX);
        let found = elements
            .iter()
            .filter(|e| match &scope.root {
                None => true,
                Some(root) if scope.descendants => is_descendant(&elements, e, root),
                Some(root) => e.parent_id.as_deref() == Some(root.as_str()),
            })
            .filter(|e| e.matches(criteria))
            .take(limit)
            .map(FixtureElement::info)
            .collect();
        Ok(found)
    }

    fn element_info(&self, element_id: &str) -> Result<ElementInfo, BackendError> {
        let elements = self.lock();
        find(&elements, element_id).map(FixtureElement::info)
    }

    fn get_property(&self, element_id: &str, property: &str) -> Result<Value, BackendError> {
        let elements = self.lock();
        let element = find(&elements, element_id)?;
        let value = match property {
            "Name" => json!(element.name),
            "AutomationId" => json!(element.automation_id.as_deref().unwrap_or(&element.id)),
            "ControlType" => json!(element.control_type),
            "ClassName" => json!(element.class_name),
            "IsEnabled" => json!(element.is_enabled),
            "ParentId" => json!(element.parent_id),
            "BoundingRectangle" => json!(element.bounds),
            other => element.property(other).cloned().ok_or_else(|| BackendError::NotSupported {
                element: element_id.to_string(),
                what: format!("property '{other}'"),
            })?,
        };
        Ok(value)
    }

    fn set_property(
        &self,
        element_id: &str,
        property: &str,
        value: Value,
    ) -> Result<(), BackendError> {
        let pattern = match property {
            "Value" => "Value",
            "RangeValue" => "RangeValue",
            other => {
                return Err(BackendError::NotSupported {
                    element: element_id.to_string(),
                    what: format!("writing property '{other}'"),
                })
            }
        };
        let fault = self.preflight(element_id, pattern)?;
        fire(fault, element_id)?;

        let mut elements = self.lock();
        let element = find_mut(&mut elements, element_id)?;
        if element.property("IsReadOnly").and_then(Value::as_bool) == Some(true) {
            return Err(BackendError::AccessDenied(format!(
                "element '{element_id}' is read-only"
            )));
        }

        if pattern == "RangeValue" {
            let n = value.as_f64().ok_or_else(|| {
                BackendError::InvalidArgument("range value must be a number".into())
            })?;
            let min = number(element.property("Minimum")).unwrap_or(f64::MIN);
            let max = number(element.property("Maximum")).unwrap_or(f64::MAX);
            if n < min || n > max {
                return Err(BackendError::InvalidArgument(format!(
                    "{n} is outside the range {min}..={max}"
                )));
            }
        }

        element.properties.insert(property.to_string(), value);
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn invoke(&self, element_id: &str, capability: &Capability) -> Result<Value, BackendError> {
        let fault = self.preflight(element_id, capability.pattern())?;
        fire(fault, element_id)?;

        let mut elements = self.lock();
        match capability {
            Capability::Invoke => {
                find(&elements, element_id)?;
                Ok(Value::Null)
            }
            Capability::Toggle => {
                let element = find_mut(&mut elements, element_id)?;
                let next = match element.property("ToggleState").and_then(Value::as_str) {
                    Some("On") => "Off",
                    _ => "On",
                };
                element.properties.insert("ToggleState".into(), json!(next));
                Ok(json!(next))
            }
            Capability::Expand | Capability::Collapse => {
                let element = find_mut(&mut elements, element_id)?;
                let state = if *capability == Capability::Expand {
                    "Expanded"
                } else {
                    "Collapsed"
                };
                element.properties.insert("ExpandCollapseState".into(), json!(state));
                Ok(json!(state))
            }
            Capability::Select => {
                let parent = find(&elements, element_id)?.parent_id.clone();
                for e in elements.iter_mut() {
                    if e.id == element_id {
                        e.properties.insert("IsSelected".into(), json!(true));
                    } else if parent.is_some() && e.parent_id == parent {
                        e.properties.insert("IsSelected".into(), json!(false));
                    }
                }
                Ok(Value::Null)
            }
            Capability::AddToSelection | Capability::RemoveFromSelection => {
                let selected = *capability == Capability::AddToSelection;
                let element = find_mut(&mut elements, element_id)?;
                element.properties.insert("IsSelected".into(), json!(selected));
                Ok(Value::Null)
            }
            Capability::GetSelection => {
                let selected: Vec<ElementInfo> = elements
                    .iter()
                    .filter(|e| e.parent_id.as_deref() == Some(element_id))
                    .filter(|e| e.property("IsSelected").and_then(Value::as_bool) == Some(true))
                    .map(FixtureElement::info)
                    .collect();
                Ok(json!(selected))
            }
            Capability::GetRangeValue => {
                let element = find(&elements, element_id)?;
                Ok(json!({
                    "value": element.property("RangeValue").cloned().unwrap_or(Value::Null),
                    "minimum": element.property("Minimum").cloned().unwrap_or(Value::Null),
                    "maximum": element.property("Maximum").cloned().unwrap_or(Value::Null),
                }))
            }
            Capability::SetWindowState(state) => {
                let element = find_mut(&mut elements, element_id)?;
                element
                    .properties
                    .insert("WindowVisualState".into(), json!(state.as_str()));
                Ok(json!(state.as_str()))
            }
            Capability::CloseWindow => {
                let doomed: Vec<String> = elements
                    .iter()
                    .filter(|e| e.id == element_id || is_descendant(&elements, e, element_id))
                    .map(|e| e.id.clone())
                    .collect();
                elements.retain(|e| !doomed.contains(&e.id));
                Ok(Value::Null)
            }
            Capability::Move { x, y } => {
                let element = find_mut(&mut elements, element_id)?;
                let mut bounds = element.bounds.unwrap_or_default();
                bounds.x = *x;
                bounds.y = *y;
                element.bounds = Some(bounds);
                Ok(json!(bounds))
            }
            Capability::Resize { width, height } => {
                if *width < 0.0 || *height < 0.0 {
                    return Err(BackendError::InvalidArgument(
                        "width and height must be non-negative".into(),
                    ));
                }
                let element = find_mut(&mut elements, element_id)?;
                let mut bounds = element.bounds.unwrap_or_default();
                bounds.width = *width;
                bounds.height = *height;
                element.bounds = Some(bounds);
                Ok(json!(bounds))
            }
            Capability::Scroll { direction, amount } => {
                let element = find_mut(&mut elements, element_id)?;
                let (key, sign): (&str, f64) = match direction {
                    ScrollDirection::Up => ("VerticalScrollPercent", -1.0),
                    ScrollDirection::Down => ("VerticalScrollPercent", 1.0),
                    ScrollDirection::Left => ("HorizontalScrollPercent", -1.0),
                    ScrollDirection::Right => ("HorizontalScrollPercent", 1.0),
                };
                let current = number(element.property(key)).unwrap_or(0.0);
                let next = sign.mul_add(amount * SCROLL_STEP_PERCENT, current).clamp(0.0, 100.0);
                element.properties.insert(key.into(), json!(next));
                let percent = |key: &str| number(element.property(key)).unwrap_or(0.0);
                Ok(json!({
                    "horizontalPercent": percent("HorizontalScrollPercent"),
                    "verticalPercent": percent("VerticalScrollPercent"),
                }))
            }
            Capability::GetText => Ok(json!(text_of(find(&elements, element_id)?))),
            Capability::SelectText { start, length } => {
                let element = find_mut(&mut elements, element_id)?;
                let text: Vec<char> = text_of(element).chars().collect();
                let end = start
                    .checked_add(*length)
                    .filter(|end| *end <= text.len())
                    .ok_or_else(|| {
                        BackendError::InvalidArgument(format!(
                            "range {start}+{length} exceeds text length {}",
                            text.len()
                        ))
                    })?;
                let selected: String = text[*start..end].iter().collect();
                element.properties.insert("SelectedText".into(), json!(selected));
                Ok(json!(selected))
            }
            Capability::GetGridInfo => {
                let element = find(&elements, element_id)?;
                let cells: Vec<(usize, usize)> = elements
                    .iter()
                    .filter(|e| e.parent_id.as_deref() == Some(element_id))
                    .filter_map(grid_position)
                    .collect();
                let rows = element
                    .property("RowCount")
                    .and_then(Value::as_u64)
                    .map_or_else(
                        || cells.iter().map(|c| c.0 + 1).max().unwrap_or(0),
                        |n| usize::try_from(n).unwrap_or(usize::MAX),
                    );
                let columns = element
                    .property("ColumnCount")
                    .and_then(Value::as_u64)
                    .map_or_else(
                        || cells.iter().map(|c| c.1 + 1).max().unwrap_or(0),
                        |n| usize::try_from(n).unwrap_or(usize::MAX),
                    );
                Ok(json!({ "rowCount": rows, "columnCount": columns }))
            }
            Capability::GetGridItem { row, column } => elements
                .iter()
                .filter(|e| e.parent_id.as_deref() == Some(element_id))
                .find(|e| grid_position(e) == Some((*row, *column)))
                .map(|e| json!(e.info()))
                .ok_or_else(|| {
                    BackendError::ElementNotFound(format!("{element_id}[{row},{column}]"))
                }),
            Capability::GetTableHeaders => {
                let element = find(&elements, element_id)?;
                let headers =
                    |key: &str| element.property(key).cloned().unwrap_or_else(|| json!([]));
                Ok(json!({
                    "rowHeaders": headers("RowHeaders"),
                    "columnHeaders": headers("ColumnHeaders"),
                }))
            }
        }
    }
}
