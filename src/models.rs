//! Data models for control server responses.
//!
//! Wire names are PascalCase (`Name`, `ID`, `Type`); the structs map them
//! with serde renames. Response shapes that vary between server firmware
//! versions are decoded here, once, into a single representation.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

/// Component types that accept script deployment.
pub const DEPLOYABLE_COMPONENT_TYPES: [&str; 3] = [
    "device_controller_script",
    "control_script_2",
    "scriptable_controls",
];

/// A named unit on the control server, as returned by
/// `Component.GetComponents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(
        rename = "ID",
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,

    #[serde(rename = "Type", default)]
    pub component_type: String,

    #[serde(rename = "Properties", default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<Value>,
}

impl Component {
    /// Whether this component's type is on the deployment allow-list.
    pub fn is_deployable(&self) -> bool {
        DEPLOYABLE_COMPONENT_TYPES.contains(&self.component_type.as_str())
    }
}

/// Accept `"ID": "abc"`, `"ID": 12`, or `"ID": null`.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Keep an explicit `null` as `Some(Value::Null)`; only a missing field
/// is `None`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// The two shapes `Component.GetComponents` is known to return.
///
/// Entries are kept as raw JSON so one malformed component does not hide
/// the rest of the list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ComponentList {
    /// `[{...}, {...}]`
    Bare(Vec<Value>),
    /// `{"Components": [{...}, {...}]}`
    Wrapped {
        #[serde(rename = "Components")]
        components: Vec<Value>,
    },
}

impl ComponentList {
    /// Decode a `Component.GetComponents` result into an ordered list.
    ///
    /// Unrecognized shapes yield an empty list and a warning. Within a
    /// recognized list, entries that do not decode are skipped with a
    /// warning and the others are kept in order.
    pub fn from_result(result: Value) -> Vec<Component> {
        let entries = match serde_json::from_value::<ComponentList>(result) {
            Ok(ComponentList::Bare(entries)) => entries,
            Ok(ComponentList::Wrapped { components }) => components,
            Err(e) => {
                warn!("Unrecognized component list shape: {}", e);
                return Vec::new();
            }
        };

        entries
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| match serde_json::from_value::<Component>(entry) {
                Ok(component) => Some(component),
                Err(e) => {
                    warn!("Skipping malformed component at index {}: {}", index, e);
                    None
                }
            })
            .collect()
    }
}

/// Find `target` by component name, falling back to component ID.
///
/// Names are searched first across the whole list; the first match in
/// enumeration order wins.
pub fn find_component<'a>(components: &'a [Component], target: &str) -> Option<&'a Component> {
    components
        .iter()
        .find(|c| c.name == target)
        .or_else(|| components.iter().find(|c| c.id.as_deref() == Some(target)))
}

/// One control inside a `Component.Get` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    #[serde(rename = "Name")]
    pub name: String,

    /// `Some(Value::Null)` when the server sent an explicit null.
    #[serde(rename = "Value", default, deserialize_with = "present")]
    pub value: Option<Value>,

    #[serde(rename = "String", default)]
    pub string: Option<String>,
}

impl ControlState {
    /// The control's value, preferring `Value` over its `String` rendering.
    pub fn into_value(self) -> Value {
        match (self.value, self.string) {
            (Some(value), _) => value,
            (None, Some(string)) => Value::String(string),
            (None, None) => Value::Null,
        }
    }
}

/// Result of `Component.Get`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ComponentControls {
    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "Controls", default)]
    pub controls: Vec<ControlState>,
}

impl ComponentControls {
    /// Take the named control out of the result, if present.
    pub fn take(self, control: &str) -> Option<ControlState> {
        self.controls.into_iter().find(|c| c.name == control)
    }
}
