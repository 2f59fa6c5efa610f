//! Shapes of the data returned by the external inventory API.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// One raw JSON object as returned by the inventory API.
pub type RawRecord = Map<String, Value>;

/// Keys consulted, in order, when a dropdown arrives as an expanded object.
const DROPDOWN_LABEL_KEYS: [&str; 3] = ["completename", "name", "label"];

/// A field that may arrive as a bare value, an expanded object or not at all.
#[derive(Debug, Clone, PartialEq)]
pub enum DropdownValue {
    Scalar(String),
    Structured(Vec<(String, Value)>),
    Absent,
}

impl DropdownValue {
    pub fn from_json(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => DropdownValue::Absent,
            Some(Value::String(s)) => DropdownValue::Scalar(s.clone()),
            Some(Value::Object(map)) => DropdownValue::Structured(
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ),
            Some(other) => DropdownValue::Scalar(other.to_string()),
        }
    }

    /// Resolve to display text. Objects prefer `completename`, `name`, `label`
    /// and finally `id`; absent values become an empty string.
    pub fn resolve(&self) -> String {
        match self {
            DropdownValue::Absent => String::new(),
            DropdownValue::Scalar(s) => s.clone(),
            DropdownValue::Structured(fields) => {
                let field = |key: &str| fields.iter().find(|(k, _)| k == key).map(|(_, v)| v);
                DROPDOWN_LABEL_KEYS
                    .into_iter()
                    .filter_map(|key| field(key).and_then(non_empty_text))
                    .next()
                    .or_else(|| field("id").filter(|v| !v.is_null()).map(value_text))
                    .unwrap_or_default()
            }
        }
    }
}

/// Shorthand for resolving `record[key]` through [`DropdownValue`].
pub fn dropdown_str(record: &RawRecord, key: &str) -> String {
    DropdownValue::from_json(record.get(key)).resolve()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn non_empty_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        other => Some(value_text(other)),
    }
}

/// Parse the external identifier of a record; `None` means skip the record.
pub fn external_id(record: &RawRecord) -> Option<i64> {
    match record.get("id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Hardware component sub-resources known to the inventory system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentType {
    Processor,
    Memory,
    HardDrive,
    NetworkCard,
    GraphicCard,
    Motherboard,
    PowerSupply,
}

impl ComponentType {
    pub const ALL: [ComponentType; 7] = [
        ComponentType::Processor,
        ComponentType::Memory,
        ComponentType::HardDrive,
        ComponentType::NetworkCard,
        ComponentType::GraphicCard,
        ComponentType::Motherboard,
        ComponentType::PowerSupply,
    ];

    /// Sub-resource name on the external API.
    pub fn tag(&self) -> &'static str {
        match self {
            ComponentType::Processor => "Item_DeviceProcessor",
            ComponentType::Memory => "Item_DeviceMemory",
            ComponentType::HardDrive => "Item_DeviceHardDrive",
            ComponentType::NetworkCard => "Item_DeviceNetworkCard",
            ComponentType::GraphicCard => "Item_DeviceGraphicCard",
            ComponentType::Motherboard => "Item_DeviceMotherboard",
            ComponentType::PowerSupply => "Item_DevicePowerSupply",
        }
    }

    /// Value stored in `asset_components.component_type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Processor => "Processor",
            ComponentType::Memory => "Memory",
            ComponentType::HardDrive => "HardDrive",
            ComponentType::NetworkCard => "NetworkCard",
            ComponentType::GraphicCard => "GraphicCard",
            ComponentType::Motherboard => "Motherboard",
            ComponentType::PowerSupply => "PowerSupply",
        }
    }

    /// Field pointing at the generic device definition, used when the item
    /// carries no name of its own.
    pub fn link_field(&self) -> &'static str {
        match self {
            ComponentType::Processor => "deviceprocessors_id",
            ComponentType::Memory => "devicememories_id",
            ComponentType::HardDrive => "deviceharddrives_id",
            ComponentType::NetworkCard => "devicenetworkcards_id",
            ComponentType::GraphicCard => "devicegraphiccards_id",
            ComponentType::Motherboard => "devicemotherboards_id",
            ComponentType::PowerSupply => "devicepowersupplies_id",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        ComponentType::ALL.into_iter().find(|t| t.tag() == tag)
    }

    /// Display name of one component item.
    pub fn component_name(&self, item: &RawRecord) -> String {
        let direct = ["designation", "name"]
            .iter()
            .filter_map(|key| item.get(*key))
            .find(|v| non_empty_text(v).is_some());
        match direct {
            Some(value) => DropdownValue::from_json(Some(value)).resolve(),
            None => dropdown_str(item, self.link_field()),
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Result of fetching every component type for one asset.
#[derive(Debug, Clone, Default)]
pub struct ComponentSets {
    /// Types fetched successfully, including those with no items.
    pub fetched: BTreeMap<ComponentType, Vec<RawRecord>>,
    /// Types whose fetch failed; their stored rows should be left alone.
    pub failed: Vec<ComponentType>,
}

impl ComponentSets {
    pub fn item_count(&self) -> usize {
        self.fetched.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn dropdown_prefers_completename() {
        let v = json!({"completename": "Building A > Room 1", "name": "Room 1", "id": 4});
        assert_eq!(
            DropdownValue::from_json(Some(&v)).resolve(),
            "Building A > Room 1"
        );
    }

    #[test]
    fn dropdown_scalar_passes_through() {
        let v = json!("42");
        assert_eq!(DropdownValue::from_json(Some(&v)).resolve(), "42");
        let n = json!(42);
        assert_eq!(DropdownValue::from_json(Some(&n)).resolve(), "42");
    }

    #[test]
    fn dropdown_falls_back_through_keys() {
        let v = json!({"completename": "", "name": null, "label": "Lab"});
        assert_eq!(DropdownValue::from_json(Some(&v)).resolve(), "Lab");

        let v = json!({"name": "", "id": 17});
        assert_eq!(DropdownValue::from_json(Some(&v)).resolve(), "17");

        let v = json!({"other": "x"});
        assert_eq!(DropdownValue::from_json(Some(&v)).resolve(), "");
    }

    #[test]
    fn dropdown_absent_is_empty() {
        assert_eq!(DropdownValue::from_json(None), DropdownValue::Absent);
        assert_eq!(DropdownValue::from_json(Some(&Value::Null)).resolve(), "");
    }

    #[test]
    fn external_id_accepts_numbers_and_numeric_strings() {
        assert_eq!(external_id(&record(json!({"id": 12}))), Some(12));
        assert_eq!(external_id(&record(json!({"id": " 13 "}))), Some(13));
        assert_eq!(external_id(&record(json!({"id": "abc"}))), None);
        assert_eq!(external_id(&record(json!({"id": null}))), None);
        assert_eq!(external_id(&record(json!({"name": "pc"}))), None);
    }

    #[test]
    fn component_name_uses_designation_then_link_field() {
        let t = ComponentType::Processor;
        let item = record(json!({"designation": "Core i5", "deviceprocessors_id": "Intel"}));
        assert_eq!(t.component_name(&item), "Core i5");

        let item = record(json!({"designation": "", "deviceprocessors_id": {"name": "Ryzen 7"}}));
        assert_eq!(t.component_name(&item), "Ryzen 7");

        let item = record(json!({"serial": "x"}));
        assert_eq!(t.component_name(&item), "");
    }

    #[test]
    fn component_tags_round_trip() {
        for t in ComponentType::ALL {
            assert_eq!(ComponentType::from_tag(t.tag()), Some(t));
            assert_eq!(t.tag().trim_start_matches("Item_Device"), t.as_str());
        }
    }
}
