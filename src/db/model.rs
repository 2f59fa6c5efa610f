//! Write models handed to repositories.
//!
//! These carry already-resolved values; mapping from raw inventory records
//! happens here so the engine only moves them between client and store.

use crate::inventory::model::{dropdown_str, ComponentType, RawRecord};

/// Prefix of the name given to assets the inventory lists without one.
pub const PLACEHOLDER_NAME_PREFIX: &str = "Computer";

/// Mutable attributes of an asset as seen in the external catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetUpsert {
    pub external_id: i64,
    pub name: String,
    pub entity: String,
    pub asset_tag: String,
    pub serial: String,
    pub location: String,
    pub status: String,
    pub raw_snapshot: String,
}

impl AssetUpsert {
    pub fn from_record(external_id: i64, record: &RawRecord) -> Self {
        let name = dropdown_str(record, "name");
        let name = if name.trim().is_empty() {
            format!("{}-{}", PLACEHOLDER_NAME_PREFIX, external_id)
        } else {
            name
        };
        Self {
            external_id,
            name,
            entity: dropdown_str(record, "entities_id"),
            asset_tag: dropdown_str(record, "otherserial"),
            serial: dropdown_str(record, "serial"),
            location: dropdown_str(record, "locations_id"),
            status: dropdown_str(record, "states_id"),
            raw_snapshot: serde_json::Value::Object(record.clone()).to_string(),
        }
    }
}

/// One component row to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInsert {
    pub component_type: ComponentType,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub capacity: String,
    pub raw_snapshot: String,
}

impl ComponentInsert {
    pub fn from_record(component_type: ComponentType, item: &RawRecord) -> Self {
        Self {
            component_type,
            name: component_type.component_name(item),
            manufacturer: dropdown_str(item, "manufacturers_id"),
            model: dropdown_str(item, "devicemodels_id"),
            serial: dropdown_str(item, "serial"),
            capacity: dropdown_str(item, "size"),
            raw_snapshot: serde_json::Value::Object(item.clone()).to_string(),
        }
    }
}
