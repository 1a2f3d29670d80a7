//! Import-name to package-name mapping tables.
//!
//! Downstream tools ask "which package provides import `yaml`?"; the
//! answer lives in compact per-direction maps rebuilt from the package
//! records. These are the store's batched small-map records: single JSON
//! objects written through the backends' hashmap operations.

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::Value;

use crate::store::GraphStore;
use crate::types::{MAPPINGS_PREFIX, NODE_PREFIX, PackageRecord};

pub fn import_map_key() -> String {
    format!("{MAPPINGS_PREFIX}/import_to_package")
}

pub fn feedstock_map_key() -> String {
    format!("{MAPPINGS_PREFIX}/feedstock_to_package")
}

/// The import names a package provides: the explicit `imports` hint when
/// present, otherwise the package name with dashes normalized.
fn imports_of(record: &PackageRecord) -> Vec<String> {
    if let Some(imports) = record.extra.get("imports").and_then(Value::as_array) {
        return imports
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    vec![record.name.replace('-', "_")]
}

/// Rebuild the import-name table.
pub fn make_import_to_package_mapping(store: &GraphStore) -> Result<BTreeMap<String, Value>> {
    let mut map: BTreeMap<String, Value> = BTreeMap::new();
    for record in all_records(store)? {
        if record.archived {
            continue;
        }
        for import in imports_of(&record) {
            // First provider wins; collisions are rare and deterministic
            // because records are walked in key order.
            map.entry(import).or_insert_with(|| Value::from(record.name.clone()));
        }
    }
    store.write_map(&import_map_key(), &map)?;
    Ok(map)
}

/// Rebuild every mapping table.
pub fn make_mappings(store: &GraphStore) -> Result<()> {
    make_import_to_package_mapping(store)?;

    let mut feedstocks: BTreeMap<String, Value> = BTreeMap::new();
    for record in all_records(store)? {
        feedstocks.insert(record.feedstock_name.clone(), Value::from(record.name.clone()));
    }
    store.write_map(&feedstock_map_key(), &feedstocks)?;
    Ok(())
}

fn all_records(store: &GraphStore) -> Result<Vec<PackageRecord>> {
    let prefix = format!("{NODE_PREFIX}/");
    let mut records = Vec::new();
    for key in store.keys_prefix(&prefix)? {
        if let Some(record) = store.load::<PackageRecord>(&key)? {
            records.push(record);
        }
    }
    Ok(records)
}
