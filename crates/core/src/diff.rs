//! Field-level diffs between JSON snapshots.
//!
//! Two values are equal when their `serde_json::Value`s are equal, which for
//! the default sorted-map representation is the same as comparing their
//! serialized strings. Arrays compare element by element, so a reordered
//! array is reported as changed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::approval::ApprovalRequest;
use crate::domain::version::VersionRecord;

/// A field whose value differs between the previous and current snapshot.
/// `None` means the key is absent on that side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionChange {
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Changed fields of a request, sorted by field name.
///
/// Returns an empty list when the request carries no previous snapshot.
pub fn calculate_diff(request: &ApprovalRequest) -> Vec<FieldChange> {
    diff_snapshots(&request.current_data, request.previous_data.as_ref())
}

pub fn diff_snapshots(current: &Value, previous: Option<&Value>) -> Vec<FieldChange> {
    let Some(previous) = previous.filter(|value| !value.is_null()) else {
        return Vec::new();
    };

    let empty = Map::new();
    let current = current.as_object().unwrap_or(&empty);
    let previous = previous.as_object().unwrap_or(&empty);

    changed_keys(previous, current)
        .into_iter()
        .map(|field| FieldChange {
            old_value: previous.get(&field).cloned(),
            new_value: current.get(&field).cloned(),
            field,
        })
        .collect()
}

/// Business-field changes going from `older` to `newer`.
///
/// Keys present on either side are compared, so a field added in `newer` shows
/// up with `old: None`.
pub fn compare_versions(older: &VersionRecord, newer: &VersionRecord) -> BTreeMap<String, VersionChange> {
    let before = older.business_fields();
    let after = newer.business_fields();

    changed_keys(&before, &after)
        .into_iter()
        .map(|field| {
            let change = VersionChange { old: before.get(&field).cloned(), new: after.get(&field).cloned() };
            (field, change)
        })
        .collect()
}

fn changed_keys(before: &Map<String, Value>, after: &Map<String, Value>) -> BTreeSet<String> {
    before
        .keys()
        .chain(after.keys())
        .filter(|key| before.get(*key) != after.get(*key))
        .cloned()
        .collect()
}
