use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::approval::ApprovalId;
use crate::domain::module::Module;
use crate::domain::session::{TenantId, UserId};

/// Bookkeeping columns that never count as a business change.
pub const VERSION_METADATA_FIELDS: [&str; 4] = ["id", "version_number", "created_at", "updated_at"];

/// One row of a module's version table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: String,
    pub tenant_id: TenantId,
    pub module: Module,
    pub record_id: String,
    pub version_number: u32,
    pub is_current: bool,
    pub data: Map<String, Value>,
    pub approval_request_id: Option<ApprovalId>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VersionRecord {
    /// Business fields with metadata keys stripped out.
    pub fn business_fields(&self) -> Map<String, Value> {
        self.data
            .iter()
            .filter(|(key, _)| !VERSION_METADATA_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Snapshot to store as the body of a new version.
///
/// Objects are stored as-is; any other JSON value is wrapped under `value`
/// so every version row has a keyed schema to diff against.
pub fn snapshot_fields(snapshot: &Value) -> Map<String, Value> {
    match snapshot {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    }
}
