//! Historical snapshots of an object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{
    object::{ObjectResultset, Paging},
    permission::PermissionRecord,
};

/// One committed state of an object, keyed by its change count.
///
/// Permissions are kept as the JSON snapshot taken at commit time so the
/// revision's stream stays decryptable after later grants change.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct RevisionRecord {
    pub object_id: Uuid,
    pub change_count: i64,
    pub change_token: String,
    pub name: String,
    pub modified_by: String,
    pub modified_date: DateTime<Utc>,
    pub raw_acm: String,
    pub content_connector: Option<String>,
    pub content_type: Option<String>,
    pub content_size: i64,
    pub content_hash: Option<String>,
    pub encrypt_iv: Option<Vec<u8>>,
    pub permissions: String,
}

impl RevisionRecord {
    pub fn permission_snapshot(&self) -> Result<Vec<PermissionRecord>, serde_json::Error> {
        serde_json::from_str(&self.permissions)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RevisionResponse {
    pub id: String,
    pub change_count: i64,
    pub change_token: String,
    pub name: String,
    pub modified_by: String,
    pub modified_date: DateTime<Utc>,
    pub content_type: String,
    pub content_size: i64,
    pub content_hash: String,
}

impl From<&RevisionRecord> for RevisionResponse {
    fn from(record: &RevisionRecord) -> Self {
        Self {
            id: record.object_id.simple().to_string(),
            change_count: record.change_count,
            change_token: record.change_token.clone(),
            name: record.name.clone(),
            modified_by: record.modified_by.clone(),
            modified_date: record.modified_date,
            content_type: record.content_type.clone().unwrap_or_default(),
            content_size: record.content_size,
            content_hash: record.content_hash.clone().unwrap_or_default(),
        }
    }
}

/// One page of an object's history.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RevisionResultset {
    pub total_rows: i64,
    pub page_count: i64,
    pub page_number: i64,
    pub page_size: i64,
    pub page_rows: i64,
    pub objects: Vec<RevisionResponse>,
}

impl RevisionResultset {
    pub fn new(paging: Paging, total_rows: i64, objects: Vec<RevisionResponse>) -> Self {
        let page = ObjectResultset::new(paging, total_rows, Vec::new());
        Self {
            total_rows,
            page_count: page.page_count,
            page_number: page.page_number,
            page_size: page.page_size,
            page_rows: objects.len() as i64,
            objects,
        }
    }
}
