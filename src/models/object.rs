//! Represents an object (file or folder) and its wire forms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use super::permission::{Capabilities, PermissionGrant, PermissionRecord, PermissionView};

/// A stored object row plus its current permissions.
///
/// Content bytes live in the cache and blob store under `content_connector`;
/// this struct only carries the metadata needed to find and decrypt them.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectRecord {
    /// Internal 16-byte identifier.
    pub id: Uuid,

    pub created_date: DateTime<Utc>,
    pub created_by: String,
    pub modified_date: DateTime<Utc>,
    pub modified_by: String,

    /// Incremented on every committed change.
    pub change_count: i64,

    /// Optimistic concurrency cookie; must be echoed back on update.
    pub change_token: String,

    pub owned_by: String,
    pub type_name: String,
    pub name: String,
    pub description: String,

    /// `None` for root objects.
    pub parent_id: Option<Uuid>,

    /// Marking JSON (canonical form).
    pub raw_acm: String,

    /// Blob name of the ciphertext, when the object has content.
    pub content_connector: Option<String>,
    pub content_type: Option<String>,
    pub content_size: i64,

    /// Hex SHA-256 of the plaintext.
    pub content_hash: Option<String>,

    /// 16-byte AES-CTR IV.
    pub encrypt_iv: Option<Vec<u8>>,

    pub is_deleted: bool,
    pub is_ancestor_deleted: bool,
    pub is_expunged: bool,
    pub deleted_date: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,

    #[sqlx(skip)]
    #[serde(default)]
    pub permissions: Vec<PermissionRecord>,
}

impl ObjectRecord {
    /// A new, uncommitted object owned by `owner`.
    pub fn new(owner: &str, type_name: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_date: now,
            created_by: owner.to_string(),
            modified_date: now,
            modified_by: owner.to_string(),
            change_count: 0,
            change_token: String::new(),
            owned_by: owner.to_string(),
            type_name: type_name.to_string(),
            name: name.to_string(),
            description: String::new(),
            parent_id: None,
            raw_acm: String::new(),
            content_connector: None,
            content_type: None,
            content_size: 0,
            content_hash: None,
            encrypt_iv: None,
            is_deleted: false,
            is_ancestor_deleted: false,
            is_expunged: false,
            deleted_date: None,
            deleted_by: None,
            permissions: Vec::new(),
        }
    }

    pub fn hex_id(&self) -> String {
        self.id.simple().to_string()
    }
}

/// JSON returned for an object.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResponse {
    pub id: String,
    pub created_date: DateTime<Utc>,
    pub created_by: String,
    pub modified_date: DateTime<Utc>,
    pub modified_by: String,
    pub change_count: i64,
    pub change_token: String,
    pub owned_by: String,
    pub type_name: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_id: Option<String>,
    pub acm: Value,
    pub content_type: String,
    pub content_size: i64,
    pub content_hash: String,
    pub is_deleted: bool,
    pub is_ancestor_deleted: bool,
    pub is_expunged: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deleted_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deleted_by: Option<String>,
    #[serde(skip_deserializing)]
    pub permissions: Vec<PermissionView>,
    pub caller_permission: Capabilities,
}

impl ObjectResponse {
    pub fn from_record(record: &ObjectRecord, caller_permission: Capabilities) -> Self {
        let acm = serde_json::from_str(&record.raw_acm).unwrap_or(Value::String(record.raw_acm.clone()));
        Self {
            id: record.hex_id(),
            created_date: record.created_date,
            created_by: record.created_by.clone(),
            modified_date: record.modified_date,
            modified_by: record.modified_by.clone(),
            change_count: record.change_count,
            change_token: record.change_token.clone(),
            owned_by: record.owned_by.clone(),
            type_name: record.type_name.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            parent_id: record.parent_id.map(|p| p.simple().to_string()),
            acm,
            content_type: record.content_type.clone().unwrap_or_default(),
            content_size: record.content_size,
            content_hash: record.content_hash.clone().unwrap_or_default(),
            is_deleted: record.is_deleted,
            is_ancestor_deleted: record.is_ancestor_deleted,
            is_expunged: record.is_expunged,
            deleted_date: record.deleted_date,
            deleted_by: record.deleted_by.clone(),
            permissions: record.permissions.iter().map(PermissionView::from).collect(),
            caller_permission,
        }
    }
}

/// Metadata accepted on create (JSON body or the `ObjectMetadata` part).
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateObjectRequest {
    #[serde(default)]
    pub type_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub acm: Value,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub permissions: Vec<PermissionGrant>,
}

/// Metadata accepted on property update and on stream update.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateObjectRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub change_token: String,
    #[serde(default)]
    pub type_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acm: Value,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub permissions: Vec<PermissionGrant>,
}

/// Body for trash, untrash, expunge and move.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChangeTokenRequest {
    #[serde(default)]
    pub change_token: String,
}

/// Paging query parameters.
#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub struct Paging {
    #[serde(default = "default_page_number")]
    pub page_number: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

pub const MAX_PAGE_SIZE: i64 = 10_000;

fn default_page_number() -> i64 {
    1
}

fn default_page_size() -> i64 {
    20
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            page_number: default_page_number(),
            page_size: default_page_size(),
        }
    }
}

impl Paging {
    pub fn normalized(self) -> Self {
        Self {
            page_number: self.page_number.max(1),
            page_size: self.page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page_number - 1) * self.page_size
    }
}

/// One page of a listing.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResultset {
    pub total_rows: i64,
    pub page_count: i64,
    pub page_number: i64,
    pub page_size: i64,
    pub page_rows: i64,
    pub objects: Vec<ObjectResponse>,
}

impl ObjectResultset {
    pub fn new(paging: Paging, total_rows: i64, objects: Vec<ObjectResponse>) -> Self {
        let page_count = if total_rows == 0 {
            0
        } else {
            (total_rows + paging.page_size - 1) / paging.page_size
        };
        Self {
            total_rows,
            page_count,
            page_number: paging.page_number,
            page_size: paging.page_size,
            page_rows: objects.len() as i64,
            objects,
        }
    }
}

/// Parse a 32-hex object identifier.
pub fn parse_object_id(raw: &str) -> Option<Uuid> {
    if raw.len() != 32 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let bytes = hex::decode(raw).ok()?;
    Uuid::from_slice(&bytes).ok()
}
