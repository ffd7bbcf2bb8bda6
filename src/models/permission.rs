//! Permissions granted on an object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use super::marking::{EVERYONE_GROUP, MarkingError, Share, flatten_grantee};

/// Capability bits of a grant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(rename = "allowCreate", default)]
    pub create: bool,
    #[serde(rename = "allowRead", default)]
    pub read: bool,
    #[serde(rename = "allowUpdate", default)]
    pub update: bool,
    #[serde(rename = "allowDelete", default)]
    pub delete: bool,
    #[serde(rename = "allowShare", default)]
    pub share: bool,
}

impl Capabilities {
    pub const CRUDS: Self = Self {
        create: true,
        read: true,
        update: true,
        delete: true,
        share: true,
    };
    pub const CUDS: Self = Self {
        create: true,
        read: false,
        update: true,
        delete: true,
        share: true,
    };
    pub const READ: Self = Self {
        create: false,
        read: true,
        update: false,
        delete: false,
        share: false,
    };
    pub const NONE: Self = Self {
        create: false,
        read: false,
        update: false,
        delete: false,
        share: false,
    };

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }

    /// Canonical bit string covered by the permission MAC.
    pub fn mac_string(&self) -> String {
        let bit = |b: bool| if b { "t" } else { "f" };
        format!(
            "{},{},{},{},{}",
            bit(self.create),
            bit(self.read),
            bit(self.update),
            bit(self.delete),
            bit(self.share)
        )
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            create: self.create || other.create,
            read: self.read || other.read,
            update: self.update || other.update,
            delete: self.delete || other.delete,
            share: self.share || other.share,
        }
    }

    /// Every bit set in `other` is also set here.
    pub fn covers(&self, other: &Self) -> bool {
        (!other.create || self.create)
            && (!other.read || self.read)
            && (!other.update || self.update)
            && (!other.delete || self.delete)
            && (!other.share || self.share)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |b: bool, c: char| if b { c } else { '-' };
        write!(
            f,
            "[{}{}{}{}{}]",
            flag(self.create, 'C'),
            flag(self.read, 'R'),
            flag(self.update, 'U'),
            flag(self.delete, 'D'),
            flag(self.share, 'S')
        )
    }
}

/// A stored grant, including its wrapped copy of the file key.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct PermissionRecord {
    pub id: Uuid,

    pub object_id: Uuid,

    /// User DN or flattened group name.
    pub grantee: String,

    pub display_name: String,

    /// Share clause fragment naming this grantee.
    pub acm_share: String,

    pub allow_create: bool,
    pub allow_read: bool,
    pub allow_update: bool,
    pub allow_delete: bool,
    pub allow_share: bool,

    /// Granted through a share request rather than derived from the marking.
    pub explicit_share: bool,

    /// File key XOR the permission passphrase.
    pub encrypt_key: Vec<u8>,

    pub permission_iv: Vec<u8>,

    /// Hex HMAC over grantee, capabilities, IV and wrapped key.
    pub permission_mac: String,

    pub created_by: String,

    pub created_date: DateTime<Utc>,
}

impl PermissionRecord {
    fn blank(object_id: Uuid, grantee: &str, display_name: &str, share: &Share, caps: Capabilities) -> Self {
        let mut record = Self {
            id: Uuid::new_v4(),
            object_id,
            grantee: grantee.to_string(),
            display_name: display_name.to_string(),
            acm_share: share.to_fragment(),
            allow_create: false,
            allow_read: false,
            allow_update: false,
            allow_delete: false,
            allow_share: false,
            explicit_share: false,
            encrypt_key: Vec::new(),
            permission_iv: Vec::new(),
            permission_mac: String::new(),
            created_by: String::new(),
            created_date: Utc::now(),
        };
        record.set_capabilities(caps);
        record
    }

    pub fn for_user(object_id: Uuid, dn: &str, caps: Capabilities) -> Self {
        Self::blank(object_id, dn, dn, &Share::user(dn), caps)
    }

    pub fn for_group(
        object_id: Uuid,
        project: &str,
        disp_nm: &str,
        group: &str,
        caps: Capabilities,
    ) -> Self {
        let share = Share::group(project, disp_nm, group);
        let display = if disp_nm.is_empty() {
            format!("{project} {group}")
        } else {
            format!("{disp_nm} {group}")
        };
        Self::blank(
            object_id,
            &super::marking::flatten_project_group(project, group),
            &display,
            &share,
            caps,
        )
    }

    /// Grant for an entry of a share clause, as produced by [`Share::grantees`].
    pub fn for_share_entry(
        object_id: Uuid,
        grantee: &str,
        display_name: &str,
        fragment: &Share,
        caps: Capabilities,
    ) -> Self {
        Self::blank(object_id, grantee, display_name, fragment, caps)
    }

    pub fn everyone(object_id: Uuid, caps: Capabilities) -> Self {
        Self::blank(object_id, EVERYONE_GROUP, "Everyone", &Share::default(), caps)
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            create: self.allow_create,
            read: self.allow_read,
            update: self.allow_update,
            delete: self.allow_delete,
            share: self.allow_share,
        }
    }

    pub fn set_capabilities(&mut self, caps: Capabilities) {
        self.allow_create = caps.create;
        self.allow_read = caps.read;
        self.allow_update = caps.update;
        self.allow_delete = caps.delete;
        self.allow_share = caps.share;
    }

    pub fn flat_grantee(&self) -> String {
        flatten_grantee(&self.grantee)
    }

    pub fn is_for(&self, grantee: &str) -> bool {
        self.flat_grantee() == flatten_grantee(grantee)
    }

    pub fn is_everyone(&self) -> bool {
        self.is_for(EVERYONE_GROUP)
    }

    pub fn share_fragment(&self) -> Result<Share, MarkingError> {
        Share::from_fragment(&self.acm_share)
    }

    /// The file key has been wrapped onto this grant.
    pub fn is_sealed(&self) -> bool {
        !self.encrypt_key.is_empty() && !self.permission_iv.is_empty()
    }
}

/// Wire view of a permission. Key material never leaves the server.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionView {
    pub grantee: String,
    pub display_name: String,
    #[serde(flatten)]
    pub capabilities: Capabilities,
    pub explicit_share: bool,
}

impl From<&PermissionRecord> for PermissionView {
    fn from(record: &PermissionRecord) -> Self {
        Self {
            grantee: record.grantee.clone(),
            display_name: record.display_name.clone(),
            capabilities: record.capabilities(),
            explicit_share: record.explicit_share,
        }
    }
}

/// A requested grant on create/update.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PermissionGrant {
    #[serde(default)]
    pub grantee: Option<String>,
    #[serde(default)]
    pub user_distinguished_name: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub project_display_name: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub capabilities: Capabilities,
}

impl PermissionGrant {
    /// Resolve to a stored grant. Returns `None` when no grantee is named.
    pub fn to_record(&self, object_id: Uuid) -> Option<PermissionRecord> {
        let caps = self.capabilities;
        let mut record = if let (Some(project), Some(group)) = (&self.project_name, &self.group_name) {
            PermissionRecord::for_group(
                object_id,
                project,
                self.project_display_name.as_deref().unwrap_or(project),
                group,
                caps,
            )
        } else if let Some(dn) = self.user_distinguished_name.as_ref().or(self.grantee.as_ref()) {
            if flatten_grantee(dn) == flatten_grantee(EVERYONE_GROUP) {
                PermissionRecord::everyone(object_id, caps)
            } else {
                PermissionRecord::for_user(object_id, dn, caps)
            }
        } else {
            return None;
        };
        if let Some(display) = &self.display_name {
            record.display_name = display.clone();
        }
        Some(record)
    }
}

/// Body of a share or unshare request.
///
/// `share` is either a single user DN or a share clause object.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectShareRequest {
    #[serde(default)]
    pub share: Value,
    #[serde(flatten)]
    pub capabilities: Capabilities,
}

impl ObjectShareRequest {
    /// Expand the share target into one grant per named grantee.
    pub fn to_records(&self, object_id: Uuid) -> Result<Vec<PermissionRecord>, MarkingError> {
        let share = match &self.share {
            Value::String(dn) if !dn.trim().is_empty() => {
                if flatten_grantee(dn) == flatten_grantee(EVERYONE_GROUP) {
                    return Ok(vec![PermissionRecord::everyone(object_id, self.capabilities)]);
                }
                Share::user(dn)
            }
            Value::Object(_) => serde_json::from_value::<Share>(self.share.clone())?,
            Value::Null => Share::default(),
            _ => return Err(MarkingError::NotAnObject),
        };
        Ok(share
            .grantees()
            .into_iter()
            .map(|(grantee, display, fragment)| {
                let mut record = PermissionRecord::for_share_entry(
                    object_id,
                    &grantee,
                    &display,
                    &fragment,
                    self.capabilities,
                );
                record.explicit_share = true;
                record
            })
            .collect())
    }
}
