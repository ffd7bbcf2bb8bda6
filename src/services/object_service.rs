//! Object operations that never touch content bytes: properties, listings,
//! trash, restore, expunge and move. Also the access helpers shared with
//! the upload, download and share paths.

use chrono::Utc;
use std::collections::BTreeSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    cache::state::CacheState,
    crypto::keys::{FileKey, MasterKey, permission_is_valid, unwrap_permission},
    errors::{AppError, ErrorKind},
    models::{
        marking::Marking,
        object::{
            ChangeTokenRequest, ObjectRecord, ObjectResponse, ObjectResultset, Paging,
            UpdateObjectRequest, parse_object_id,
        },
        permission::{Capabilities, PermissionRecord},
        revision::{RevisionResponse, RevisionResultset},
    },
    services::{
        metadata_service::{Cascade, Listing},
        reconciler::{self, Edit, Settle, ShareMode},
    },
    state::AppState,
};

/// What the caller may do with one object.
#[derive(Debug, Clone)]
pub struct Access {
    pub grantees: BTreeSet<String>,
    pub caps: Capabilities,
}

#[track_caller]
pub fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    parse_object_id(raw).ok_or_else(|| AppError::malformed(format!("invalid object id `{raw}`")))
}

/// 410 for expunged objects, 405 for trashed ones.
#[track_caller]
pub fn ensure_live(record: &ObjectRecord) -> Result<(), AppError> {
    if record.is_expunged {
        return Err(AppError::new(ErrorKind::Gone, "object is expunged"));
    }
    if record.is_deleted || record.is_ancestor_deleted {
        return Err(AppError::new(ErrorKind::DeletedState, "object is deleted"));
    }
    Ok(())
}

#[track_caller]
pub fn verify_change_token(record: &ObjectRecord, token: &str) -> Result<(), AppError> {
    if token.is_empty() {
        return Err(AppError::malformed("changeToken is required"));
    }
    if token != record.change_token {
        return Err(AppError::new(
            ErrorKind::ChangeTokenMismatch,
            "ChangeToken does not match expected value. Object may have been changed by another request.",
        ));
    }
    Ok(())
}

#[track_caller]
pub fn require(caps: Capabilities, needed: Capabilities, action: &str) -> Result<(), AppError> {
    if caps.covers(&needed) {
        Ok(())
    } else {
        Err(AppError::forbidden(format!(
            "Forbidden - user does not have permission to {action} this object"
        )))
    }
}

/// Union of the capabilities granted to any of `grantees` by permissions
/// whose MAC validates.
pub fn capabilities_for(
    master: &MasterKey,
    permissions: &[PermissionRecord],
    grantees: &BTreeSet<String>,
) -> Capabilities {
    permissions
        .iter()
        .filter(|p| grantees.contains(&p.flat_grantee()))
        .filter(|p| permission_is_valid(master, p))
        .fold(Capabilities::NONE, |acc, p| acc.union(p.capabilities()))
}

/// File key from one of the caller's valid grants. With `need_read` only
/// read grants qualify.
#[track_caller]
pub fn caller_key(
    master: &MasterKey,
    permissions: &[PermissionRecord],
    grantees: &BTreeSet<String>,
    need_read: bool,
) -> Result<(FileKey, PermissionRecord), AppError> {
    let mut candidates: Vec<&PermissionRecord> = permissions
        .iter()
        .filter(|p| grantees.contains(&p.flat_grantee()) && p.is_sealed())
        .filter(|p| !need_read || p.allow_read)
        .filter(|p| permission_is_valid(master, p))
        .collect();
    // explicit user grants first, everyone last
    candidates.sort_by_key(|p| p.is_everyone());
    let permission = candidates
        .first()
        .ok_or_else(|| AppError::forbidden("Forbidden - no usable permission for user"))?;
    let key = unwrap_permission(master, permission)?;
    Ok((key, (*permission).clone()))
}

pub async fn access(state: &AppState, dn: &str, record: &ObjectRecord) -> Result<Access, AppError> {
    let grantees = state.aac.caller_grantees(dn).await?;
    let caps = capabilities_for(&state.master, &record.permissions, &grantees);
    Ok(Access { grantees, caps })
}

/// Caller may see `record`: a read grant and a passing marking check.
pub async fn authorize_read(state: &AppState, dn: &str, record: &ObjectRecord) -> Result<Access, AppError> {
    let access = access(state, dn, record).await?;
    require(access.caps, Capabilities::READ, "read")?;
    state.aac.check_access(dn, &Marking::parse(&record.raw_acm)?).await?;
    Ok(access)
}

pub async fn load_live(state: &AppState, id: Uuid) -> Result<ObjectRecord, AppError> {
    let record = state.metadata.get_object(id).await?;
    ensure_live(&record)?;
    Ok(record)
}

pub fn respond(state: &AppState, record: &ObjectRecord, grantees: &BTreeSet<String>) -> ObjectResponse {
    ObjectResponse::from_record(record, capabilities_for(&state.master, &record.permissions, grantees))
}

/// `GET /objects/{id}/properties`
pub async fn get_properties(state: &AppState, dn: &str, id: Uuid) -> Result<ObjectResponse, AppError> {
    let record = load_live(state, id).await?;
    let access = authorize_read(state, dn, &record).await?;
    Ok(respond(state, &record, &access.grantees))
}

/// `POST /objects/{id}/properties`
pub async fn update_properties(
    state: &AppState,
    dn: &str,
    id: Uuid,
    req: UpdateObjectRequest,
) -> Result<ObjectResponse, AppError> {
    if let Some(body_id) = req.id.as_deref().filter(|s| !s.is_empty()) {
        if parse_id(body_id)? != id {
            return Err(AppError::malformed("id in body does not match the url"));
        }
    }
    let mut record = load_live(state, id).await?;
    verify_change_token(&record, &req.change_token)?;
    let access = access(state, dn, &record).await?;
    require(access.caps, Capabilities { update: true, ..Capabilities::NONE }, "update")?;
    let old_marking = Marking::parse(&record.raw_acm)?;
    state.aac.check_access(dn, &old_marking).await?;

    if let Some(name) = req.name.filter(|n| !n.is_empty()) {
        record.name = name;
    }
    if let Some(type_name) = req.type_name.filter(|t| !t.is_empty()) {
        record.type_name = type_name;
    }
    if let Some(description) = req.description {
        record.description = description;
    }
    if let Some(content_type) = req.content_type.filter(|c| !c.is_empty()) {
        record.content_type = Some(content_type);
    }

    let requested: Vec<PermissionRecord> = req
        .permissions
        .iter()
        .filter_map(|g| g.to_record(record.id))
        .map(|mut p| {
            p.created_by = dn.to_string();
            p
        })
        .collect();
    let acm_given = !req.acm.is_null();

    if acm_given || !requested.is_empty() {
        let (file_key, _) = caller_key(&state.master, &record.permissions, &access.grantees, false)?;
        let mut marking = if acm_given {
            Marking::from_value(req.acm)?
        } else {
            old_marking.clone()
        };
        let edit = if requested.is_empty() {
            Edit::None
        } else {
            require(access.caps, Capabilities { share: true, ..Capabilities::NONE }, "share")?;
            reconciler::inject_read_into_share(&requested, &mut marking)?;
            Edit::Replace(requested)
        };
        let mode = if acm_given { ShareMode::Keep } else { ShareMode::Inject };
        let owner = record.owned_by.clone();
        let flat = reconciler::settle(
            &state.aac,
            &state.master,
            &file_key,
            Settle {
                object_id: record.id,
                owner: &owner,
                modifier: dn,
                mode,
                edit,
            },
            &mut record.permissions,
            marking,
        )
        .await?;
        if reconciler::share_changed(&old_marking, &flat)? {
            require(access.caps, Capabilities { share: true, ..Capabilities::NONE }, "share")?;
        }
        record.raw_acm = flat.to_json();
    }

    record.modified_by = dn.to_string();
    let token = record.change_token.clone();
    state.metadata.update_object(&mut record, &token, Cascade::None).await?;
    Ok(respond(state, &record, &access.grantees))
}

/// `GET /objects` and `GET /objects/{id}`
pub async fn list(
    state: &AppState,
    dn: &str,
    parent: Option<Uuid>,
    paging: Paging,
) -> Result<ObjectResultset, AppError> {
    let grantees = match parent {
        Some(parent_id) => {
            let parent = load_live(state, parent_id).await?;
            authorize_read(state, dn, &parent).await?.grantees
        }
        None => state.aac.caller_grantees(dn).await?,
    };
    let listing = match parent {
        Some(parent) => Listing::Children { parent },
        None => Listing::Roots { owner: dn },
    };
    resultset(state, listing, &grantees, paging).await
}

/// `GET /trash`
pub async fn list_trash(state: &AppState, dn: &str, paging: Paging) -> Result<ObjectResultset, AppError> {
    let grantees = state.aac.caller_grantees(dn).await?;
    resultset(state, Listing::Trash { owner: dn }, &grantees, paging).await
}

async fn resultset(
    state: &AppState,
    listing: Listing<'_>,
    grantees: &BTreeSet<String>,
    paging: Paging,
) -> Result<ObjectResultset, AppError> {
    let paging = paging.normalized();
    let (total, rows) = state.metadata.list_objects(listing, grantees, paging).await?;
    let objects = rows.iter().map(|r| respond(state, r, grantees)).collect();
    Ok(ObjectResultset::new(paging, total, objects))
}

/// `GET /revisions/{id}`
pub async fn list_revisions(
    state: &AppState,
    dn: &str,
    id: Uuid,
    paging: Paging,
) -> Result<RevisionResultset, AppError> {
    let record = load_live(state, id).await?;
    authorize_read(state, dn, &record).await?;
    let paging = paging.normalized();
    let (total, rows) = state.metadata.list_revisions(id, paging).await?;
    let revisions = rows.iter().map(RevisionResponse::from).collect();
    Ok(RevisionResultset::new(paging, total, revisions))
}

async fn load_for_delete(
    state: &AppState,
    dn: &str,
    id: Uuid,
    req: &ChangeTokenRequest,
) -> Result<(ObjectRecord, Access), AppError> {
    let record = state.metadata.get_object(id).await?;
    if record.is_expunged {
        return Err(AppError::new(ErrorKind::Gone, "object is expunged"));
    }
    verify_change_token(&record, &req.change_token)?;
    let access = access(state, dn, &record).await?;
    require(access.caps, Capabilities { delete: true, ..Capabilities::NONE }, "delete")?;
    state.aac.check_access(dn, &Marking::parse(&record.raw_acm)?).await?;
    Ok((record, access))
}

/// `POST /objects/{id}/trash`
pub async fn trash(
    state: &AppState,
    dn: &str,
    id: Uuid,
    req: ChangeTokenRequest,
) -> Result<ObjectResponse, AppError> {
    let (mut record, access) = load_for_delete(state, dn, id, &req).await?;
    if record.is_deleted {
        return Err(AppError::new(ErrorKind::DeletedState, "object is already in the trash"));
    }
    record.is_deleted = true;
    record.deleted_date = Some(Utc::now());
    record.deleted_by = Some(dn.to_string());
    record.modified_by = dn.to_string();
    state
        .metadata
        .update_object(&mut record, &req.change_token, Cascade::AncestorDeleted(true))
        .await?;
    info!(id = %record.hex_id(), by = %dn, "object trashed");
    Ok(respond(state, &record, &access.grantees))
}

/// `POST /objects/{id}/untrash`
pub async fn untrash(
    state: &AppState,
    dn: &str,
    id: Uuid,
    req: ChangeTokenRequest,
) -> Result<ObjectResponse, AppError> {
    let (mut record, access) = load_for_delete(state, dn, id, &req).await?;
    if !record.is_deleted {
        return Err(AppError::malformed("object is not in the trash"));
    }
    if record.is_ancestor_deleted {
        return Err(AppError::new(ErrorKind::DeletedState, "a parent of the object is deleted"));
    }
    record.is_deleted = false;
    record.deleted_date = None;
    record.deleted_by = None;
    record.modified_by = dn.to_string();
    state
        .metadata
        .update_object(&mut record, &req.change_token, Cascade::AncestorDeleted(false))
        .await?;
    info!(id = %record.hex_id(), by = %dn, "object restored");
    Ok(respond(state, &record, &access.grantees))
}

/// `DELETE /objects/{id}`
///
/// The current ciphertext is dropped from the cache and the blob store;
/// earlier revisions keep theirs until collected.
pub async fn expunge(
    state: &AppState,
    dn: &str,
    id: Uuid,
    req: ChangeTokenRequest,
) -> Result<ObjectResponse, AppError> {
    let (mut record, access) = load_for_delete(state, dn, id, &req).await?;
    record.is_expunged = true;
    record.is_deleted = true;
    record.deleted_date.get_or_insert_with(Utc::now);
    record.deleted_by.get_or_insert_with(|| dn.to_string());
    record.modified_by = dn.to_string();
    state
        .metadata
        .update_object(&mut record, &req.change_token, Cascade::Expunged)
        .await?;
    info!(id = %record.hex_id(), by = %dn, "object expunged");

    if let Some(connector) = record.content_connector.clone() {
        let drain = state.drain.clone();
        tokio::spawn(async move {
            for suffix in [CacheState::Cached, CacheState::Uploaded] {
                if let Err(e) = drain.cache().remove(&suffix.file_name(&connector)).await {
                    warn!(connector = %connector, error = %e, "unable to remove expunged ciphertext");
                }
            }
            if let Err(e) = drain.store().delete(&connector).await {
                warn!(connector = %connector, error = %e, "unable to delete expunged blob");
            }
        });
    }
    Ok(respond(state, &record, &access.grantees))
}

/// `POST /objects/{id}/move/{parent}`
pub async fn move_object(
    state: &AppState,
    dn: &str,
    id: Uuid,
    new_parent: Uuid,
    req: ChangeTokenRequest,
) -> Result<ObjectResponse, AppError> {
    let mut record = load_live(state, id).await?;
    verify_change_token(&record, &req.change_token)?;
    let access = access(state, dn, &record).await?;
    require(access.caps, Capabilities { update: true, ..Capabilities::NONE }, "move")?;
    state.aac.check_access(dn, &Marking::parse(&record.raw_acm)?).await?;

    let parent = load_live(state, new_parent).await?;
    let parent_access = self::access(state, dn, &parent).await?;
    require(parent_access.caps, Capabilities { create: true, ..Capabilities::NONE }, "create children in")?;
    if state.metadata.is_descendant(record.id, new_parent).await? {
        return Err(AppError::malformed("cannot move an object beneath itself"));
    }

    record.parent_id = Some(new_parent);
    record.modified_by = dn.to_string();
    state
        .metadata
        .update_object(&mut record, &req.change_token, Cascade::None)
        .await?;
    Ok(respond(state, &record, &access.grantees))
}
