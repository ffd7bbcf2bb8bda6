//! Adding and removing grants on an existing object.

use std::collections::BTreeSet;
use tracing::info;
use uuid::Uuid;

use crate::{
    errors::AppError,
    models::{
        marking::Marking,
        object::{ObjectRecord, ObjectResponse},
        permission::{Capabilities, ObjectShareRequest, PermissionRecord},
    },
    services::{
        metadata_service::Cascade,
        object_service::{Access, access, caller_key, load_live, require, respond},
        reconciler::{self, Edit, Settle, ShareMode},
    },
    state::AppState,
};

struct Prepared {
    record: ObjectRecord,
    access: Access,
    marking: Marking,
    requested: Vec<PermissionRecord>,
}

async fn prepare(
    state: &AppState,
    dn: &str,
    id: Uuid,
    req: &ObjectShareRequest,
) -> Result<Prepared, AppError> {
    let record = load_live(state, id).await?;
    let access = access(state, dn, &record).await?;
    require(access.caps, Capabilities { share: true, ..Capabilities::NONE }, "share")?;
    // sharing a bit the caller lacks would escalate
    require(access.caps, req.capabilities, "grant those permissions on")?;
    let marking = Marking::parse(&record.raw_acm)?;
    state.aac.check_access(dn, &marking).await?;

    let requested: Vec<PermissionRecord> = req
        .to_records(record.id)?
        .into_iter()
        .map(|mut p| {
            p.created_by = dn.to_string();
            p
        })
        .collect();
    if requested.is_empty() {
        return Err(AppError::malformed("share names no grantees"));
    }
    Ok(Prepared {
        record,
        access,
        marking,
        requested,
    })
}

async fn settle_and_commit(
    state: &AppState,
    dn: &str,
    prepared: Prepared,
    mode: ShareMode,
    edit: Edit,
) -> Result<ObjectResponse, AppError> {
    let Prepared {
        mut record,
        access,
        marking,
        ..
    } = prepared;
    let (file_key, _) = caller_key(&state.master, &record.permissions, &access.grantees, false)?;
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
    record.raw_acm = flat.to_json();
    record.modified_by = dn.to_string();
    let token = record.change_token.clone();
    state.metadata.update_object(&mut record, &token, Cascade::None).await?;
    Ok(respond(state, &record, &access.grantees))
}

/// `POST /shared/{id}`
pub async fn add_share(
    state: &AppState,
    dn: &str,
    id: Uuid,
    req: ObjectShareRequest,
) -> Result<ObjectResponse, AppError> {
    let mut prepared = prepare(state, dn, id, &req).await?;
    let requested = std::mem::take(&mut prepared.requested);
    let names: Vec<String> = requested.iter().map(|p| p.grantee.clone()).collect();
    let response = settle_and_commit(state, dn, prepared, ShareMode::Inject, Edit::Grant(requested)).await?;
    info!(id = %response.id, by = %dn, grantees = ?names, caps = %req.capabilities, "share added");
    Ok(response)
}

/// `DELETE /shared/{id}`: revokes read plus any requested bits from the
/// named grantees and rebuilds the share clause from what remains.
pub async fn remove_share(
    state: &AppState,
    dn: &str,
    id: Uuid,
    req: ObjectShareRequest,
) -> Result<ObjectResponse, AppError> {
    let prepared = prepare(state, dn, id, &req).await?;
    let grantees: BTreeSet<String> = prepared
        .requested
        .iter()
        .map(PermissionRecord::flat_grantee)
        .collect();
    let edit = Edit::Revoke {
        grantees: grantees.clone(),
        caps: req.capabilities.union(Capabilities::READ),
    };
    let response = settle_and_commit(state, dn, prepared, ShareMode::Rebuild, edit).await?;
    info!(id = %response.id, by = %dn, grantees = ?grantees, "share removed");
    Ok(response)
}
