//! Keeps an object's permission list and its marking's `share` clause
//! describing the same set of readers.
//!
//! Every path that changes either side (create, property update, share,
//! unshare) funnels through [`settle`]. It discards stored grants whose MAC
//! fails, applies the requested [`Edit`], injects or rebuilds the share
//! clause, has the authorization service flatten it, aligns read grants
//! with the flattened set and finally reseals every permission with the
//! file key.

use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    crypto::keys::{FileKey, KeyError, MasterKey, permission_is_valid, seal_permission},
    models::{
        marking::{Marking, MarkingError, Share, flatten_grantee},
        permission::{Capabilities, PermissionRecord},
    },
    services::aac::{AacError, AuthorizationGateway},
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Marking(#[from] MarkingError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Aac(#[from] AacError),
    #[error("owner {0} would lose access to the object")]
    OwnerLockedOut(String),
}

/// How the share clause is derived before flattening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    /// Union read grants into the existing clause.
    Inject,
    /// Leave the clause exactly as supplied.
    Keep,
    /// Discard the clause and rebuild it from read grants.
    Rebuild,
}

fn lowercased(fragment: &Share) -> Share {
    let mut out = Share {
        users: fragment.users.iter().map(|u| u.to_lowercase()).collect(),
        extra: fragment.extra.clone(),
        ..Share::default()
    };
    for (project, entry) in &fragment.projects {
        let mut entry = entry.clone();
        entry.disp_nm = entry.disp_nm.to_lowercase();
        entry.groups = entry.groups.iter().map(|g| g.to_lowercase()).collect();
        out.projects.insert(project.to_lowercase(), entry);
    }
    out
}

/// Union the share fragment of every read grant into `marking`. A read
/// grant to everyone clears the clause instead.
pub fn inject_read_into_share(
    permissions: &[PermissionRecord],
    marking: &mut Marking,
) -> Result<(), ReconcileError> {
    let mut share = lowercased(&marking.share()?);
    for permission in permissions.iter().filter(|p| p.allow_read) {
        if permission.is_everyone() {
            marking.clear_share();
            return Ok(());
        }
        share.merge(&lowercased(&permission.share_fragment()?));
    }
    marking.set_share(&share);
    Ok(())
}

/// Replace the share clause with the union of non-everyone read grants.
pub fn rebuild_share_from_permissions(
    permissions: &[PermissionRecord],
    marking: &mut Marking,
) -> Result<(), ReconcileError> {
    let mut share = Share::default();
    for permission in permissions
        .iter()
        .filter(|p| p.allow_read && !p.is_everyone())
    {
        share.merge(&lowercased(&permission.share_fragment()?));
    }
    marking.clear_share();
    marking.set_share(&share);
    Ok(())
}

/// Align read grants with the flattened `f_share` of `marking`.
///
/// Afterwards a non-owner grantee holds read exactly when it appears in
/// `f_share`, or everyone holds read when `f_share` is empty. The owner is
/// left with at least CUDS and grants with no capability are dropped.
pub fn normalize_reads_against_share(
    object_id: Uuid,
    owner: &str,
    permissions: &mut Vec<PermissionRecord>,
    marking: &Marking,
) -> Result<(), ReconcileError> {
    let acm_grants = marking.f_share();

    if acm_grants.is_empty() {
        match permissions.iter_mut().find(|p| p.is_everyone()) {
            Some(everyone) => everyone.allow_read = true,
            None => permissions.push(PermissionRecord::everyone(object_id, Capabilities::READ)),
        }
        for permission in permissions.iter_mut().filter(|p| !p.is_everyone()) {
            permission.allow_read = false;
        }
    } else {
        let share = marking.share()?;
        for flat in &acm_grants {
            if let Some(existing) = permissions.iter_mut().find(|p| p.flat_grantee() == *flat) {
                existing.allow_read = true;
                continue;
            }
            match share.fragment_for(flat) {
                Some((grantee, display, fragment)) => {
                    permissions.push(PermissionRecord::for_share_entry(
                        object_id,
                        &grantee,
                        &display,
                        &fragment,
                        Capabilities::READ,
                    ));
                }
                None => debug!(grantee = %flat, "flattened grantee not named in share"),
            }
        }
        for permission in permissions.iter_mut() {
            if permission.allow_read
                && (permission.is_everyone() || !acm_grants.contains(&permission.flat_grantee()))
            {
                permission.allow_read = false;
            }
        }
    }

    match permissions.iter_mut().find(|p| p.is_for(owner)) {
        Some(own) => own.set_capabilities(own.capabilities().union(Capabilities::CUDS)),
        None => permissions.push(PermissionRecord::for_user(object_id, owner, Capabilities::CUDS)),
    }
    permissions.retain(|p| !p.capabilities().is_empty());
    Ok(())
}

/// Grant `record`'s bits to its grantee, adding it when absent.
pub fn grant(permissions: &mut Vec<PermissionRecord>, record: PermissionRecord) {
    let flat = record.flat_grantee();
    match permissions.iter_mut().find(|p| p.flat_grantee() == flat) {
        Some(existing) => {
            existing.set_capabilities(existing.capabilities().union(record.capabilities()));
            existing.explicit_share |= record.explicit_share;
        }
        None => permissions.push(record),
    }
}

/// Replace the bits of `record`'s grantee outright.
pub fn replace(permissions: &mut Vec<PermissionRecord>, record: PermissionRecord) {
    let flat = record.flat_grantee();
    match permissions.iter_mut().find(|p| p.flat_grantee() == flat) {
        Some(existing) => {
            existing.set_capabilities(record.capabilities());
            existing.explicit_share = record.explicit_share;
        }
        None => permissions.push(record),
    }
}

/// Clear the bits in `caps` from every grant whose flattened grantee is in
/// `grantees`.
pub fn revoke(permissions: &mut [PermissionRecord], grantees: &BTreeSet<String>, caps: Capabilities) {
    for permission in permissions
        .iter_mut()
        .filter(|p| grantees.contains(&p.flat_grantee()))
    {
        let current = permission.capabilities();
        permission.set_capabilities(Capabilities {
            create: current.create && !caps.create,
            read: current.read && !caps.read,
            update: current.update && !caps.update,
            delete: current.delete && !caps.delete,
            share: current.share && !caps.share,
        });
    }
}

/// A share clause change needs the share capability.
pub fn share_changed(old: &Marking, new: &Marking) -> Result<bool, ReconcileError> {
    Ok(old.share_differs(new)?)
}

/// Drop stored grants whose MAC does not validate, unsealed ones included.
/// They are treated as absent, so nothing derived from them survives a
/// reseal.
pub fn discard_forged(master: &MasterKey, permissions: &mut Vec<PermissionRecord>) -> usize {
    let before = permissions.len();
    permissions.retain(|p| {
        let keep = permission_is_valid(master, p);
        if !keep {
            warn!(grantee = %p.grantee, object = %p.object_id, "discarding permission with invalid mac");
        }
        keep
    });
    before - permissions.len()
}

/// Wrap the file key onto every grant under a fresh IV and sign it.
fn seal_all(
    master: &MasterKey,
    file_key: &FileKey,
    permissions: &mut [PermissionRecord],
) -> Result<(), ReconcileError> {
    for permission in permissions.iter_mut() {
        seal_permission(master, file_key, permission)?;
    }
    Ok(())
}

/// Grant changes requested by the caller.
#[derive(Debug, Clone, Default)]
pub enum Edit {
    #[default]
    None,
    /// Union each record's bits into its grantee's grant.
    Grant(Vec<PermissionRecord>),
    /// Overwrite each grantee's bits.
    Replace(Vec<PermissionRecord>),
    /// Clear `caps` from the named grantees.
    Revoke {
        grantees: BTreeSet<String>,
        caps: Capabilities,
    },
}

impl Edit {
    fn apply(self, permissions: &mut Vec<PermissionRecord>) {
        match self {
            Edit::None => {}
            Edit::Grant(records) => records.into_iter().for_each(|r| grant(permissions, r)),
            Edit::Replace(records) => records.into_iter().for_each(|r| replace(permissions, r)),
            Edit::Revoke { grantees, caps } => revoke(permissions, &grantees, caps),
        }
    }
}

/// Inputs of one reconciliation.
pub struct Settle<'a> {
    pub object_id: Uuid,
    pub owner: &'a str,
    pub modifier: &'a str,
    pub mode: ShareMode,
    pub edit: Edit,
}

/// Bring `permissions` and `marking` into agreement and return the
/// flattened marking to store.
///
/// Fails when the owner or the modifier could not read the result. Stored
/// grants must reach this unedited; changes travel in [`Settle::edit`].
pub async fn settle(
    gateway: &AuthorizationGateway,
    master: &MasterKey,
    file_key: &FileKey,
    args: Settle<'_>,
    permissions: &mut Vec<PermissionRecord>,
    marking: Marking,
) -> Result<Marking, ReconcileError> {
    discard_forged(master, permissions);
    args.edit.apply(permissions);

    let mut marking = marking;
    match args.mode {
        ShareMode::Inject => inject_read_into_share(permissions, &mut marking)?,
        ShareMode::Rebuild => rebuild_share_from_permissions(permissions, &mut marking)?,
        ShareMode::Keep => {}
    }

    let flat = gateway.flatten(&marking).await?;
    normalize_reads_against_share(args.object_id, args.owner, permissions, &flat)?;

    if !gateway.is_authorized(args.owner, &flat).await? {
        return Err(ReconcileError::OwnerLockedOut(args.owner.to_string()));
    }
    if flatten_grantee(args.modifier) != flatten_grantee(args.owner) {
        gateway.check_access(args.modifier, &flat).await?;
    }

    seal_all(master, file_key, permissions)?;
    Ok(flat)
}
