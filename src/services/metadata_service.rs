//! src/services/metadata_service.rs
//!
//! MetadataService: objects, their permissions and revision history in
//! SQLite. Every committed change is guarded by the object's change token
//! and leaves a revision snapshot behind.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions},
};
use std::{collections::BTreeSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{
    object::{ObjectRecord, Paging},
    permission::PermissionRecord,
    revision::RevisionRecord,
};

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("object {} not found", .0.simple())]
    ObjectNotFound(Uuid),
    #[error("revision {change_count} of object {} not found", .id.simple())]
    RevisionNotFound { id: Uuid, change_count: i64 },
    #[error("change token mismatch on object {}", .0.simple())]
    ChangeTokenMismatch(Uuid),
    #[error("permission snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Token a client must echo back to update an object at this state.
pub fn change_token(id: Uuid, change_count: i64, modified: DateTime<Utc>) -> String {
    let seed = format!(
        "{}:{}:{}",
        id.simple(),
        change_count,
        modified.to_rfc3339_opts(SecondsFormat::Nanos, true)
    );
    format!("{:x}", md5::compute(seed))
}

/// Which descendants a committed change spills over to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cascade {
    None,
    AncestorDeleted(bool),
    Expunged,
}

/// Which slice of the tree a listing covers.
#[derive(Debug, Clone, Copy)]
pub enum Listing<'a> {
    /// Live root objects owned by `owner`.
    Roots { owner: &'a str },
    /// Live children of `parent`.
    Children { parent: Uuid },
    /// Objects `owner` put in the trash directly.
    Trash { owner: &'a str },
}

/// Open a pool; the database file is created when missing.
pub async fn open_pool(options: SqliteConnectOptions, max_connections: u32) -> MetadataResult<SqlitePool> {
    Ok(SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options.create_if_missing(true))
        .await?)
}

#[derive(Clone)]
pub struct MetadataService {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl MetadataService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> MetadataResult<usize> {
        let statements: Vec<&str> = MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        info!(statements = statements.len(), "running migrations");
        for stmt in &statements {
            debug!(sql = %stmt, "executing migration statement");
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    pub async fn ping(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&*self.db).await?;
        Ok(())
    }

    /// Insert a new object with its permissions and first revision.
    /// Assigns the change token.
    pub async fn create_object(&self, record: &mut ObjectRecord) -> MetadataResult<()> {
        let now = Utc::now();
        record.created_date = now;
        record.modified_date = now;
        record.change_count = 0;
        record.change_token = change_token(record.id, 0, now);

        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO objects (
                id, created_date, created_by, modified_date, modified_by,
                change_count, change_token, owned_by, type_name, name, description,
                parent_id, raw_acm, content_connector, content_type, content_size,
                content_hash, encrypt_iv, is_deleted, is_ancestor_deleted, is_expunged,
                deleted_date, deleted_by
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id)
        .bind(record.created_date)
        .bind(&record.created_by)
        .bind(record.modified_date)
        .bind(&record.modified_by)
        .bind(record.change_count)
        .bind(&record.change_token)
        .bind(&record.owned_by)
        .bind(&record.type_name)
        .bind(&record.name)
        .bind(&record.description)
        .bind(record.parent_id)
        .bind(&record.raw_acm)
        .bind(&record.content_connector)
        .bind(&record.content_type)
        .bind(record.content_size)
        .bind(&record.content_hash)
        .bind(&record.encrypt_iv)
        .bind(record.is_deleted)
        .bind(record.is_ancestor_deleted)
        .bind(record.is_expunged)
        .bind(record.deleted_date)
        .bind(&record.deleted_by)
        .execute(&mut *tx)
        .await?;

        insert_permissions(&mut tx, record).await?;
        insert_revision(&mut tx, record).await?;
        tx.commit().await?;

        debug!(id = %record.hex_id(), name = %record.name, "object created");
        Ok(())
    }

    /// Object row plus its current permissions.
    pub async fn get_object(&self, id: Uuid) -> MetadataResult<ObjectRecord> {
        let mut record = sqlx::query_as::<_, ObjectRecord>("SELECT * FROM objects WHERE id = ?")
            .bind(id)
            .fetch_one(&*self.db)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => MetadataError::ObjectNotFound(id),
                other => MetadataError::Sqlx(other),
            })?;
        record.permissions = self.get_permissions(id).await?;
        Ok(record)
    }

    pub async fn get_permissions(&self, object_id: Uuid) -> MetadataResult<Vec<PermissionRecord>> {
        Ok(sqlx::query_as::<_, PermissionRecord>(
            "SELECT * FROM object_permissions WHERE object_id = ? ORDER BY created_date, grantee",
        )
        .bind(object_id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Commit `record` if the stored token still equals `expected_token`.
    ///
    /// On success `record` carries the new change count and token, its
    /// permissions replace the stored ones and a revision is written.
    pub async fn update_object(
        &self,
        record: &mut ObjectRecord,
        expected_token: &str,
        cascade: Cascade,
    ) -> MetadataResult<()> {
        let modified = Utc::now();
        let next_count = record.change_count + 1;
        let next_token = change_token(record.id, next_count, modified);

        let mut tx = self.db.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE objects SET
                modified_date = ?, modified_by = ?, change_count = ?, change_token = ?,
                owned_by = ?, type_name = ?, name = ?, description = ?, parent_id = ?,
                raw_acm = ?, content_connector = ?, content_type = ?, content_size = ?,
                content_hash = ?, encrypt_iv = ?, is_deleted = ?, is_ancestor_deleted = ?,
                is_expunged = ?, deleted_date = ?, deleted_by = ?
            WHERE id = ? AND change_token = ?
            "#,
        )
        .bind(modified)
        .bind(&record.modified_by)
        .bind(next_count)
        .bind(&next_token)
        .bind(&record.owned_by)
        .bind(&record.type_name)
        .bind(&record.name)
        .bind(&record.description)
        .bind(record.parent_id)
        .bind(&record.raw_acm)
        .bind(&record.content_connector)
        .bind(&record.content_type)
        .bind(record.content_size)
        .bind(&record.content_hash)
        .bind(&record.encrypt_iv)
        .bind(record.is_deleted)
        .bind(record.is_ancestor_deleted)
        .bind(record.is_expunged)
        .bind(record.deleted_date)
        .bind(&record.deleted_by)
        .bind(record.id)
        .bind(expected_token)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM objects WHERE id = ?")
                .bind(record.id)
                .fetch_optional(&*self.db)
                .await?;
            return Err(match exists {
                Some(_) => MetadataError::ChangeTokenMismatch(record.id),
                None => MetadataError::ObjectNotFound(record.id),
            });
        }

        record.modified_date = modified;
        record.change_count = next_count;
        record.change_token = next_token;

        sqlx::query("DELETE FROM object_permissions WHERE object_id = ?")
            .bind(record.id)
            .execute(&mut *tx)
            .await?;
        insert_permissions(&mut tx, record).await?;
        insert_revision(&mut tx, record).await?;

        let cascaded = match cascade {
            Cascade::None => 0,
            Cascade::AncestorDeleted(flag) => {
                sqlx::query(DESCENDANTS_DELETED)
                    .bind(record.id)
                    .bind(flag)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
            Cascade::Expunged => {
                sqlx::query(DESCENDANTS_EXPUNGED)
                    .bind(record.id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
        };
        tx.commit().await?;

        debug!(
            id = %record.hex_id(),
            change_count = record.change_count,
            cascaded,
            "object updated"
        );
        Ok(())
    }

    /// True when `candidate` is `id` or sits anywhere beneath it.
    pub async fn is_descendant(&self, id: Uuid, candidate: Uuid) -> MetadataResult<bool> {
        if id == candidate {
            return Ok(true);
        }
        let found: Option<i64> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE d(id) AS (
                SELECT id FROM objects WHERE parent_id = ?
                UNION ALL
                SELECT o.id FROM objects o JOIN d ON o.parent_id = d.id
            )
            SELECT 1 FROM d WHERE id = ? LIMIT 1
            "#,
        )
        .bind(id)
        .bind(candidate)
        .fetch_optional(&*self.db)
        .await?;
        Ok(found.is_some())
    }

    /// One page of objects in `listing` readable by any of `grantees`
    /// (flattened), newest first.
    pub async fn list_objects(
        &self,
        listing: Listing<'_>,
        grantees: &BTreeSet<String>,
        paging: Paging,
    ) -> MetadataResult<(i64, Vec<ObjectRecord>)> {
        let paging = paging.normalized();

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM objects o WHERE ");
        push_listing_filter(&mut count, listing, grantees);
        let total: i64 = count.build_query_scalar().fetch_one(&*self.db).await?;

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT o.* FROM objects o WHERE ");
        push_listing_filter(&mut builder, listing, grantees);
        builder.push(" ORDER BY o.created_date DESC, o.id LIMIT ");
        builder.push_bind(paging.page_size);
        builder.push(" OFFSET ");
        builder.push_bind(paging.offset());

        let mut rows: Vec<ObjectRecord> = builder.build_query_as().fetch_all(&*self.db).await?;
        for row in rows.iter_mut() {
            row.permissions = self.get_permissions(row.id).await?;
        }
        Ok((total, rows))
    }

    /// Revisions of an object, newest first.
    pub async fn list_revisions(
        &self,
        id: Uuid,
        paging: Paging,
    ) -> MetadataResult<(i64, Vec<RevisionRecord>)> {
        let paging = paging.normalized();
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM object_revisions WHERE object_id = ?")
            .bind(id)
            .fetch_one(&*self.db)
            .await?;
        let rows = sqlx::query_as::<_, RevisionRecord>(
            "SELECT * FROM object_revisions WHERE object_id = ? ORDER BY change_count DESC LIMIT ? OFFSET ?",
        )
        .bind(id)
        .bind(paging.page_size)
        .bind(paging.offset())
        .fetch_all(&*self.db)
        .await?;
        Ok((total, rows))
    }

    pub async fn get_revision(&self, id: Uuid, change_count: i64) -> MetadataResult<RevisionRecord> {
        sqlx::query_as::<_, RevisionRecord>(
            "SELECT * FROM object_revisions WHERE object_id = ? AND change_count = ?",
        )
        .bind(id)
        .bind(change_count)
        .fetch_one(&*self.db)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => MetadataError::RevisionNotFound { id, change_count },
            other => MetadataError::Sqlx(other),
        })
    }
}

const DESCENDANTS_DELETED: &str = r#"
    WITH RECURSIVE d(id) AS (
        SELECT id FROM objects WHERE parent_id = ?1
        UNION ALL
        SELECT o.id FROM objects o JOIN d ON o.parent_id = d.id
    )
    UPDATE objects SET is_ancestor_deleted = ?2 WHERE id IN (SELECT id FROM d)
"#;

const DESCENDANTS_EXPUNGED: &str = r#"
    WITH RECURSIVE d(id) AS (
        SELECT id FROM objects WHERE parent_id = ?1
        UNION ALL
        SELECT o.id FROM objects o JOIN d ON o.parent_id = d.id
    )
    UPDATE objects SET is_expunged = 1, is_ancestor_deleted = 1 WHERE id IN (SELECT id FROM d)
"#;

fn push_listing_filter<'a>(
    builder: &mut QueryBuilder<'a, Sqlite>,
    listing: Listing<'a>,
    grantees: &'a BTreeSet<String>,
) {
    match listing {
        Listing::Roots { owner } => {
            builder.push("o.parent_id IS NULL AND o.is_deleted = 0 AND o.owned_by = ");
            builder.push_bind(owner);
        }
        Listing::Children { parent } => {
            builder.push("o.parent_id = ");
            builder.push_bind(parent);
            builder.push(" AND o.is_deleted = 0 AND o.is_ancestor_deleted = 0");
        }
        Listing::Trash { owner } => {
            builder.push(
                "o.is_deleted = 1 AND o.is_expunged = 0 AND o.is_ancestor_deleted = 0 AND o.owned_by = ",
            );
            builder.push_bind(owner);
        }
    }
    builder.push(
        " AND EXISTS (SELECT 1 FROM object_permissions p WHERE p.object_id = o.id AND p.allow_read = 1 AND p.grantee_key IN (",
    );
    let mut separated = builder.separated(", ");
    if grantees.is_empty() {
        separated.push_bind("");
    }
    for grantee in grantees {
        separated.push_bind(grantee.as_str());
    }
    separated.push_unseparated("))");
}

async fn insert_permissions(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    record: &ObjectRecord,
) -> MetadataResult<()> {
    for permission in &record.permissions {
        sqlx::query(
            r#"
            INSERT INTO object_permissions (
                id, object_id, grantee, grantee_key, display_name, acm_share,
                allow_create, allow_read, allow_update, allow_delete, allow_share,
                explicit_share, encrypt_key, permission_iv, permission_mac,
                created_by, created_date
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(permission.id)
        .bind(record.id)
        .bind(&permission.grantee)
        .bind(permission.flat_grantee())
        .bind(&permission.display_name)
        .bind(&permission.acm_share)
        .bind(permission.allow_create)
        .bind(permission.allow_read)
        .bind(permission.allow_update)
        .bind(permission.allow_delete)
        .bind(permission.allow_share)
        .bind(permission.explicit_share)
        .bind(&permission.encrypt_key)
        .bind(&permission.permission_iv)
        .bind(&permission.permission_mac)
        .bind(if permission.created_by.is_empty() {
            &record.modified_by
        } else {
            &permission.created_by
        })
        .bind(permission.created_date)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_revision(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    record: &ObjectRecord,
) -> MetadataResult<()> {
    let snapshot = serde_json::to_string(&record.permissions)?;
    sqlx::query(
        r#"
        INSERT INTO object_revisions (
            object_id, change_count, change_token, name, modified_by, modified_date,
            raw_acm, content_connector, content_type, content_size, content_hash,
            encrypt_iv, permissions
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.id)
    .bind(record.change_count)
    .bind(&record.change_token)
    .bind(&record.name)
    .bind(&record.modified_by)
    .bind(record.modified_date)
    .bind(&record.raw_acm)
    .bind(&record.content_connector)
    .bind(&record.content_type)
    .bind(record.content_size)
    .bind(&record.content_hash)
    .bind(&record.encrypt_iv)
    .bind(snapshot)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::permission::Capabilities;

    const OWNER: &str = "CN=test tester01,OU=People,O=U.S. Government,C=US";

    async fn service(dir: &tempfile::TempDir) -> MetadataService {
        let options = SqliteConnectOptions::new().filename(dir.path().join("meta.db"));
        let pool = open_pool(options, 4).await.unwrap();
        let svc = MetadataService::new(Arc::new(pool));
        svc.migrate().await.unwrap();
        svc
    }

    fn object(name: &str, parent: Option<Uuid>, readers: &[&str]) -> ObjectRecord {
        let mut record = ObjectRecord::new(OWNER, "File", name);
        record.parent_id = parent;
        record.raw_acm = r#"{"classif":"U"}"#.into();
        record
            .permissions
            .push(PermissionRecord::for_user(record.id, OWNER, Capabilities::CUDS));
        for reader in readers {
            let p = if *reader == "-Everyone" {
                PermissionRecord::everyone(record.id, Capabilities::READ)
            } else {
                PermissionRecord::for_user(record.id, reader, Capabilities::READ)
            };
            record.permissions.push(p);
        }
        record
    }

    fn grantees(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        // migrations are idempotent
        svc.migrate().await.unwrap();

        let mut record = object("a.txt", None, &["-Everyone"]);
        svc.create_object(&mut record).await.unwrap();
        assert_eq!(record.change_token.len(), 32);

        let loaded = svc.get_object(record.id).await.unwrap();
        assert_eq!(loaded.name, "a.txt");
        assert_eq!(loaded.change_token, record.change_token);
        assert_eq!(loaded.permissions.len(), 2);

        let (total, revisions) = svc.list_revisions(record.id, Paging::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(revisions[0].permission_snapshot().unwrap().len(), 2);

        assert!(matches!(
            svc.get_object(Uuid::new_v4()).await,
            Err(MetadataError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_requires_current_token() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        let mut record = object("a.txt", None, &["-Everyone"]);
        svc.create_object(&mut record).await.unwrap();
        let first_token = record.change_token.clone();

        record.name = "b.txt".into();
        svc.update_object(&mut record, &first_token, Cascade::None)
            .await
            .unwrap();
        assert_eq!(record.change_count, 1);
        assert_ne!(record.change_token, first_token);

        let mut stale = svc.get_object(record.id).await.unwrap();
        stale.name = "c.txt".into();
        let err = svc
            .update_object(&mut stale, &first_token, Cascade::None)
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::ChangeTokenMismatch(_)));
        assert_eq!(svc.get_object(record.id).await.unwrap().name, "b.txt");

        let old = svc.get_revision(record.id, 0).await.unwrap();
        assert_eq!(old.name, "a.txt");
        assert!(matches!(
            svc.get_revision(record.id, 9).await,
            Err(MetadataError::RevisionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_listing_respects_read_grants_and_trash() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;

        let mut folder = object("folder", None, &["-Everyone"]);
        svc.create_object(&mut folder).await.unwrap();
        let mut public = object("public", Some(folder.id), &["-Everyone"]);
        svc.create_object(&mut public).await.unwrap();
        let mut private = object("private", Some(folder.id), &["cn=friend"]);
        svc.create_object(&mut private).await.unwrap();

        let stranger = grantees(&["_everyone", "cnstranger"]);
        let friend = grantees(&["_everyone", "cnfriend"]);
        let listing = Listing::Children { parent: folder.id };

        let (total, rows) = svc.list_objects(listing, &stranger, Paging::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].name, "public");
        let (total, _) = svc.list_objects(listing, &friend, Paging::default()).await.unwrap();
        assert_eq!(total, 2);

        let (roots, _) = svc
            .list_objects(Listing::Roots { owner: OWNER }, &friend, Paging::default())
            .await
            .unwrap();
        assert_eq!(roots, 1);

        // trash the folder: children become ancestor-deleted
        let token = folder.change_token.clone();
        folder.is_deleted = true;
        svc.update_object(&mut folder, &token, Cascade::AncestorDeleted(true))
            .await
            .unwrap();
        let (total, _) = svc.list_objects(listing, &friend, Paging::default()).await.unwrap();
        assert_eq!(total, 0);
        let (trashed, rows) = svc
            .list_objects(Listing::Trash { owner: OWNER }, &friend, Paging::default())
            .await
            .unwrap();
        assert_eq!(trashed, 1);
        assert_eq!(rows[0].id, folder.id);
        assert!(svc.get_object(public.id).await.unwrap().is_ancestor_deleted);

        assert!(svc.is_descendant(folder.id, private.id).await.unwrap());
        assert!(!svc.is_descendant(private.id, folder.id).await.unwrap());
    }

    #[test]
    fn test_change_token_depends_on_count() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        assert_eq!(change_token(id, 1, now), change_token(id, 1, now));
        assert_ne!(change_token(id, 1, now), change_token(id, 2, now));
    }
}
