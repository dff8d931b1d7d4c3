use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use hyper::body::Body;
use sea_query::{Alias, Cond, Expr, Iden, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::default_spool_dir;
use crate::errors::{Error, Result};
use crate::oci_digest::{referenced_digests, OciDigest};

use super::{
    BlobBody, BlobRecord, ChunkStats, FinalizeOutcome, GcReport, GcStats, ManifestRecord,
    ManifestRef, RegistryStore, StoreStats, StoredRow, SweepTotals,
};

#[derive(Iden)]
enum Blobs {
    Table,
    Id,
    SessionId,
    ChunkIndex,
    Digest,
    Bytes,
    Size,
}

#[derive(Iden)]
enum Manifests {
    Table,
    Id,
    Name,
    Tag,
    Bytes,
    Digest,
}

// Two logical tables. Chunk rows have a NULL digest; the unique index on
// digest ignores NULLs, so it constrains finalized rows only.
const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS blobs ( \
        id INTEGER PRIMARY KEY AUTOINCREMENT, \
        session_id TEXT, \
        chunk_index INTEGER, \
        digest TEXT, \
        bytes BLOB NOT NULL, \
        size INTEGER NOT NULL )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_blobs_digest ON blobs ( digest )",
    "CREATE INDEX IF NOT EXISTS idx_blobs_session ON blobs ( session_id )",
    "CREATE TABLE IF NOT EXISTS manifests ( \
        id INTEGER PRIMARY KEY AUTOINCREMENT, \
        name TEXT NOT NULL, \
        tag TEXT NOT NULL, \
        bytes BLOB NOT NULL, \
        digest TEXT NOT NULL )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_manifests_name_tag ON manifests ( name, tag )",
];

#[derive(Clone, Deserialize)]
pub struct SqliteConfig {
    pub path: PathBuf,
    /// Spool directory for streamed chunk bodies; defaults to the system
    /// temp dir.
    pub spool_dir: Option<PathBuf>,
    pub max_connections: Option<u32>,
}

impl SqliteConfig {
    pub async fn new_store(&self) -> Result<SqliteStore> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(8))
            .connect_with(options)
            .await?;
        let volume = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let store = SqliteStore {
            pool,
            spool_dir: self.spool_dir.clone().unwrap_or_else(default_spool_dir),
            volume,
        };
        store.ensure_schema().await?;
        Ok(store)
    }
}

pub struct SqliteStore {
    pool: Pool<Sqlite>,
    spool_dir: PathBuf,
    /// Directory holding the database file; watched for disk pressure.
    volume: PathBuf,
}

impl SqliteStore {
    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// The volume whose free space the cleanup task watches.
    pub fn storage_volume(&self) -> &PathBuf {
        &self.volume
    }

    fn spool_path(&self, session: &Uuid, suffix: &str) -> PathBuf {
        self.spool_dir
            .join(format!("stevedore-{session}-{suffix}.spool"))
    }

    /// Stream a body into a spool file, returning its size. The caller
    /// removes the file.
    async fn spool_body(path: &PathBuf, mut body: Body) -> Result<u64> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut written: u64 = 0;
        while let Some(frame) = body.next().await {
            let bytes = frame?;
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    async fn remove_spool(path: &PathBuf) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("failed to remove spool file {}: {e}", path.display());
            }
        }
    }

    /// Verify the chunk rows form a dense `0..n-1` prefix and concatenate
    /// them, hashing on the way. Multi-chunk sessions go through a spool
    /// file; a single chunk needs no concatenation buffer.
    async fn stitch(
        &self,
        session: &Uuid,
        rows: &[sqlx::sqlite::SqliteRow],
    ) -> Result<(Vec<u8>, OciDigest)> {
        let mut digester = OciDigest::digester();

        if rows.len() == 1 {
            let index: i64 = rows[0].try_get("chunk_index")?;
            if index != 0 {
                return Err(Error::ChunkGap(*session));
            }
            let bytes: Vec<u8> = rows[0].try_get("bytes")?;
            digester.update(&bytes);
            return Ok((bytes, digester.finalize()));
        }

        let path = self.spool_path(session, "stitch");
        let result = async {
            let mut file = tokio::fs::File::create(&path).await?;
            for (i, row) in rows.iter().enumerate() {
                let index: i64 = row.try_get("chunk_index")?;
                if index != i as i64 {
                    return Err(Error::ChunkGap(*session));
                }
                let bytes: Vec<u8> = row.try_get("bytes")?;
                digester.update(&bytes);
                file.write_all(&bytes).await?;
            }
            file.flush().await?;
            drop(file);
            tokio::fs::read(&path).await.map_err(Error::from)
        }
        .await;
        Self::remove_spool(&path).await;

        Ok((result?, digester.finalize()))
    }

    fn delete_chunks_query(session: &Uuid) -> (String, sea_query_binder::SqlxValues) {
        Query::delete()
            .from_table(Blobs::Table)
            .and_where(Expr::col(Blobs::SessionId).eq(session.to_string()))
            .and_where(Expr::col(Blobs::Digest).is_null())
            .build_sqlx(SqliteQueryBuilder)
    }

    fn row_to_manifest(row: &sqlx::sqlite::SqliteRow) -> Result<ManifestRecord> {
        let digest: String = row.try_get("digest")?;
        let bytes: Vec<u8> = row.try_get("bytes")?;
        Ok(ManifestRecord {
            name: row.try_get("name")?,
            tag: row.try_get("tag")?,
            digest: OciDigest::try_from(digest.as_str())?,
            bytes: Bytes::from(bytes),
        })
    }

    /// Read every manifest's id and extracted digest references.
    async fn manifest_references(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
    ) -> Result<Vec<(i64, Vec<String>)>> {
        let (sql, values) = Query::select()
            .from(Manifests::Table)
            .columns([Manifests::Id, Manifests::Bytes])
            .build_sqlx(SqliteQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(&mut **tx).await?;

        let mut references = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let bytes: Vec<u8> = row.try_get("bytes")?;
            references.push((id, referenced_digests(&bytes)));
        }
        Ok(references)
    }
}

#[async_trait]
impl RegistryStore for SqliteStore {
    async fn blob_exists(&self, digest: &OciDigest) -> Result<bool> {
        let (sql, values) = Query::select()
            .expr_as(
                Expr::exists(
                    Query::select()
                        .from(Blobs::Table)
                        .column(Blobs::Id)
                        .and_where(Expr::col(Blobs::Digest).eq(String::from(digest)))
                        .to_owned(),
                ),
                Alias::new("present"),
            )
            .build_sqlx(SqliteQueryBuilder);
        let row = sqlx::query_with(&sql, values).fetch_one(&self.pool).await?;

        Ok(row.try_get("present")?)
    }

    async fn get_blob(&self, digest: &OciDigest) -> Result<Option<(BlobRecord, BlobBody)>> {
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([Blobs::Bytes, Blobs::Size])
            .and_where(Expr::col(Blobs::Digest).eq(String::from(digest)))
            .build_sqlx(SqliteQueryBuilder);
        let row = match sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?
        {
            Some(row) => row,
            None => return Ok(None),
        };

        let record = BlobRecord {
            digest: digest.clone(),
            size: row.try_get("size")?,
        };
        let bytes: Vec<u8> = row.try_get("bytes")?;
        let frames: Vec<super::TryBytes> = vec![Ok(Bytes::from(bytes))];
        Ok(Some((record, futures::stream::iter(frames).boxed())))
    }

    async fn delete_blob(&self, digest: &OciDigest) -> Result<bool> {
        let (sql, values) = Query::delete()
            .from_table(Blobs::Table)
            .and_where(Expr::col(Blobs::Digest).eq(String::from(digest)))
            .build_sqlx(SqliteQueryBuilder);
        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn put_chunk(&self, session: &Uuid, index: i64, body: Body) -> Result<u64> {
        let path = self.spool_path(session, &index.to_string());
        let result = async {
            let written = Self::spool_body(&path, body).await?;
            let contents = tokio::fs::read(&path).await?;

            let (sql, values) = Query::insert()
                .into_table(Blobs::Table)
                .columns([
                    Blobs::SessionId,
                    Blobs::ChunkIndex,
                    Blobs::Bytes,
                    Blobs::Size,
                ])
                .values([
                    session.to_string().into(),
                    index.into(),
                    contents.into(),
                    (written as i64).into(),
                ])?
                .build_sqlx(SqliteQueryBuilder);
            sqlx::query_with(&sql, values).execute(&self.pool).await?;
            Ok(written)
        }
        .await;
        Self::remove_spool(&path).await;
        result
    }

    async fn chunk_count(&self, session: &Uuid) -> Result<i64> {
        Ok(self.chunk_stats(session).await?.count)
    }

    async fn chunk_stats(&self, session: &Uuid) -> Result<ChunkStats> {
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .expr_as(Expr::col(Blobs::Id).count(), Alias::new("count"))
            .expr_as(Expr::col(Blobs::Size).sum(), Alias::new("total"))
            .and_where(Expr::col(Blobs::SessionId).eq(session.to_string()))
            .and_where(Expr::col(Blobs::Digest).is_null())
            .build_sqlx(SqliteQueryBuilder);
        let row = sqlx::query_with(&sql, values).fetch_one(&self.pool).await?;

        Ok(ChunkStats {
            count: row.try_get("count")?,
            bytes: row.try_get::<Option<i64>, _>("total")?.unwrap_or(0) as u64,
        })
    }

    async fn chunk_sessions(&self) -> Result<Vec<Uuid>> {
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .distinct()
            .column(Blobs::SessionId)
            .and_where(Expr::col(Blobs::Digest).is_null())
            .and_where(Expr::col(Blobs::SessionId).is_not_null())
            .build_sqlx(SqliteQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("session_id")?;
            sessions.push(Uuid::parse_str(&id)?);
        }
        Ok(sessions)
    }

    async fn delete_session_chunks(&self, session: &Uuid) -> Result<SweepTotals> {
        let mut tx = self.pool.begin().await?;

        let stats = {
            let (sql, values) = Query::select()
                .from(Blobs::Table)
                .expr_as(Expr::col(Blobs::Id).count(), Alias::new("count"))
                .expr_as(Expr::col(Blobs::Size).sum(), Alias::new("total"))
                .and_where(Expr::col(Blobs::SessionId).eq(session.to_string()))
                .and_where(Expr::col(Blobs::Digest).is_null())
                .build_sqlx(SqliteQueryBuilder);
            let row = sqlx::query_with(&sql, values).fetch_one(&mut *tx).await?;
            SweepTotals {
                rows: row.try_get::<i64, _>("count")? as u64,
                bytes: row.try_get::<Option<i64>, _>("total")?.unwrap_or(0) as u64,
            }
        };

        let (sql, values) = Self::delete_chunks_query(session);
        sqlx::query_with(&sql, values).execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(stats)
    }

    async fn finalize_upload(
        &self,
        session: &Uuid,
        digest: &OciDigest,
    ) -> Result<FinalizeOutcome> {
        let mut tx = self.pool.begin().await?;

        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([Blobs::ChunkIndex, Blobs::Bytes])
            .and_where(Expr::col(Blobs::SessionId).eq(session.to_string()))
            .and_where(Expr::col(Blobs::Digest).is_null())
            .order_by(Blobs::ChunkIndex, Order::Asc)
            .build_sqlx(SqliteQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(&mut *tx).await?;
        if rows.is_empty() {
            return Err(Error::ChunkGap(*session));
        }

        let (contents, computed) = self.stitch(session, &rows).await?;
        if computed != *digest {
            // implicit rollback on drop; the session keeps its chunks
            return Err(Error::DigestMismatch {
                declared: String::from(digest),
                computed: String::from(&computed),
            });
        }
        let size = contents.len() as u64;

        let (sql, values) = Query::insert()
            .into_table(Blobs::Table)
            .columns([Blobs::Digest, Blobs::Bytes, Blobs::Size])
            .values([
                String::from(digest).into(),
                contents.into(),
                (size as i64).into(),
            ])?
            .build_sqlx(SqliteQueryBuilder);
        let inserted = match sqlx::query_with(&sql, values).execute(&mut *tx).await {
            Ok(_) => true,
            Err(sqlx::Error::Database(dbe)) if dbe.is_unique_violation() => false,
            Err(e) => return Err(e.into()),
        };

        let (sql, values) = Self::delete_chunks_query(session);
        sqlx::query_with(&sql, values).execute(&mut *tx).await?;
        tx.commit().await?;

        if inserted {
            Ok(FinalizeOutcome::Created { size })
        } else {
            Ok(FinalizeOutcome::AlreadyExists)
        }
    }

    async fn put_manifest(
        &self,
        name: &str,
        tag: &str,
        digest: &OciDigest,
        bytes: &[u8],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let (sql, values) = Query::delete()
            .from_table(Manifests::Table)
            .and_where(Expr::col(Manifests::Name).eq(name))
            .and_where(Expr::col(Manifests::Tag).eq(tag))
            .build_sqlx(SqliteQueryBuilder);
        sqlx::query_with(&sql, values).execute(&mut *tx).await?;

        let (sql, values) = Query::insert()
            .into_table(Manifests::Table)
            .columns([
                Manifests::Name,
                Manifests::Tag,
                Manifests::Bytes,
                Manifests::Digest,
            ])
            .values([
                name.into(),
                tag.into(),
                bytes.to_vec().into(),
                String::from(digest).into(),
            ])?
            .build_sqlx(SqliteQueryBuilder);
        sqlx::query_with(&sql, values).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_manifest(
        &self,
        name: &str,
        reference: &ManifestRef,
    ) -> Result<Option<ManifestRecord>> {
        let mut query = Query::select();
        query
            .from(Manifests::Table)
            .columns([
                Manifests::Name,
                Manifests::Tag,
                Manifests::Bytes,
                Manifests::Digest,
            ])
            .and_where(Expr::col(Manifests::Name).eq(name));
        match reference {
            ManifestRef::Tag(tag) => {
                query.and_where(Expr::col(Manifests::Tag).eq(tag.as_str()));
            }
            ManifestRef::Digest(digest) => {
                query
                    .and_where(Expr::col(Manifests::Digest).eq(String::from(digest)))
                    .limit(1);
            }
        }
        let (sql, values) = query.build_sqlx(SqliteQueryBuilder);

        match sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?
        {
            Some(row) => Ok(Some(Self::row_to_manifest(&row)?)),
            None => Ok(None),
        }
    }

    async fn manifest_exists(&self, name: &str, tag: &str) -> Result<bool> {
        let (sql, values) = Query::select()
            .expr_as(
                Expr::exists(
                    Query::select()
                        .from(Manifests::Table)
                        .column(Manifests::Id)
                        .and_where(Expr::col(Manifests::Name).eq(name))
                        .cond_where(
                            Cond::any()
                                .add(Expr::col(Manifests::Tag).eq(tag))
                                .add(Expr::col(Manifests::Digest).eq(tag)),
                        )
                        .to_owned(),
                ),
                Alias::new("present"),
            )
            .build_sqlx(SqliteQueryBuilder);
        let row = sqlx::query_with(&sql, values).fetch_one(&self.pool).await?;

        Ok(row.try_get("present")?)
    }

    async fn digest_for(&self, name: &str, tag: &str) -> Result<Option<OciDigest>> {
        let (sql, values) = Query::select()
            .from(Manifests::Table)
            .column(Manifests::Digest)
            .and_where(Expr::col(Manifests::Name).eq(name))
            .cond_where(
                Cond::any()
                    .add(Expr::col(Manifests::Tag).eq(tag))
                    .add(Expr::col(Manifests::Digest).eq(tag)),
            )
            .limit(1)
            .build_sqlx(SqliteQueryBuilder);

        match sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?
        {
            Some(row) => {
                let digest: String = row.try_get("digest")?;
                Ok(Some(OciDigest::try_from(digest.as_str())?))
            }
            None => Ok(None),
        }
    }

    async fn delete_manifest(&self, name: &str, tag: &str) -> Result<bool> {
        let (sql, values) = Query::delete()
            .from_table(Manifests::Table)
            .and_where(Expr::col(Manifests::Name).eq(name))
            .and_where(Expr::col(Manifests::Tag).eq(tag))
            .build_sqlx(SqliteQueryBuilder);
        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_repository(&self, name: &str) -> Result<u64> {
        let (sql, values) = Query::delete()
            .from_table(Manifests::Table)
            .and_where(Expr::col(Manifests::Name).eq(name))
            .build_sqlx(SqliteQueryBuilder);
        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn list_repositories(&self) -> Result<Vec<String>> {
        let (sql, values) = Query::select()
            .from(Manifests::Table)
            .distinct()
            .column(Manifests::Name)
            .order_by(Manifests::Name, Order::Asc)
            .build_sqlx(SqliteQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| row.try_get("name").map_err(Error::from))
            .collect()
    }

    async fn list_tags(&self, name: &str) -> Result<Vec<String>> {
        let (sql, values) = Query::select()
            .from(Manifests::Table)
            .column(Manifests::Tag)
            .and_where(Expr::col(Manifests::Name).eq(name))
            .order_by(Manifests::Tag, Order::Asc)
            .build_sqlx(SqliteQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| row.try_get("tag").map_err(Error::from))
            .collect()
    }

    async fn scan(&self) -> Result<Vec<StoredRow>> {
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([
                Blobs::SessionId,
                Blobs::ChunkIndex,
                Blobs::Digest,
                Blobs::Size,
            ])
            .order_by(Blobs::Id, Order::Asc)
            .build_sqlx(SqliteQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;

        let mut scanned = Vec::with_capacity(rows.len());
        for row in rows {
            let session_id: Option<String> = row.try_get("session_id")?;
            scanned.push(StoredRow {
                session_id: session_id
                    .map(|s| Uuid::parse_str(&s))
                    .transpose()?,
                chunk_index: row.try_get("chunk_index")?,
                digest: row.try_get("digest")?,
                size: row.try_get("size")?,
            });
        }
        Ok(scanned)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let repositories = self.list_repositories().await?.len() as u64;

        let (sql, values) = Query::select()
            .from(Manifests::Table)
            .expr_as(Expr::col(Manifests::Id).count(), Alias::new("count"))
            .build_sqlx(SqliteQueryBuilder);
        let row = sqlx::query_with(&sql, values).fetch_one(&self.pool).await?;
        let manifests = row.try_get::<i64, _>("count")? as u64;

        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .expr_as(Expr::col(Blobs::Id).count(), Alias::new("count"))
            .expr_as(Expr::col(Blobs::Size).sum(), Alias::new("total"))
            .and_where(Expr::col(Blobs::Digest).is_not_null())
            .build_sqlx(SqliteQueryBuilder);
        let row = sqlx::query_with(&sql, values).fetch_one(&self.pool).await?;
        let blobs = row.try_get::<i64, _>("count")? as u64;
        let blob_bytes = row.try_get::<Option<i64>, _>("total")?.unwrap_or(0) as u64;

        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .expr_as(Expr::col(Blobs::Id).count(), Alias::new("count"))
            .expr_as(Expr::col(Blobs::Size).sum(), Alias::new("total"))
            .and_where(Expr::col(Blobs::Digest).is_null())
            .build_sqlx(SqliteQueryBuilder);
        let row = sqlx::query_with(&sql, values).fetch_one(&self.pool).await?;
        let chunks = row.try_get::<i64, _>("count")? as u64;
        let chunk_bytes = row.try_get::<Option<i64>, _>("total")?.unwrap_or(0) as u64;

        Ok(StoreStats {
            repositories,
            manifests,
            blobs,
            chunks,
            total_bytes: blob_bytes + chunk_bytes,
        })
    }

    async fn collect_garbage(&self, expired_sessions: &[Uuid]) -> Result<GcReport> {
        let mut tx = self.pool.begin().await?;
        let mut report = GcReport::default();

        // phase 1: sweep chunk rows owned by expired sessions
        if !expired_sessions.is_empty() {
            let ids: Vec<String> = expired_sessions.iter().map(ToString::to_string).collect();

            let (sql, values) = Query::select()
                .from(Blobs::Table)
                .expr_as(Expr::col(Blobs::Id).count(), Alias::new("count"))
                .expr_as(Expr::col(Blobs::Size).sum(), Alias::new("total"))
                .and_where(Expr::col(Blobs::Digest).is_null())
                .and_where(Expr::col(Blobs::SessionId).is_in(ids.clone()))
                .build_sqlx(SqliteQueryBuilder);
            let row = sqlx::query_with(&sql, values).fetch_one(&mut *tx).await?;
            report.blobs_removed += row.try_get::<i64, _>("count")? as u64;
            report.bytes_freed += row.try_get::<Option<i64>, _>("total")?.unwrap_or(0) as u64;

            let (sql, values) = Query::delete()
                .from_table(Blobs::Table)
                .and_where(Expr::col(Blobs::Digest).is_null())
                .and_where(Expr::col(Blobs::SessionId).is_in(ids))
                .build_sqlx(SqliteQueryBuilder);
            sqlx::query_with(&sql, values).execute(&mut *tx).await?;
        }

        // phase 2: reference set from every manifest's bytes
        let manifest_refs = Self::manifest_references(&mut tx).await?;
        let referenced: HashSet<String> = manifest_refs
            .iter()
            .flat_map(|(_, refs)| refs.iter().cloned())
            .collect();
        let referenced_list: Vec<String> = referenced.iter().cloned().collect();

        // phase 3: set-difference delete of unreferenced finalized blobs,
        // evaluated entirely within this transaction
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([Blobs::Digest, Blobs::Size])
            .and_where(Expr::col(Blobs::Digest).is_not_null())
            .and_where(Expr::col(Blobs::Digest).is_not_in(referenced_list.clone()))
            .build_sqlx(SqliteQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(&mut *tx).await?;
        let mut removed: HashSet<String> = HashSet::with_capacity(rows.len());
        for row in rows {
            let digest: String = row.try_get("digest")?;
            removed.insert(digest);
            report.blobs_removed += 1;
            report.bytes_freed += row.try_get::<i64, _>("size")? as u64;
        }

        let (sql, values) = Query::delete()
            .from_table(Blobs::Table)
            .and_where(Expr::col(Blobs::Digest).is_not_null())
            .and_where(Expr::col(Blobs::Digest).is_not_in(referenced_list))
            .build_sqlx(SqliteQueryBuilder);
        sqlx::query_with(&sql, values).execute(&mut *tx).await?;

        // phase 4: manifests referencing digests that are neither present
        // now nor removed by phase 3 were never stored; drop them
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .column(Blobs::Digest)
            .and_where(Expr::col(Blobs::Digest).is_not_null())
            .build_sqlx(SqliteQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(&mut *tx).await?;
        let mut present: HashSet<String> = HashSet::with_capacity(rows.len());
        for row in rows {
            present.insert(row.try_get("digest")?);
        }

        let orphans: Vec<i64> = manifest_refs
            .iter()
            .filter(|(_, refs)| {
                refs.iter()
                    .any(|d| !present.contains(d) && !removed.contains(d))
            })
            .map(|(id, _)| *id)
            .collect();
        if !orphans.is_empty() {
            report.manifests_removed = orphans.len() as u64;
            let (sql, values) = Query::delete()
                .from_table(Manifests::Table)
                .and_where(Expr::col(Manifests::Id).is_in(orphans))
                .build_sqlx(SqliteQueryBuilder);
            sqlx::query_with(&sql, values).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn gc_stats(&self) -> Result<GcStats> {
        let mut tx = self.pool.begin().await?;

        let manifest_refs = Self::manifest_references(&mut tx).await?;
        let referenced: HashSet<String> = manifest_refs
            .iter()
            .flat_map(|(_, refs)| refs.iter().cloned())
            .collect();

        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([Blobs::Digest, Blobs::Size])
            .build_sqlx(SqliteQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let mut stats = GcStats {
            manifests: manifest_refs.len() as u64,
            ..GcStats::default()
        };
        for row in rows {
            let digest: Option<String> = row.try_get("digest")?;
            let size = row.try_get::<i64, _>("size")? as u64;
            stats.total_bytes += size;
            match digest {
                Some(d) => {
                    stats.blobs += 1;
                    if !referenced.contains(&d) {
                        stats.unreferenced_blobs += 1;
                        stats.unreferenced_bytes += size;
                    }
                }
                None => stats.chunks += 1,
            }
        }
        Ok(stats)
    }

    async fn attempt_recovery(&self) -> Result<bool> {
        let row = sqlx::query("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await?;
        let status: String = row.try_get(0)?;
        if status == "ok" {
            tracing::info!("storage integrity check passed");
            Ok(true)
        } else {
            tracing::error!("storage integrity check failed: {status}");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_config() -> SqliteConfig {
        let dir = std::env::temp_dir();
        SqliteConfig {
            path: dir.join(format!("stevedore-test-{}.db", Uuid::new_v4())),
            spool_dir: Some(dir),
            max_connections: Some(2),
        }
    }

    #[tokio::test]
    async fn chunked_upload_round_trips() {
        let store = temp_config().new_store().await.unwrap();
        let session = Uuid::new_v4();

        store
            .put_chunk(&session, 0, Body::from("hel"))
            .await
            .unwrap();
        store
            .put_chunk(&session, 1, Body::from("lo"))
            .await
            .unwrap();
        assert_eq!(store.chunk_count(&session).await.unwrap(), 2);

        let digest = OciDigest::from_content(b"hello");
        let outcome = store.finalize_upload(&session, &digest).await.unwrap();
        assert_eq!(outcome, FinalizeOutcome::Created { size: 5 });

        assert!(store.blob_exists(&digest).await.unwrap());
        assert_eq!(store.chunk_count(&session).await.unwrap(), 0);

        let (record, body) = store.get_blob(&digest).await.unwrap().unwrap();
        assert_eq!(record.size, 5);
        let frames: Vec<_> = body.collect().await;
        let contents: Vec<u8> = frames
            .into_iter()
            .flat_map(|f| f.unwrap().to_vec())
            .collect();
        assert_eq!(contents, b"hello");
    }

    #[tokio::test]
    async fn digest_mismatch_preserves_chunks() {
        let store = temp_config().new_store().await.unwrap();
        let session = Uuid::new_v4();

        store
            .put_chunk(&session, 0, Body::from("hello"))
            .await
            .unwrap();

        let wrong = OciDigest::from_content(b"goodbye");
        match store.finalize_upload(&session, &wrong).await {
            Err(Error::DigestMismatch { .. }) => (),
            other => panic!("expected digest mismatch, got {other:?}"),
        }
        assert_eq!(store.chunk_count(&session).await.unwrap(), 1);
        assert!(!store.blob_exists(&wrong).await.unwrap());
    }

    #[tokio::test]
    async fn chunk_gap_fails_finalize() {
        let store = temp_config().new_store().await.unwrap();
        let session = Uuid::new_v4();

        store
            .put_chunk(&session, 0, Body::from("a"))
            .await
            .unwrap();
        store
            .put_chunk(&session, 2, Body::from("c"))
            .await
            .unwrap();

        let digest = OciDigest::from_content(b"ac");
        match store.finalize_upload(&session, &digest).await {
            Err(Error::ChunkGap(s)) => assert_eq!(s, session),
            other => panic!("expected chunk gap, got {other:?}"),
        }
        assert_eq!(store.chunk_count(&session).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn manifest_upsert_and_gc() {
        let store = temp_config().new_store().await.unwrap();

        let session = Uuid::new_v4();
        store
            .put_chunk(&session, 0, Body::from("layer"))
            .await
            .unwrap();
        let layer = OciDigest::from_content(b"layer");
        store.finalize_upload(&session, &layer).await.unwrap();

        let session = Uuid::new_v4();
        store
            .put_chunk(&session, 0, Body::from("orphan"))
            .await
            .unwrap();
        let orphan = OciDigest::from_content(b"orphan");
        store.finalize_upload(&session, &orphan).await.unwrap();

        let manifest = format!(r#"{{"layers":[{{"digest":"{layer}"}}]}}"#);
        let digest = OciDigest::from_content(manifest.as_bytes());
        store
            .put_manifest("test/repo", "latest", &digest, manifest.as_bytes())
            .await
            .unwrap();

        assert!(store.manifest_exists("test/repo", "latest").await.unwrap());
        assert_eq!(
            store.digest_for("test/repo", "latest").await.unwrap(),
            Some(digest.clone())
        );
        assert_eq!(
            store
                .digest_for("test/repo", &String::from(&digest))
                .await
                .unwrap(),
            Some(digest.clone())
        );
        assert_eq!(store.digest_for("test/repo", "missing").await.unwrap(), None);

        let report = store.collect_garbage(&[]).await.unwrap();
        assert_eq!(report.blobs_removed, 1);
        assert_eq!(report.bytes_freed, 6);
        assert_eq!(report.manifests_removed, 0);
        assert!(store.blob_exists(&layer).await.unwrap());
        assert!(!store.blob_exists(&orphan).await.unwrap());
    }
}
