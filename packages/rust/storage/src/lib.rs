//! Storage for StreamDigest: the in-process TTL cache and the libSQL
//! session database.
//!
//! The [`Storage`] struct wraps a libSQL database holding session snapshots,
//! recorded candidate batches and finalized documents, so an interrupted
//! session can be resumed after a restart.
//!
//! **Access rules:**
//! - Pipeline: read-write (sole writer) via [`Storage::open`]
//! - `status` / `list` commands: read-only via [`Storage::open_readonly`]

pub mod cache;
mod migrations;

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database, params};
use streamdigest_shared::{
    ArtifactType, Candidate, DigestError, NewsletterDocument, Result, SessionId, SessionSnapshot,
    Stage,
};

pub use cache::{CacheEntry, CacheStore};

/// File name of the session database inside the data directory.
pub const DB_FILE_NAME: &str = "streamdigest.db";

fn storage_err(e: impl std::fmt::Display) -> DigestError {
    DigestError::Storage(e.to_string())
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("readonly", &self.readonly)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DigestError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        DigestError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DigestError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Session operations
    // -----------------------------------------------------------------------

    /// Insert or replace the snapshot of a session.
    pub async fn save_session(&self, snapshot: &SessionSnapshot) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(snapshot).map_err(storage_err)?;
        self.conn
            .execute(
                "INSERT INTO sessions (id, range_start, range_end, stage, snapshot_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   stage = excluded.stage,
                   snapshot_json = excluded.snapshot_json,
                   updated_at = excluded.updated_at",
                params![
                    snapshot.id.to_string(),
                    snapshot.range.start.to_string(),
                    snapshot.range.end.to_string(),
                    snapshot.stage.as_str(),
                    json,
                    snapshot.created_at.to_rfc3339(),
                    snapshot.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Load a session snapshot by ID.
    pub async fn load_session(&self, id: &SessionId) -> Result<Option<SessionSnapshot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT snapshot_json FROM sessions WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row.get(0).map_err(storage_err)?;
                let snapshot = serde_json::from_str(&json)
                    .map_err(|e| DigestError::Storage(format!("corrupt session {id}: {e}")))?;
                Ok(Some(snapshot))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// List all sessions, most recently updated first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, range_start, range_end, stage, created_at, updated_at
                 FROM sessions ORDER BY updated_at DESC",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_summary(&row)?);
        }
        Ok(results)
    }

    /// Delete a session and everything recorded against it.
    pub async fn delete_session(&self, id: &SessionId) -> Result<()> {
        self.check_writable()?;
        let id = id.to_string();
        for sql in [
            "DELETE FROM batches WHERE session_id = ?1",
            "DELETE FROM documents WHERE session_id = ?1",
            "DELETE FROM sessions WHERE id = ?1",
        ] {
            self.conn
                .execute(sql, params![id.as_str()])
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Batch operations
    // -----------------------------------------------------------------------

    /// Record a complete candidate batch. Re-recording the same key replaces it.
    pub async fn save_batch(
        &self,
        session_id: &SessionId,
        artifact: ArtifactType,
        prompt_version: &str,
        candidates: &[Candidate],
    ) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(candidates).map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO batches (session_id, artifact_type, prompt_version, candidates_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(session_id, artifact_type, prompt_version) DO UPDATE SET
                   candidates_json = excluded.candidates_json,
                   created_at = excluded.created_at",
                params![
                    session_id.to_string(),
                    artifact.as_str(),
                    prompt_version,
                    json,
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Load a recorded batch.
    pub async fn load_batch(
        &self,
        session_id: &SessionId,
        artifact: ArtifactType,
        prompt_version: &str,
    ) -> Result<Option<Vec<Candidate>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT candidates_json FROM batches
                 WHERE session_id = ?1 AND artifact_type = ?2 AND prompt_version = ?3",
                params![session_id.to_string(), artifact.as_str(), prompt_version],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row.get(0).map_err(storage_err)?;
                let candidates = serde_json::from_str(&json).map_err(storage_err)?;
                Ok(Some(candidates))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Document operations
    // -----------------------------------------------------------------------

    /// Store a finalized document. A session keeps its first document.
    pub async fn save_document(&self, document: &NewsletterDocument) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(document).map_err(storage_err)?;
        self.conn
            .execute(
                "INSERT INTO documents (id, session_id, document_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id) DO NOTHING",
                params![
                    document.id.as_str(),
                    document.session_id.to_string(),
                    json,
                    document.created_at.to_rfc3339()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Load the finalized document of a session.
    pub async fn load_document(&self, session_id: &SessionId) -> Result<Option<NewsletterDocument>> {
        let mut rows = self
            .conn
            .query(
                "SELECT document_json FROM documents WHERE session_id = ?1",
                params![session_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row.get(0).map_err(storage_err)?;
                Ok(Some(serde_json::from_str(&json).map_err(storage_err)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }
}

/// One row of the session listing.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Convert a database row to a [`SessionSummary`].
fn row_to_summary(row: &libsql::Row) -> Result<SessionSummary> {
    let text = |idx: i32| -> Result<String> { row.get::<String>(idx).map_err(storage_err) };
    let date = |s: String| {
        NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map_err(|e| DigestError::Storage(format!("invalid date: {e}")))
    };
    let timestamp = |s: String| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| DigestError::Storage(format!("invalid timestamp: {e}")))
    };

    Ok(SessionSummary {
        id: text(0)?
            .parse()
            .map_err(|e| DigestError::Storage(format!("invalid session id: {e}")))?,
        start: date(text(1)?)?,
        end: date(text(2)?)?,
        stage: text(3)?
            .parse()
            .map_err(|e: DigestError| DigestError::Storage(e.to_string()))?,
        created_at: timestamp(text(4)?)?,
        updated_at: timestamp(text(5)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamdigest_shared::{
        BannerArtifact, CandidatePayload, ContentItem, DateRange, Picks,
    };
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("sd_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn snapshot(stage: Stage) -> SessionSnapshot {
        let range = DateRange::parse("2024-01-01", "2024-01-03").unwrap();
        let now = Utc::now();
        SessionSnapshot {
            id: SessionId::new(),
            range,
            stage,
            picks: Picks::default(),
            batches: Vec::new(),
            items: vec![ContentItem {
                title: "The Bear".into(),
                date: range.start,
                platform: "Hulu".into(),
                kind: Some("Season Premiere".into()),
                description: None,
                platform_logo: None,
                image_url: None,
                link: None,
                country: None,
            }],
            skipped: 1,
            included: None,
            document_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn text_candidates(artifact: ArtifactType) -> Vec<Candidate> {
        (0..3)
            .map(|index| Candidate {
                artifact,
                index,
                payload: CandidatePayload::Text {
                    text: format!("candidate {index}"),
                },
                chosen: false,
            })
            .collect()
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("sd_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn session_save_load_and_update() {
        let storage = test_storage().await;
        let mut snap = snapshot(Stage::Scraped);

        storage.save_session(&snap).await.expect("save session");
        let loaded = storage
            .load_session(&snap.id)
            .await
            .expect("load session")
            .expect("session present");
        assert_eq!(loaded, snap);

        snap.stage = Stage::TaglineChosen;
        snap.picks.set(ArtifactType::Tagline, 1);
        storage.save_session(&snap).await.expect("update session");

        let loaded = storage.load_session(&snap.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::TaglineChosen);
        assert_eq!(loaded.picks.tagline, Some(1));

        let sessions = storage.list_sessions().await.expect("list sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].stage, Stage::TaglineChosen);
        assert_eq!(sessions[0].start, snap.range.start);
    }

    #[tokio::test]
    async fn missing_session_is_none() {
        let storage = test_storage().await;
        let found = storage.load_session(&SessionId::new()).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn batch_roundtrip_keyed_by_prompt_version() {
        let storage = test_storage().await;
        let snap = snapshot(Stage::TaglinesGenerated);
        storage.save_session(&snap).await.unwrap();

        let batch = text_candidates(ArtifactType::Tagline);
        storage
            .save_batch(&snap.id, ArtifactType::Tagline, "v1", &batch)
            .await
            .expect("save batch");

        let loaded = storage
            .load_batch(&snap.id, ArtifactType::Tagline, "v1")
            .await
            .expect("load batch");
        assert_eq!(loaded, Some(batch));

        let other_version = storage
            .load_batch(&snap.id, ArtifactType::Tagline, "v2")
            .await
            .unwrap();
        assert!(other_version.is_none());
    }

    #[tokio::test]
    async fn document_is_write_once() {
        let storage = test_storage().await;
        let snap = snapshot(Stage::BannerChosen);
        storage.save_session(&snap).await.unwrap();

        let doc = NewsletterDocument {
            id: "abc".into(),
            session_id: snap.id,
            range: snap.range,
            title: "Streaming Newsletter".into(),
            tagline: "Your week in streaming".into(),
            intro: "Fresh streaming picks".into(),
            banner: BannerArtifact {
                media_type: "image/svg+xml".into(),
                bytes: b"<svg/>".to_vec(),
            },
            sections: Vec::new(),
            missing_platforms: Vec::new(),
            html: "<html></html>".into(),
            created_at: Utc::now(),
        };
        storage.save_document(&doc).await.expect("save document");

        let second = NewsletterDocument {
            id: "def".into(),
            ..doc.clone()
        };
        storage.save_document(&second).await.expect("second save");

        let loaded = storage.load_document(&snap.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, "abc");
    }

    #[tokio::test]
    async fn delete_session_removes_batches() {
        let storage = test_storage().await;
        let snap = snapshot(Stage::TaglinesGenerated);
        storage.save_session(&snap).await.unwrap();
        storage
            .save_batch(&snap.id, ArtifactType::Tagline, "v1", &text_candidates(ArtifactType::Tagline))
            .await
            .unwrap();

        storage.delete_session(&snap.id).await.expect("delete");
        assert!(storage.load_session(&snap.id).await.unwrap().is_none());
        assert!(
            storage
                .load_batch(&snap.id, ArtifactType::Tagline, "v1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("sd_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.save_session(&snapshot(Stage::Scraped)).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.list_sessions().await.unwrap().len(), 1);
        let result = ro.save_session(&snapshot(Stage::Scraped)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
