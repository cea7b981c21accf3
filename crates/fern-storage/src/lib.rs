//! Storage core (spec §4.A): one embedded SQLite database backing every
//! other component. `Store` owns the connection and is cheap to clone
//! (`Arc` inside) so every crate that needs persistence takes a `Store`
//! handle rather than reopening the database.

mod error;
mod migrate_legacy;
mod rows;
mod schema;
pub mod vector;

pub use error::StorageError;
pub use migrate_legacy::{migrate_legacy_jsonl, LegacyMigrationReport};
pub use rows::{JobRow, MemoryRow, SummaryRow, TaskRow, ThreadSessionRow};
pub use vector::{blob_to_vector, cosine_similarity, vector_to_blob};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    vector_ready: bool,
    root: PathBuf,
}

impl Store {
    /// Opens (creating if absent) the database at `root/fern.db`,
    /// applies the schema, and attempts to load a vector search extension.
    /// Failure to load the extension is not fatal: the store falls back to
    /// FTS-only mode and `is_vector_ready` reports that.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let db_path = root.join("fern.db");

        let (conn, vector_ready) = tokio::task::spawn_blocking(move || -> Result<(Connection, bool), StorageError> {
            let conn = Connection::open(&db_path)?;
            schema::apply(&conn)?;
            let vector_ready = try_load_vector_extension(&conn);
            Ok((conn, vector_ready))
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            vector_ready,
            root,
        })
    }

    pub fn is_vector_ready(&self) -> bool {
        self.vector_ready
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs a blocking closure against the connection on a dedicated
    /// thread, matching the async wrapper pattern every `rusqlite`-backed
    /// store in this codebase uses to avoid stalling the runtime.
    pub async fn run_blocking<F, R>(&self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            f(&mut conn)
        })
        .await?
        .map_err(StorageError::from)
    }

    // ---- thread_sessions ----------------------------------------------

    pub async fn upsert_thread_session(&self, row: ThreadSessionRow) -> Result<(), StorageError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO thread_sessions (thread_id, session_id, share_url, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(thread_id) DO UPDATE SET
                    session_id = excluded.session_id,
                    share_url = excluded.share_url,
                    updated_at = excluded.updated_at",
                params![row.thread_id, row.session_id, row.share_url, row.created_at, row.updated_at],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_thread_session(&self, thread_id: &str) -> Result<Option<ThreadSessionRow>, StorageError> {
        let thread_id = thread_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT thread_id, session_id, share_url, created_at, updated_at
                 FROM thread_sessions WHERE thread_id = ?1",
                params![thread_id],
                |r| {
                    Ok(ThreadSessionRow {
                        thread_id: r.get(0)?,
                        session_id: r.get(1)?,
                        share_url: r.get(2)?,
                        created_at: r.get(3)?,
                        updated_at: r.get(4)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    pub async fn delete_thread_session(&self, thread_id: &str) -> Result<(), StorageError> {
        let thread_id = thread_id.to_string();
        self.run_blocking(move |conn| {
            conn.execute("DELETE FROM thread_sessions WHERE thread_id = ?1", params![thread_id])?;
            Ok(())
        })
        .await
    }

    pub async fn list_thread_sessions(&self) -> Result<Vec<ThreadSessionRow>, StorageError> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT thread_id, session_id, share_url, created_at, updated_at
                 FROM thread_sessions ORDER BY updated_at DESC",
            )?;
            let rows = stmt
                .query_map([], |r| {
                    Ok(ThreadSessionRow {
                        thread_id: r.get(0)?,
                        session_id: r.get(1)?,
                        share_url: r.get(2)?,
                        created_at: r.get(3)?,
                        updated_at: r.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn list_stale_thread_sessions(&self, older_than_iso: &str) -> Result<Vec<ThreadSessionRow>, StorageError> {
        let cutoff = older_than_iso.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT thread_id, session_id, share_url, created_at, updated_at
                 FROM thread_sessions WHERE updated_at < ?1",
            )?;
            let rows = stmt
                .query_map(params![cutoff], |r| {
                    Ok(ThreadSessionRow {
                        thread_id: r.get(0)?,
                        session_id: r.get(1)?,
                        share_url: r.get(2)?,
                        created_at: r.get(3)?,
                        updated_at: r.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    // ---- summaries ------------------------------------------------------

    pub async fn insert_summary(&self, row: SummaryRow, embedding: Option<Vec<f32>>) -> Result<(), StorageError> {
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO summaries
                    (chunk_id, thread_id, session_id, summary, token_count, message_count,
                     first_message_id, last_message_id, first_ts, last_ts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    row.chunk_id, row.thread_id, row.session_id, row.summary,
                    row.token_count, row.message_count, row.first_message_id,
                    row.last_message_id, row.first_ts, row.last_ts, row.created_at,
                ],
            )?;
            if let Some(vec) = embedding {
                tx.execute(
                    "INSERT INTO summary_vectors (chunk_id, embedding) VALUES (?1, ?2)",
                    params![row.chunk_id, vector_to_blob(&vec)],
                )?;
            }
            tx.commit()
        })
        .await
    }

    pub async fn list_summaries_for_thread(&self, thread_id: &str) -> Result<Vec<SummaryRow>, StorageError> {
        let thread_id = thread_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT chunk_id, thread_id, session_id, summary, token_count, message_count,
                        first_message_id, last_message_id, first_ts, last_ts, created_at
                 FROM summaries WHERE thread_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![thread_id], summary_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Full-text search over summaries, ranked by FTS5's BM25. Returns
    /// `(row, bm25_rank)` where a more negative rank is a better match
    /// (SQLite FTS5 convention).
    pub async fn search_summaries_fts(&self, query: &str, limit: usize) -> Result<Vec<(SummaryRow, f64)>, StorageError> {
        let query = query.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT s.chunk_id, s.thread_id, s.session_id, s.summary, s.token_count, s.message_count,
                        s.first_message_id, s.last_message_id, s.first_ts, s.last_ts, s.created_at,
                        bm25(summaries_fts) AS rank
                 FROM summaries_fts
                 JOIN summaries s ON s.rowid = summaries_fts.rowid
                 WHERE summaries_fts MATCH ?1
                 ORDER BY rank LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![query, limit as i64], |r| {
                    Ok((summary_from_row(r)?, r.get::<_, f64>(11)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn all_summary_vectors(&self, thread_id: &str) -> Result<Vec<(SummaryRow, Vec<f32>)>, StorageError> {
        let thread_id = thread_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT s.chunk_id, s.thread_id, s.session_id, s.summary, s.token_count, s.message_count,
                        s.first_message_id, s.last_message_id, s.first_ts, s.last_ts, s.created_at,
                        v.embedding
                 FROM summaries s
                 JOIN summary_vectors v ON v.chunk_id = s.chunk_id
                 WHERE s.thread_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![thread_id], |r| {
                    let blob: Vec<u8> = r.get(11)?;
                    Ok((summary_from_row(r)?, blob_to_vector(&blob)))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Like `all_summary_vectors` but optionally unscoped, for search over
    /// the whole corpus rather than a single thread.
    pub async fn all_summary_vectors_filtered(&self, thread_id: Option<String>) -> Result<Vec<(SummaryRow, Vec<f32>)>, StorageError> {
        self.run_blocking(move |conn| {
            let base = "SELECT s.chunk_id, s.thread_id, s.session_id, s.summary, s.token_count, s.message_count,
                        s.first_message_id, s.last_message_id, s.first_ts, s.last_ts, s.created_at,
                        v.embedding
                 FROM summaries s
                 JOIN summary_vectors v ON v.chunk_id = s.chunk_id";
            let rows = match &thread_id {
                Some(tid) => {
                    let mut stmt = conn.prepare(&format!("{base} WHERE s.thread_id = ?1"))?;
                    stmt.query_map(params![tid], |r| {
                        let blob: Vec<u8> = r.get(11)?;
                        Ok((summary_from_row(r)?, blob_to_vector(&blob)))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare(base)?;
                    stmt.query_map([], |r| {
                        let blob: Vec<u8> = r.get(11)?;
                        Ok((summary_from_row(r)?, blob_to_vector(&blob)))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(rows)
        })
        .await
    }

    // ---- memories -------------------------------------------------------

    pub async fn all_memory_vectors(&self) -> Result<Vec<(MemoryRow, Vec<f32>)>, StorageError> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.type, m.content, m.tags, m.created_at, m.updated_at, v.embedding
                 FROM memories m
                 JOIN memory_vectors v ON v.memory_id = m.id",
            )?;
            let rows = stmt
                .query_map([], |r| {
                    let blob: Vec<u8> = r.get(6)?;
                    Ok((memory_from_row(r)?, blob_to_vector(&blob)))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn insert_memory(&self, row: MemoryRow, embedding: Option<Vec<f32>>) -> Result<(), StorageError> {
        self.run_blocking(move |conn| {
            let tags = serde_json::to_string(&row.tags).unwrap_or_else(|_| "[]".to_string());
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO memories (id, type, content, tags, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![row.id, row.memory_type, row.content, tags, row.created_at, row.updated_at],
            )?;
            if let Some(vec) = embedding {
                tx.execute(
                    "INSERT INTO memory_vectors (memory_id, embedding) VALUES (?1, ?2)",
                    params![row.id, vector_to_blob(&vec)],
                )?;
            }
            tx.commit()
        })
        .await
    }

    /// Removes a memory and its vector row in one transaction (spec §4.G).
    /// `memories_fts` is kept in sync by the `memories_after_delete` trigger.
    pub async fn delete_memory(&self, id: &str) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM memory_vectors WHERE memory_id = ?1", params![id])?;
            let deleted = tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(deleted > 0)
        })
        .await
    }

    pub async fn list_memories(&self, memory_type: Option<String>, limit: usize) -> Result<Vec<MemoryRow>, StorageError> {
        self.run_blocking(move |conn| {
            let rows = match &memory_type {
                Some(t) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, type, content, tags, created_at, updated_at FROM memories
                         WHERE type = ?1 ORDER BY created_at DESC LIMIT ?2",
                    )?;
                    stmt.query_map(params![t, limit as i64], memory_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, type, content, tags, created_at, updated_at FROM memories
                         ORDER BY created_at DESC LIMIT ?1",
                    )?;
                    stmt.query_map(params![limit as i64], memory_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(rows)
        })
        .await
    }

    pub async fn search_memories_fts(&self, query: &str, limit: usize) -> Result<Vec<(MemoryRow, f64)>, StorageError> {
        let query = query.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.type, m.content, m.tags, m.created_at, m.updated_at, bm25(memories_fts) AS rank
                 FROM memories_fts
                 JOIN memories m ON m.rowid = memories_fts.rowid
                 WHERE memories_fts MATCH ?1
                 ORDER BY rank LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![query, limit as i64], |r| {
                    Ok((memory_from_row(r)?, r.get::<_, f64>(6)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    // ---- scheduled_jobs ---------------------------------------------------

    pub async fn insert_job(&self, row: JobRow) -> Result<(), StorageError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO scheduled_jobs
                    (id, job_type, status, prompt, scheduled_at, cron_expr, created_at,
                     updated_at, completed_at, last_run_response, last_error, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    row.id, row.job_type, row.status, row.prompt, row.scheduled_at, row.cron_expr,
                    row.created_at, row.updated_at, row.completed_at, row.last_run_response,
                    row.last_error, row.metadata,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Atomically claims one due, pending job for execution. The
    /// conditional `UPDATE ... WHERE status = 'pending'` plus affected-row
    /// check is what makes concurrent pollers safe without a lock table.
    pub async fn claim_due_job(&self, now_iso: &str) -> Result<Option<JobRow>, StorageError> {
        let now_iso = now_iso.to_string();
        self.run_blocking(move |conn| {
            let candidate: Option<String> = conn
                .query_row(
                    "SELECT id FROM scheduled_jobs
                     WHERE status = 'pending' AND scheduled_at <= ?1
                     ORDER BY scheduled_at ASC LIMIT 1",
                    params![now_iso],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(id) = candidate else { return Ok(None) };

            let updated = conn.execute(
                "UPDATE scheduled_jobs SET status = 'running', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now_iso],
            )?;
            if updated == 0 {
                // Another poller won the race.
                return Ok(None);
            }
            job_from_row(&conn.query_row(
                "SELECT id, job_type, status, prompt, scheduled_at, cron_expr, created_at,
                        updated_at, completed_at, last_run_response, last_error, metadata
                 FROM scheduled_jobs WHERE id = ?1",
                params![id],
                |r| row_values(r),
            )?)
            .map(Some)
        })
        .await
    }

    pub async fn update_job(&self, row: JobRow) -> Result<(), StorageError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE scheduled_jobs SET status = ?2, scheduled_at = ?3, updated_at = ?4,
                    completed_at = ?5, last_run_response = ?6, last_error = ?7, metadata = ?8
                 WHERE id = ?1",
                params![
                    row.id, row.status, row.scheduled_at, row.updated_at, row.completed_at,
                    row.last_run_response, row.last_error, row.metadata,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_jobs(&self, status: Option<String>) -> Result<Vec<JobRow>, StorageError> {
        self.run_blocking(move |conn| {
            let rows = match &status {
                Some(s) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, job_type, status, prompt, scheduled_at, cron_expr, created_at,
                                updated_at, completed_at, last_run_response, last_error, metadata
                         FROM scheduled_jobs WHERE status = ?1 ORDER BY scheduled_at ASC",
                    )?;
                    stmt.query_map(params![s], |r| row_values(r))?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, job_type, status, prompt, scheduled_at, cron_expr, created_at,
                                updated_at, completed_at, last_run_response, last_error, metadata
                         FROM scheduled_jobs ORDER BY scheduled_at ASC",
                    )?;
                    stmt.query_map([], |r| row_values(r))?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    /// Jobs left `running` past a staleness cutoff: the poller that claimed
    /// them died before marking them terminal. Used by the scheduler's
    /// recovery sweep on startup.
    pub async fn list_stale_running_jobs(&self, older_than_iso: &str) -> Result<Vec<JobRow>, StorageError> {
        let cutoff = older_than_iso.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_type, status, prompt, scheduled_at, cron_expr, created_at,
                        updated_at, completed_at, last_run_response, last_error, metadata
                 FROM scheduled_jobs WHERE status = 'running' AND updated_at < ?1",
            )?;
            let rows = stmt
                .query_map(params![cutoff], |r| row_values(r))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    // ---- subagent_tasks ---------------------------------------------------

    pub async fn insert_task(&self, row: TaskRow) -> Result<(), StorageError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO subagent_tasks
                    (id, agent_type, status, prompt, parent_session_id, created_at, updated_at,
                     completed_at, result, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    row.id, row.agent_type, row.status, row.prompt, row.parent_session_id,
                    row.created_at, row.updated_at, row.completed_at, row.result, row.error,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn claim_pending_task(&self, now_iso: &str) -> Result<Option<TaskRow>, StorageError> {
        let now_iso = now_iso.to_string();
        self.run_blocking(move |conn| {
            let candidate: Option<String> = conn
                .query_row(
                    "SELECT id FROM subagent_tasks WHERE status = 'pending'
                     ORDER BY created_at ASC LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(id) = candidate else { return Ok(None) };

            let updated = conn.execute(
                "UPDATE subagent_tasks SET status = 'running', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now_iso],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            task_from_row(&conn.query_row(
                "SELECT id, agent_type, status, prompt, parent_session_id, created_at, updated_at,
                        completed_at, result, error
                 FROM subagent_tasks WHERE id = ?1",
                params![id],
                task_row_values,
            )?)
            .map(Some)
        })
        .await
    }

    pub async fn update_task(&self, row: TaskRow) -> Result<(), StorageError> {
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE subagent_tasks SET status = ?2, updated_at = ?3, completed_at = ?4,
                    result = ?5, error = ?6
                 WHERE id = ?1",
                params![row.id, row.status, row.updated_at, row.completed_at, row.result, row.error],
            )?;
            Ok(())
        })
        .await
    }

    /// Claims a specific task by id rather than picking the oldest pending
    /// row; this is what `spawnTask(id)` drives since the caller already
    /// knows which row it wants to run.
    pub async fn claim_task_by_id(&self, id: &str, now_iso: &str) -> Result<Option<TaskRow>, StorageError> {
        let id = id.to_string();
        let now_iso = now_iso.to_string();
        self.run_blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE subagent_tasks SET status = 'running', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now_iso],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            task_from_row(&conn.query_row(
                "SELECT id, agent_type, status, prompt, parent_session_id, created_at, updated_at,
                        completed_at, result, error
                 FROM subagent_tasks WHERE id = ?1",
                params![id],
                task_row_values,
            )?)
            .map(Some)
        })
        .await
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRow>, StorageError> {
        let id = id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, agent_type, status, prompt, parent_session_id, created_at, updated_at,
                        completed_at, result, error
                 FROM subagent_tasks WHERE id = ?1",
                params![id],
                task_row_values,
            )
            .optional()?
            .map(|v| task_from_row(&v))
            .transpose()
        })
        .await
    }

    /// Terminal write guarded by re-reading current status first, so a task
    /// cancelled concurrently with completion does not get silently
    /// clobbered back to `completed`.
    pub async fn finish_task_if_running(&self, id: &str, status: &str, result: Option<String>, error: Option<String>, now_iso: &str) -> Result<bool, StorageError> {
        let id = id.to_string();
        let status = status.to_string();
        let now_iso = now_iso.to_string();
        self.run_blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE subagent_tasks SET status = ?2, completed_at = ?3, result = ?4,
                    error = ?5, updated_at = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id, status, now_iso, result, error],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    /// Cancels a task that has not started running yet. A `pending` task
    /// never reaches `finish_task_if_running`'s `status = 'running'` guard,
    /// so cancellation needs its own claim against the queued state.
    pub async fn cancel_pending_task(&self, id: &str, now_iso: &str) -> Result<bool, StorageError> {
        let id = id.to_string();
        let now_iso = now_iso.to_string();
        self.run_blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE subagent_tasks SET status = 'cancelled', completed_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now_iso],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    pub async fn list_stale_running_tasks(&self, older_than_iso: &str) -> Result<Vec<TaskRow>, StorageError> {
        let cutoff = older_than_iso.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, agent_type, status, prompt, parent_session_id, created_at, updated_at,
                        completed_at, result, error
                 FROM subagent_tasks WHERE status = 'running' AND updated_at < ?1",
            )?;
            let rows = stmt
                .query_map(params![cutoff], task_row_values)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.iter().map(task_from_row).collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    pub async fn delete_tasks_completed_before(&self, cutoff_iso: &str) -> Result<usize, StorageError> {
        let cutoff = cutoff_iso.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "DELETE FROM subagent_tasks WHERE completed_at IS NOT NULL AND completed_at < ?1",
                params![cutoff],
            )
        })
        .await
    }

    pub async fn list_tasks(&self, status: Option<String>) -> Result<Vec<TaskRow>, StorageError> {
        self.run_blocking(move |conn| {
            let rows = match &status {
                Some(s) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, agent_type, status, prompt, parent_session_id, created_at, updated_at,
                                completed_at, result, error
                         FROM subagent_tasks WHERE status = ?1 ORDER BY created_at DESC",
                    )?;
                    stmt.query_map(params![s], task_row_values)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, agent_type, status, prompt, parent_session_id, created_at, updated_at,
                                completed_at, result, error
                         FROM subagent_tasks ORDER BY created_at DESC",
                    )?;
                    stmt.query_map([], task_row_values)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            rows.iter().map(task_from_row).collect::<Result<Vec<_>, _>>()
        })
        .await
    }
}

type SummaryValues = (String, String, String, String, i64, i64, String, String, String, String, String);

fn summary_from_row(r: &rusqlite::Row) -> rusqlite::Result<SummaryRow> {
    Ok(SummaryRow {
        chunk_id: r.get(0)?,
        thread_id: r.get(1)?,
        session_id: r.get(2)?,
        summary: r.get(3)?,
        token_count: r.get(4)?,
        message_count: r.get(5)?,
        first_message_id: r.get(6)?,
        last_message_id: r.get(7)?,
        first_ts: r.get(8)?,
        last_ts: r.get(9)?,
        created_at: r.get(10)?,
    })
}

fn memory_from_row(r: &rusqlite::Row) -> rusqlite::Result<MemoryRow> {
    let tags_json: String = r.get(3)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    Ok(MemoryRow {
        id: r.get(0)?,
        memory_type: r.get(1)?,
        content: r.get(2)?,
        tags,
        created_at: r.get(4)?,
        updated_at: r.get(5)?,
    })
}

type JobValues = (
    String, String, String, String, String, Option<String>, String, String,
    Option<String>, Option<String>, Option<String>, String,
);

fn row_values(r: &rusqlite::Row) -> rusqlite::Result<JobValues> {
    Ok((
        r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?,
        r.get(6)?, r.get(7)?, r.get(8)?, r.get(9)?, r.get(10)?, r.get(11)?,
    ))
}

fn job_from_row(v: &JobValues) -> Result<JobRow, rusqlite::Error> {
    Ok(JobRow {
        id: v.0.clone(),
        job_type: v.1.clone(),
        status: v.2.clone(),
        prompt: v.3.clone(),
        scheduled_at: v.4.clone(),
        cron_expr: v.5.clone(),
        created_at: v.6.clone(),
        updated_at: v.7.clone(),
        completed_at: v.8.clone(),
        last_run_response: v.9.clone(),
        last_error: v.10.clone(),
        metadata: v.11.clone(),
    })
}

type TaskValues = (
    String, String, String, String, String, String, String,
    Option<String>, Option<String>, Option<String>,
);

fn task_row_values(r: &rusqlite::Row) -> rusqlite::Result<TaskValues> {
    Ok((
        r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?,
        r.get(6)?, r.get(7)?, r.get(8)?, r.get(9)?,
    ))
}

fn task_from_row(v: &TaskValues) -> Result<TaskRow, rusqlite::Error> {
    Ok(TaskRow {
        id: v.0.clone(),
        agent_type: v.1.clone(),
        status: v.2.clone(),
        prompt: v.3.clone(),
        parent_session_id: v.4.clone(),
        created_at: v.5.clone(),
        updated_at: v.6.clone(),
        completed_at: v.7.clone(),
        result: v.8.clone(),
        error: v.9.clone(),
    })
}

/// Attempts to load a `vec0`-style extension named by
/// `FERN_VECTOR_EXTENSION_PATH`. Loading extensions is `unsafe` because the
/// library runs arbitrary native code; we re-disable loading immediately
/// afterwards regardless of outcome.
fn try_load_vector_extension(conn: &Connection) -> bool {
    let Ok(path) = std::env::var("FERN_VECTOR_EXTENSION_PATH") else {
        tracing::info!("FERN_VECTOR_EXTENSION_PATH not set, running in FTS-only mode");
        return false;
    };

    let outcome = unsafe {
        conn.load_extension_enable()
            .and_then(|_| conn.load_extension(&path, None))
    };
    let _ = conn.load_extension_disable();

    match outcome {
        Ok(()) => {
            tracing::info!(path = %path, "vector extension loaded");
            true
        }
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "failed to load vector extension, falling back to FTS-only mode");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_tmp() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn opens_and_creates_schema_idempotently() {
        let (store, dir) = open_tmp().await;
        assert!(!store.is_vector_ready());
        // Re-opening the same path must not fail.
        let _store2 = Store::open(dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn thread_session_upsert_then_fetch() {
        let (store, _dir) = open_tmp().await;
        let row = ThreadSessionRow {
            thread_id: "t1".into(),
            session_id: "s1".into(),
            share_url: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
        };
        store.upsert_thread_session(row.clone()).await.unwrap();
        let fetched = store.get_thread_session("t1").await.unwrap().unwrap();
        assert_eq!(fetched.session_id, "s1");

        let mut updated = row;
        updated.session_id = "s2".into();
        store.upsert_thread_session(updated).await.unwrap();
        let fetched = store.get_thread_session("t1").await.unwrap().unwrap();
        assert_eq!(fetched.session_id, "s2");
    }

    #[tokio::test]
    async fn summary_fts_search_finds_inserted_row() {
        let (store, _dir) = open_tmp().await;
        store
            .insert_summary(
                SummaryRow {
                    chunk_id: "c1".into(),
                    thread_id: "t1".into(),
                    session_id: "s1".into(),
                    summary: "the quick brown fox jumps".into(),
                    token_count: 10,
                    message_count: 4,
                    first_message_id: "m1".into(),
                    last_message_id: "m4".into(),
                    first_ts: "2026-01-01T00:00:00Z".into(),
                    last_ts: "2026-01-01T00:05:00Z".into(),
                    created_at: "2026-01-01T00:05:00Z".into(),
                },
                Some(vec![1.0, 0.0, 0.0]),
            )
            .await
            .unwrap();

        let hits = store.search_summaries_fts("fox", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.chunk_id, "c1");

        let vectors = store.all_summary_vectors("t1").await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].1, vec![1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn job_claim_is_race_safe_and_idempotent() {
        let (store, _dir) = open_tmp().await;
        store
            .insert_job(JobRow {
                id: "j1".into(),
                job_type: "one_shot".into(),
                status: "pending".into(),
                prompt: "do thing".into(),
                scheduled_at: "2020-01-01T00:00:00Z".into(),
                cron_expr: None,
                created_at: "2020-01-01T00:00:00Z".into(),
                updated_at: "2020-01-01T00:00:00Z".into(),
                completed_at: None,
                last_run_response: None,
                last_error: None,
                metadata: "{}".into(),
            })
            .await
            .unwrap();

        let claimed = store.claim_due_job("2026-01-01T00:00:00Z").await.unwrap().unwrap();
        assert_eq!(claimed.status, "running");

        // A second claim attempt should find nothing pending.
        let second = store.claim_due_job("2026-01-01T00:00:00Z").await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn task_finish_only_applies_while_running() {
        let (store, _dir) = open_tmp().await;
        store
            .insert_task(TaskRow {
                id: "tk1".into(),
                agent_type: "research".into(),
                status: "pending".into(),
                prompt: "look into it".into(),
                parent_session_id: "sess1".into(),
                created_at: "2026-01-01T00:00:00Z".into(),
                updated_at: "2026-01-01T00:00:00Z".into(),
                completed_at: None,
                result: None,
                error: None,
            })
            .await
            .unwrap();

        let claimed = store.claim_pending_task("2026-01-01T00:00:01Z").await.unwrap().unwrap();
        assert_eq!(claimed.status, "running");

        let first_finish = store
            .finish_task_if_running("tk1", "completed", Some("done".into()), None, "2026-01-01T00:00:02Z")
            .await
            .unwrap();
        assert!(first_finish);

        // Task is now terminal; a second finish attempt (e.g. a racing
        // cancellation) must be a no-op rather than clobbering the result.
        let second_finish = store
            .finish_task_if_running("tk1", "failed", None, Some("cancelled".into()), "2026-01-01T00:00:03Z")
            .await
            .unwrap();
        assert!(!second_finish);

        let task = store.get_task("tk1").await.unwrap().unwrap();
        assert_eq!(task.status, "completed");
    }
}
