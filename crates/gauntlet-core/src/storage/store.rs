//! SQLite-backed durable store for the run execution engine.
//!
//! The claim operation is a single conditional UPDATE; it is the only
//! concurrency-safety boundary against duplicate execution. Step results are
//! append-only and never mutated. Rerun accept/reject run inside one
//! transaction so their precondition checks are atomic with the writes.

use crate::model::{
    Batch, BatchStatus, MatchType, ModelCatalogEntry, NewStepResult, RunRequest, RunStatus,
    StepDefinition, StepResult, StepStatus, TestCase,
};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Storage errors. Fatal to the current run; the scheduler keeps polling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: i64 },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Fields for inserting a new step definition.
#[derive(Debug, Clone)]
pub struct NewStepDefinition<'a> {
    pub test_case_id: i64,
    pub step_order: i64,
    pub model: &'a str,
    pub endpoint: Option<&'a str>,
    pub input: Option<&'a str>,
    pub expected_output: Option<&'a str>,
    pub match_type: MatchType,
    pub validation_prompt: Option<&'a str>,
}

/// SQLite-backed store shared across the scheduler and executors.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open a file-backed store.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a store from an existing connection (multi-connection tests).
    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection) -> Result<(), StoreError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        // WAL mode for file-backed DBs (no-op for in-memory)
        let _ = conn.execute("PRAGMA journal_mode = WAL", []);
        conn.execute_batch(super::schema::SCHEMA)?;
        Ok(())
    }

    // ---- seeding (used by external collaborators and tests) ----

    pub fn create_test_case(&self, project_id: &str, name: &str) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO test_cases(project_id, name) VALUES (?1, ?2)",
            params![project_id, name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Soft-delete a test case. Runs still referencing it fail with a
    /// persistence-class error instead of executing.
    pub fn archive_test_case(&self, test_case_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE test_cases SET archived_at = ?1 WHERE id = ?2 AND archived_at IS NULL",
            params![now(), test_case_id],
        )?;
        Ok(())
    }

    pub fn create_batch(&self, project_id: &str, name: Option<&str>) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO batches(project_id, name) VALUES (?1, ?2)",
            params![project_id, name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn add_step(&self, step: &NewStepDefinition<'_>) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO step_definitions(
                 test_case_id, step_order, model, endpoint, input,
                 expected_output, match_type, validation_prompt
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                step.test_case_id,
                step.step_order,
                step.model,
                step.endpoint,
                step.input,
                step.expected_output,
                step.match_type.as_str(),
                step.validation_prompt,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Create a pending run request. External collaborators produce these;
    /// the scheduler only consumes them.
    pub fn enqueue_run(
        &self,
        test_case_id: i64,
        batch_id: Option<i64>,
        is_rerun: bool,
        created_by: Option<&str>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO run_requests(test_case_id, batch_id, status, is_rerun, enqueued_at, created_by)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5)",
            params![test_case_id, batch_id, is_rerun as i32, now(), created_by],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn upsert_credential(
        &self,
        project_id: &str,
        provider: &str,
        token: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO provider_credentials(project_id, provider, token)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id, provider) DO UPDATE SET token=excluded.token",
            params![project_id, provider, token],
        )?;
        Ok(())
    }

    pub fn upsert_catalog_entry(
        &self,
        model: &str,
        provider: &str,
        display_name: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO model_catalog(model, provider, display_name)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(model) DO UPDATE SET
                 provider=excluded.provider, display_name=excluded.display_name",
            params![model, provider, display_name],
        )?;
        Ok(())
    }

    // ---- scheduler queue ----

    /// Pending runs in FIFO order (enqueue time, then id as a deterministic
    /// tie-break), up to `limit`.
    pub fn fetch_pending(&self, limit: usize) -> Result<Vec<RunRequest>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, test_case_id, batch_id, status, is_rerun, enqueued_at,
                    started_at, completed_at, created_by, archived_at
             FROM run_requests
             WHERE status = 'pending' AND archived_at IS NULL
             ORDER BY enqueued_at ASC, id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], run_request_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Atomic claim: pending -> running, exactly one winner. Returns false
    /// when another claimant already took the run or it was withdrawn.
    pub fn claim_run(&self, run_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE run_requests SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'pending' AND archived_at IS NULL",
            params![now(), run_id],
        )?;
        Ok(affected == 1)
    }

    /// Write the terminal status. Conditional on `running` so it happens at
    /// most once per run lifetime; returns false if the run was not running.
    pub fn finalize_run(&self, run_id: i64, status: RunStatus) -> Result<bool, StoreError> {
        debug_assert!(status.is_terminal());
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE run_requests SET status = ?1, completed_at = ?2
             WHERE id = ?3 AND status = 'running'",
            params![status.as_str(), now(), run_id],
        )?;
        Ok(affected == 1)
    }

    pub fn get_run(&self, run_id: i64) -> Result<RunRequest, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, test_case_id, batch_id, status, is_rerun, enqueued_at,
                    started_at, completed_at, created_by, archived_at
             FROM run_requests WHERE id = ?1",
            params![run_id],
            run_request_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound {
            what: "run request",
            id: run_id,
        })
    }

    // ---- run execution reads ----

    pub fn get_test_case(&self, test_case_id: i64) -> Result<Option<TestCase>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let tc = conn
            .query_row(
                "SELECT id, project_id, name FROM test_cases
                 WHERE id = ?1 AND archived_at IS NULL",
                params![test_case_id],
                |row| {
                    Ok(TestCase {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(tc)
    }

    /// Live "ready" steps (non-null input and expected output) in ascending
    /// step order.
    pub fn ready_steps(&self, test_case_id: i64) -> Result<Vec<StepDefinition>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, test_case_id, step_order, model, endpoint, input,
                    expected_output, match_type, validation_prompt
             FROM step_definitions
             WHERE test_case_id = ?1 AND archived_at IS NULL
               AND input IS NOT NULL AND expected_output IS NOT NULL
             ORDER BY step_order ASC",
        )?;
        let rows = stmt.query_map(params![test_case_id], |row| {
            let match_type: String = row.get(7)?;
            Ok(StepDefinition {
                id: row.get(0)?,
                test_case_id: row.get(1)?,
                step_order: row.get(2)?,
                model: row.get(3)?,
                endpoint: row.get(4)?,
                input: row.get(5)?,
                expected_output: row.get(6)?,
                match_type: MatchType::parse(&match_type).unwrap_or(MatchType::SameMeaning),
                validation_prompt: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn credentials_for_project(
        &self,
        project_id: &str,
    ) -> Result<HashMap<String, String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT provider, token FROM provider_credentials WHERE project_id = ?1")?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = HashMap::new();
        for r in rows {
            let (provider, token) = r?;
            out.insert(provider, token);
        }
        Ok(out)
    }

    pub fn model_catalog(&self) -> Result<HashMap<String, ModelCatalogEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT model, provider, display_name FROM model_catalog")?;
        let rows = stmt.query_map([], |row| {
            Ok(ModelCatalogEntry {
                model: row.get(0)?,
                provider: row.get(1)?,
                display_name: row.get(2)?,
            })
        })?;
        let mut out = HashMap::new();
        for r in rows {
            let entry = r?;
            out.insert(entry.model.clone(), entry);
        }
        Ok(out)
    }

    // ---- step results (append-only) ----

    pub fn insert_step_result(
        &self,
        run_request_id: i64,
        result: &NewStepResult,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let ts = now();
        conn.execute(
            "INSERT INTO step_results(
                 run_request_id, step_definition_id, input_sent, output,
                 status, reason, model, endpoint, created_at, completed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run_request_id,
                result.step_definition_id,
                result.input_sent,
                result.output,
                result.status.as_str(),
                result.reason,
                result.model,
                result.endpoint,
                ts,
                ts,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn step_results_for_run(&self, run_request_id: i64) -> Result<Vec<StepResult>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, run_request_id, step_definition_id, input_sent, output,
                    status, reason, model, endpoint, created_at, completed_at
             FROM step_results WHERE run_request_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_request_id], |row| {
            let status: String = row.get(5)?;
            Ok(StepResult {
                id: row.get(0)?,
                run_request_id: row.get(1)?,
                step_definition_id: row.get(2)?,
                input_sent: row.get(3)?,
                output: row.get(4)?,
                status: StepStatus::parse(&status).unwrap_or(StepStatus::Failed),
                reason: row.get(6)?,
                model: row.get(7)?,
                endpoint: row.get(8)?,
                created_at: row.get(9)?,
                completed_at: row.get(10)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ---- batches ----

    pub fn get_batch(&self, batch_id: i64) -> Result<Batch, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, project_id, name, status, created_at, completed_at
             FROM batches WHERE id = ?1",
            params![batch_id],
            |row| {
                let status: String = row.get(3)?;
                Ok(Batch {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    name: row.get(2)?,
                    status: BatchStatus::parse(&status).unwrap_or(BatchStatus::Pending),
                    created_at: row.get(4)?,
                    completed_at: row.get(5)?,
                })
            },
        )
        .optional()?
        .ok_or(StoreError::NotFound {
            what: "batch",
            id: batch_id,
        })
    }

    pub fn batch_member_statuses(&self, batch_id: i64) -> Result<Vec<RunStatus>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT status FROM run_requests WHERE batch_id = ?1")?;
        let rows = stmt.query_map(params![batch_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            let s = r?;
            out.push(
                RunStatus::parse(&s)
                    .ok_or_else(|| StoreError::Database(format!("unknown run status '{s}'")))?,
            );
        }
        Ok(out)
    }

    /// Write the derived batch status. `completed_at` is stamped only on the
    /// transition into `success`; last writer wins on the derived field.
    pub fn set_batch_status(&self, batch_id: i64, status: BatchStatus) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE batches SET
                 status = ?1,
                 completed_at = CASE
                     WHEN ?1 = 'success' AND completed_at IS NULL THEN ?2
                     WHEN ?1 = 'success' THEN completed_at
                     ELSE NULL
                 END
             WHERE id = ?3",
            params![status.as_str(), now(), batch_id],
        )?;
        Ok(())
    }

    // ---- rerun lifecycle ----

    /// Accept a terminal rerun: archive it as `benchmark`, archive sibling
    /// reruns of the same test case and batch as `outdated`, and promote its
    /// step results to the new canonical step definitions. The previous
    /// definitions are archived, never deleted.
    pub fn accept_rerun(&self, run_id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(StoreError::from)?;
        let ts = now();

        let run = rerun_guard(&tx, run_id)?;

        tx.execute(
            "UPDATE run_requests SET status = 'benchmark', archived_at = ?1 WHERE id = ?2",
            params![ts, run_id],
        )?;
        tx.execute(
            "UPDATE run_requests SET status = 'outdated', archived_at = ?1
             WHERE test_case_id = ?2 AND batch_id IS ?3 AND is_rerun = 1
               AND id <> ?4 AND archived_at IS NULL",
            params![ts, run.test_case_id, run.batch_id, run_id],
        )?;

        // Promotion: the observed-good results become the canonical steps.
        // match_type/validation_prompt carry over from the originating
        // definition when it still exists.
        let promoted: Vec<PromotedStep> = {
            let mut stmt = tx.prepare(
                "SELECT sr.input_sent, sr.output, sr.model, sr.endpoint,
                        sd.match_type, sd.validation_prompt
                 FROM step_results sr
                 LEFT JOIN step_definitions sd ON sd.id = sr.step_definition_id
                 WHERE sr.run_request_id = ?1
                 ORDER BY sr.id ASC",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                Ok(PromotedStep {
                    input: row.get(0)?,
                    output: row.get(1)?,
                    model: row.get(2)?,
                    endpoint: row.get(3)?,
                    match_type: row.get(4)?,
                    validation_prompt: row.get(5)?,
                })
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            out
        };

        tx.execute(
            "UPDATE step_definitions SET archived_at = ?1
             WHERE test_case_id = ?2 AND archived_at IS NULL",
            params![ts, run.test_case_id],
        )?;

        for (idx, step) in promoted.iter().enumerate() {
            tx.execute(
                "INSERT INTO step_definitions(
                     test_case_id, step_order, model, endpoint, input,
                     expected_output, match_type, validation_prompt
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run.test_case_id,
                    (idx + 1) as i64,
                    step.model,
                    step.endpoint,
                    step.input,
                    step.output,
                    step.match_type.as_deref().unwrap_or("same_meaning"),
                    step.validation_prompt,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Reject a terminal rerun: archive it, touch nothing else.
    pub fn reject_rerun(&self, run_id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(StoreError::from)?;

        rerun_guard(&tx, run_id)?;
        tx.execute(
            "UPDATE run_requests SET archived_at = ?1 WHERE id = ?2",
            params![now(), run_id],
        )?;

        tx.commit()?;
        Ok(())
    }
}

struct RerunRow {
    test_case_id: i64,
    batch_id: Option<i64>,
}

struct PromotedStep {
    input: String,
    output: Option<String>,
    model: String,
    endpoint: Option<String>,
    match_type: Option<String>,
    validation_prompt: Option<String>,
}

/// Precondition check shared by accept/reject: the target must be a
/// non-archived rerun in a terminal status. Anything else is an explicit
/// precondition error, never a silent no-op.
fn rerun_guard(conn: &Connection, run_id: i64) -> Result<RerunRow, StoreError> {
    let row = conn
        .query_row(
            "SELECT test_case_id, batch_id, status, is_rerun, archived_at
             FROM run_requests WHERE id = ?1",
            params![run_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?
        .ok_or(StoreError::NotFound {
            what: "run request",
            id: run_id,
        })?;

    let (test_case_id, batch_id, status, is_rerun, archived_at) = row;
    if is_rerun == 0 {
        return Err(StoreError::Precondition(format!(
            "run {run_id} is not a rerun"
        )));
    }
    if archived_at.is_some() {
        return Err(StoreError::Precondition(format!(
            "run {run_id} is already archived"
        )));
    }
    let parsed = RunStatus::parse(&status)
        .ok_or_else(|| StoreError::Database(format!("unknown run status '{status}'")))?;
    if !parsed.is_terminal() {
        return Err(StoreError::Precondition(format!(
            "run {run_id} is not terminal (status: {status})"
        )));
    }
    Ok(RerunRow {
        test_case_id,
        batch_id,
    })
}

fn run_request_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRequest> {
    let status: String = row.get(3)?;
    let is_rerun: i64 = row.get(4)?;
    Ok(RunRequest {
        id: row.get(0)?,
        test_case_id: row.get(1)?,
        batch_id: row.get(2)?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        is_rerun: is_rerun != 0,
        enqueued_at: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        created_by: row.get(8)?,
        archived_at: row.get(9)?,
    })
}

pub(crate) fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
