//! SQLite schema for the run execution engine.
//!
//! Tables:
//! - `test_cases`: owning cases (project scoping for credentials)
//! - `step_definitions`: canonical ordered steps, soft-deleted on promotion
//! - `run_requests`: the polled queue; claim = one conditional UPDATE
//! - `step_results`: append-only execution log, never mutated
//! - `batches`: derived aggregate status over member runs
//! - `provider_credentials`: project-scoped provider tokens
//! - `model_catalog`: model name -> provider id

/// DDL for the engine tables.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS test_cases (
    id            INTEGER PRIMARY KEY,
    project_id    TEXT NOT NULL,
    name          TEXT NOT NULL,
    created_at    TEXT NOT NULL DEFAULT (datetime('now')),
    archived_at   TEXT
);

CREATE TABLE IF NOT EXISTS batches (
    id            INTEGER PRIMARY KEY,
    project_id    TEXT NOT NULL,
    name          TEXT,
    status        TEXT NOT NULL DEFAULT 'pending',
    created_at    TEXT NOT NULL DEFAULT (datetime('now')),
    completed_at  TEXT
);

CREATE TABLE IF NOT EXISTS step_definitions (
    id                INTEGER PRIMARY KEY,
    test_case_id      INTEGER NOT NULL REFERENCES test_cases(id),
    step_order        INTEGER NOT NULL,
    model             TEXT NOT NULL,
    endpoint          TEXT,
    input             TEXT,
    expected_output   TEXT,
    match_type        TEXT NOT NULL DEFAULT 'same_meaning',
    validation_prompt TEXT,
    created_at        TEXT NOT NULL DEFAULT (datetime('now')),
    archived_at       TEXT
);

-- step_order is unique among live definitions of one test case; archived
-- generations may repeat it.
CREATE UNIQUE INDEX IF NOT EXISTS idx_step_definitions_live_order
    ON step_definitions(test_case_id, step_order)
    WHERE archived_at IS NULL;

CREATE TABLE IF NOT EXISTS run_requests (
    id            INTEGER PRIMARY KEY,
    test_case_id  INTEGER NOT NULL REFERENCES test_cases(id),
    batch_id      INTEGER REFERENCES batches(id),
    status        TEXT NOT NULL DEFAULT 'pending',
    is_rerun      INTEGER NOT NULL DEFAULT 0,
    enqueued_at   TEXT NOT NULL,
    started_at    TEXT,
    completed_at  TEXT,
    created_by    TEXT,
    archived_at   TEXT
);

CREATE INDEX IF NOT EXISTS idx_run_requests_queue
    ON run_requests(status, enqueued_at, id);
CREATE INDEX IF NOT EXISTS idx_run_requests_batch
    ON run_requests(batch_id);

-- Execution log (append-only, immutable)
CREATE TABLE IF NOT EXISTS step_results (
    id                  INTEGER PRIMARY KEY,
    run_request_id      INTEGER NOT NULL REFERENCES run_requests(id),
    step_definition_id  INTEGER REFERENCES step_definitions(id),
    input_sent          TEXT NOT NULL,
    output              TEXT,
    status              TEXT NOT NULL,
    reason              TEXT,
    model               TEXT NOT NULL,
    endpoint            TEXT,
    created_at          TEXT NOT NULL,
    completed_at        TEXT
);

CREATE INDEX IF NOT EXISTS idx_step_results_run
    ON step_results(run_request_id);

CREATE TABLE IF NOT EXISTS provider_credentials (
    project_id   TEXT NOT NULL,
    provider     TEXT NOT NULL,
    token        TEXT NOT NULL,
    PRIMARY KEY (project_id, provider)
);

CREATE TABLE IF NOT EXISTS model_catalog (
    model         TEXT PRIMARY KEY,
    provider      TEXT NOT NULL,
    display_name  TEXT
);
"#;
