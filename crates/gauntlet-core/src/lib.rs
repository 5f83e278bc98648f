//! gauntlet-core: run execution engine for an AI-output test harness.
//!
//! The engine polls a SQLite-backed queue of pending run requests, claims
//! each exactly once via an atomic conditional update, executes the run's
//! ordered steps against pluggable model providers, scores outputs through
//! a judge-model call, and aggregates step outcomes into run- and
//! batch-level status. It exposes no network endpoints of its own; run
//! requests are produced by external collaborators.

pub mod catalog;
pub mod engine;
pub mod errors;
pub mod judge;
pub mod model;
pub mod providers;
pub mod storage;
