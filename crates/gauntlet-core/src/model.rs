//! Domain rows and status enums for the run execution engine.
//!
//! Statuses are stored as lowercase text in SQLite and converted at the
//! storage boundary; see `storage::store`.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`RunRequest`].
///
/// `pending -> running` happens exactly once via the atomic claim;
/// `running -> success|failed` exactly once via finalize. `benchmark` and
/// `outdated` are archival statuses reachable only through the rerun
/// accept flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Benchmark,
    Outdated,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Benchmark => "benchmark",
            RunStatus::Outdated => "outdated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "benchmark" => Some(RunStatus::Benchmark),
            "outdated" => Some(RunStatus::Outdated),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

/// Outcome of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(StepStatus::Success),
            "failed" => Some(StepStatus::Failed),
            _ => None,
        }
    }
}

/// Derived batch status, recomputed from member run statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Success,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Success => "success",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BatchStatus::Pending),
            "running" => Some(BatchStatus::Running),
            "success" => Some(BatchStatus::Success),
            _ => None,
        }
    }
}

/// Comparison policy applied by the step evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    SameMeaning,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::SameMeaning => "same_meaning",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(MatchType::Exact),
            "same_meaning" => Some(MatchType::SameMeaning),
            _ => None,
        }
    }
}

/// One role/content message in the canonical chat shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// One queued/executing/completed attempt to run a test case.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub id: i64,
    pub test_case_id: i64,
    pub batch_id: Option<i64>,
    pub status: RunStatus,
    pub is_rerun: bool,
    pub enqueued_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_by: Option<String>,
    pub archived_at: Option<String>,
}

/// Owning test case, loaded at run start for project scoping.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub id: i64,
    pub project_id: String,
    pub name: String,
}

/// One canonical ordered provider-call step belonging to a test case.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub id: i64,
    pub test_case_id: i64,
    pub step_order: i64,
    pub model: String,
    pub endpoint: Option<String>,
    /// Raw input text as stored; canonicalized via [`canonical_messages`].
    pub input: String,
    pub expected_output: String,
    pub match_type: MatchType,
    pub validation_prompt: Option<String>,
}

/// Immutable record of one executed step attempt. Append-only.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub id: i64,
    pub run_request_id: i64,
    pub step_definition_id: Option<i64>,
    pub input_sent: String,
    pub output: Option<String>,
    pub status: StepStatus,
    pub reason: Option<String>,
    pub model: String,
    pub endpoint: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Fields for inserting a new [`StepResult`] row.
#[derive(Debug, Clone)]
pub struct NewStepResult {
    pub step_definition_id: Option<i64>,
    pub input_sent: String,
    pub output: Option<String>,
    pub status: StepStatus,
    pub reason: Option<String>,
    pub model: String,
    pub endpoint: Option<String>,
}

/// A group of run requests with a derived aggregate status.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: i64,
    pub project_id: String,
    pub name: Option<String>,
    pub status: BatchStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Catalog row mapping a model name to its provider.
#[derive(Debug, Clone)]
pub struct ModelCatalogEntry {
    pub model: String,
    pub provider: String,
    pub display_name: Option<String>,
}

/// Parse a step input into the canonical ordered message list.
///
/// Accepted shapes:
/// - a raw string (becomes a single user message),
/// - a JSON-encoded string (unwrapped, then re-interpreted),
/// - a JSON array of `{role, content}` objects,
/// - a JSON object with a `messages` array of `{role, content}` objects.
///
/// Anything else is a malformed input: the caller records the failure and
/// skips the provider call. That includes bare JSON scalars (`42`, `true`,
/// `null`): step inputs are authored as prose or message JSON, so a bare
/// scalar is almost certainly a serialization mistake upstream and is
/// rejected rather than silently sent as prompt text.
pub fn canonical_messages(input: &str) -> Result<Vec<ChatMessage>, String> {
    match serde_json::from_str::<serde_json::Value>(input) {
        Ok(value) => messages_from_value(value),
        // Not JSON at all: treat the raw text as a single user message.
        Err(_) => Ok(vec![ChatMessage::user(input)]),
    }
}

fn messages_from_value(value: serde_json::Value) -> Result<Vec<ChatMessage>, String> {
    match value {
        serde_json::Value::Array(items) => messages_from_array(items),
        serde_json::Value::Object(mut obj) => match obj.remove("messages") {
            Some(serde_json::Value::Array(items)) => messages_from_array(items),
            Some(other) => Err(format!(
                "'messages' must be an array, got {}",
                json_type_name(&other)
            )),
            None => Err("object input has no 'messages' array".into()),
        },
        // JSON-encoded string: unwrap one level and re-interpret.
        serde_json::Value::String(inner) => match serde_json::from_str::<serde_json::Value>(&inner)
        {
            Ok(v @ serde_json::Value::Array(_)) | Ok(v @ serde_json::Value::Object(_)) => {
                messages_from_value(v)
            }
            _ => Ok(vec![ChatMessage::user(inner)]),
        },
        other => Err(format!(
            "input must be a string or message list, got {}",
            json_type_name(&other)
        )),
    }
}

fn messages_from_array(items: Vec<serde_json::Value>) -> Result<Vec<ChatMessage>, String> {
    if items.is_empty() {
        return Err("message list is empty".into());
    }
    let mut out = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        let obj = item
            .as_object()
            .ok_or_else(|| format!("message {} is not an object", idx))?;
        let role = obj
            .get("role")
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("message {} is missing a string 'role'", idx))?;
        let content = obj
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("message {} is missing a string 'content'", idx))?;
        out.push(ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
        });
    }
    Ok(out)
}

fn json_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
