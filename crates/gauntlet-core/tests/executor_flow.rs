//! End-to-end executor tests over in-memory fakes.
//!
//! A fake chat adapter stands in for both the step provider and the judge
//! provider; everything else (store, catalog, registry, executor) is the
//! real implementation.

use gauntlet_core::engine::{ExecutorConfig, RunExecutor};
use gauntlet_core::model::{MatchType, RunStatus, StepStatus};
use gauntlet_core::providers::llm::{ChatProvider, ChatRequest, ChatResponse, ProviderError};
use gauntlet_core::providers::ProviderRegistry;
use gauntlet_core::storage::{NewStepDefinition, Store};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Scripted adapter: pops one reply per call, counts invocations.
struct FakeProvider {
    id: &'static str,
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
}

impl FakeProvider {
    fn new(id: &'static str, replies: Vec<Result<String, String>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            replies: Mutex::new(replies.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for FakeProvider {
    fn provider_id(&self) -> &'static str {
        self.id
    }

    async fn chat(
        &self,
        _request: &ChatRequest,
        _credential: &str,
    ) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(ChatResponse::from_text(text)),
            Some(Err(body)) => Err(ProviderError::Api {
                provider: self.id,
                status: 500,
                body,
            }),
            None => Err(ProviderError::Api {
                provider: self.id,
                status: 500,
                body: "fake reply queue exhausted".into(),
            }),
        }
    }
}

struct Harness {
    store: Store,
    executor: RunExecutor,
    provider: Arc<FakeProvider>,
    judge: Arc<FakeProvider>,
    test_case: i64,
}

/// Store with one project, a `gpt-x -> fakeai` catalog entry, a judge model
/// on its own fake provider, and credentials for both.
fn harness(
    provider_replies: Vec<Result<String, String>>,
    judge_replies: Vec<Result<String, String>>,
) -> Harness {
    let store = Store::memory().unwrap();
    let test_case = store.create_test_case("proj", "greeting").unwrap();
    store.upsert_catalog_entry("gpt-x", "fakeai", None).unwrap();
    store.upsert_catalog_entry("judge-x", "fakejudge", None).unwrap();
    store.upsert_credential("proj", "fakeai", "k1").unwrap();
    store.upsert_credential("proj", "fakejudge", "k2").unwrap();

    let provider = FakeProvider::new("fakeai", provider_replies);
    let judge = FakeProvider::new("fakejudge", judge_replies);
    let mut registry = ProviderRegistry::new(provider.clone());
    registry.register(judge.clone());

    let executor = RunExecutor::new(
        store.clone(),
        Arc::new(registry),
        ExecutorConfig {
            judge_model: "judge-x".into(),
            call_timeout: None,
        },
    );
    Harness {
        store,
        executor,
        provider,
        judge,
        test_case,
    }
}

fn add_step(store: &Store, test_case: i64, order: i64, model: &str, input: &str, expected: &str) {
    store
        .add_step(&NewStepDefinition {
            test_case_id: test_case,
            step_order: order,
            model,
            endpoint: Some("chat"),
            input: Some(input),
            expected_output: Some(expected),
            match_type: MatchType::SameMeaning,
            validation_prompt: None,
        })
        .unwrap();
}

async fn claim_and_execute(h: &Harness, run_id: i64) {
    assert!(h.store.claim_run(run_id).unwrap());
    let run = h.store.get_run(run_id).unwrap();
    h.executor.execute(&run).await.unwrap();
}

#[tokio::test]
async fn end_to_end_success_scenario() {
    let h = harness(
        vec![Ok("Hello there!".into())],
        vec![Ok("passed, same greeting intent".into())],
    );
    add_step(
        &h.store,
        h.test_case,
        1,
        "gpt-x",
        r#"{"messages":[{"role":"user","content":"Hi"}]}"#,
        "Hello",
    );
    let run = h.store.enqueue_run(h.test_case, None, false, None).unwrap();

    claim_and_execute(&h, run).await;

    let row = h.store.get_run(run).unwrap();
    assert_eq!(row.status, RunStatus::Success);
    assert!(row.completed_at.is_some());

    let results = h.store.step_results_for_run(run).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, StepStatus::Success);
    assert_eq!(results[0].output.as_deref(), Some("Hello there!"));
    assert_eq!(results[0].reason, None);
    // The canonical input actually sent is persisted.
    assert_eq!(
        results[0].input_sent,
        r#"[{"role":"user","content":"Hi"}]"#
    );
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.judge.calls(), 1);
}

#[tokio::test]
async fn missing_credential_short_circuits_without_provider_calls() {
    // Like `harness`, but with no credential for the step provider.
    let fresh = Store::memory().unwrap();
    let tc = fresh.create_test_case("proj", "no-creds").unwrap();
    fresh.upsert_catalog_entry("gpt-x", "fakeai", None).unwrap();
    fresh.upsert_catalog_entry("judge-x", "fakejudge", None).unwrap();
    fresh.upsert_credential("proj", "fakejudge", "k2").unwrap();
    add_step(&fresh, tc, 1, "gpt-x", "Hi", "Hello");
    add_step(&fresh, tc, 2, "gpt-x", "Bye", "Goodbye");

    let provider = FakeProvider::new("fakeai", vec![]);
    let judge = FakeProvider::new("fakejudge", vec![]);
    let mut registry = ProviderRegistry::new(provider.clone());
    registry.register(judge.clone());
    let executor = RunExecutor::new(
        fresh.clone(),
        Arc::new(registry),
        ExecutorConfig {
            judge_model: "judge-x".into(),
            call_timeout: None,
        },
    );

    let run = fresh.enqueue_run(tc, None, false, None).unwrap();
    assert!(fresh.claim_run(run).unwrap());
    executor.execute(&fresh.get_run(run).unwrap()).await.unwrap();

    assert_eq!(fresh.get_run(run).unwrap().status, RunStatus::Failed);
    let results = fresh.step_results_for_run(run).unwrap();
    assert_eq!(results.len(), 2, "every step gets a result row");
    for result in &results {
        assert_eq!(result.status, StepStatus::Failed);
        let reason = result.reason.as_deref().unwrap();
        assert!(reason.contains("fakeai"), "reason names the provider: {reason}");
        assert!(result.output.is_none());
    }
    assert_eq!(provider.calls(), 0, "no provider call may be attempted");
    assert_eq!(judge.calls(), 0);
}

#[tokio::test]
async fn every_step_is_attempted_despite_failures() {
    // Step 2 uses an uncataloged model; steps 1 and 3 pass.
    let h = harness(
        vec![Ok("Hello there!".into()), Ok("Fine, thanks!".into())],
        vec![Ok("passed".into()), Ok("passed".into())],
    );
    add_step(&h.store, h.test_case, 1, "gpt-x", "Hi", "Hello");
    add_step(&h.store, h.test_case, 2, "mystery-model", "Hi", "Hello");
    add_step(&h.store, h.test_case, 3, "gpt-x", "How are you?", "Fine");
    let run = h.store.enqueue_run(h.test_case, None, false, None).unwrap();

    claim_and_execute(&h, run).await;

    let results = h.store.step_results_for_run(run).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].status, StepStatus::Success);
    assert_eq!(results[1].status, StepStatus::Failed);
    assert!(results[1]
        .reason
        .as_deref()
        .unwrap()
        .contains("model not supported: mystery-model"));
    assert_eq!(results[2].status, StepStatus::Success);

    // Run status law: failed because one step failed.
    assert_eq!(h.store.get_run(run).unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn malformed_input_fails_the_step_without_a_provider_call() {
    let h = harness(vec![], vec![]);
    add_step(&h.store, h.test_case, 1, "gpt-x", "42", "whatever");
    let run = h.store.enqueue_run(h.test_case, None, false, None).unwrap();

    claim_and_execute(&h, run).await;

    let results = h.store.step_results_for_run(run).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, StepStatus::Failed);
    assert!(results[0].reason.as_deref().unwrap().contains("malformed input"));
    assert_eq!(h.provider.calls(), 0);
}

#[tokio::test]
async fn provider_errors_become_failed_steps_not_crashes() {
    let h = harness(
        vec![Err("rate limited".into()), Ok("Fine, thanks!".into())],
        vec![Ok("passed".into())],
    );
    add_step(&h.store, h.test_case, 1, "gpt-x", "Hi", "Hello");
    add_step(&h.store, h.test_case, 2, "gpt-x", "How are you?", "Fine");
    let run = h.store.enqueue_run(h.test_case, None, false, None).unwrap();

    claim_and_execute(&h, run).await;

    let results = h.store.step_results_for_run(run).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, StepStatus::Failed);
    assert!(results[0].reason.as_deref().unwrap().contains("rate limited"));
    assert!(results[0].output.is_none());
    // The failure did not stop step 2.
    assert_eq!(results[1].status, StepStatus::Success);
}

#[tokio::test]
async fn non_passing_verdict_text_is_the_failure_reason() {
    let h = harness(
        vec![Ok("Hello!".into())],
        vec![Ok("Close but missing field X.".into())],
    );
    add_step(&h.store, h.test_case, 1, "gpt-x", "Hi", "Hello with field X");
    let run = h.store.enqueue_run(h.test_case, None, false, None).unwrap();

    claim_and_execute(&h, run).await;

    let results = h.store.step_results_for_run(run).unwrap();
    assert_eq!(results[0].status, StepStatus::Failed);
    // Original, non-normalized verdict text, unmodified.
    assert_eq!(
        results[0].reason.as_deref(),
        Some("Close but missing field X.")
    );
    assert_eq!(results[0].output.as_deref(), Some("Hello!"));
    assert_eq!(h.store.get_run(run).unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn judge_call_errors_fail_the_step() {
    let h = harness(
        vec![Ok("Hello!".into())],
        vec![Err("judge backend down".into())],
    );
    add_step(&h.store, h.test_case, 1, "gpt-x", "Hi", "Hello");
    let run = h.store.enqueue_run(h.test_case, None, false, None).unwrap();

    claim_and_execute(&h, run).await;

    let results = h.store.step_results_for_run(run).unwrap();
    assert_eq!(results[0].status, StepStatus::Failed);
    assert!(results[0].reason.as_deref().unwrap().contains("judge call failed"));
    assert_eq!(results[0].output.as_deref(), Some("Hello!"));
}

#[tokio::test]
async fn unknown_provider_id_falls_back_to_default_adapter() {
    let h = harness(
        vec![Ok("Hello there!".into())],
        vec![Ok("passed".into())],
    );
    // Model mapped to a provider id nobody registered; the credential is
    // still keyed by that id.
    h.store.upsert_catalog_entry("new-model", "brand-new", None).unwrap();
    h.store.upsert_credential("proj", "brand-new", "k3").unwrap();
    add_step(&h.store, h.test_case, 1, "new-model", "Hi", "Hello");
    let run = h.store.enqueue_run(h.test_case, None, false, None).unwrap();

    claim_and_execute(&h, run).await;

    assert_eq!(h.store.get_run(run).unwrap().status, RunStatus::Success);
    // The default adapter took the call.
    assert_eq!(h.provider.calls(), 1);
}

#[tokio::test]
async fn archived_test_case_fails_the_run() {
    let h = harness(vec![], vec![]);
    add_step(&h.store, h.test_case, 1, "gpt-x", "Hi", "Hello");
    let run = h.store.enqueue_run(h.test_case, None, false, None).unwrap();
    h.store.archive_test_case(h.test_case).unwrap();

    claim_and_execute(&h, run).await;

    assert_eq!(h.store.get_run(run).unwrap().status, RunStatus::Failed);
    assert_eq!(h.provider.calls(), 0);
}

#[tokio::test]
async fn store_failure_after_claim_still_fails_the_run() {
    // File-backed DB so a second connection can break the store out from
    // under a claimed run.
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let tc = store.create_test_case("proj", "doomed").unwrap();
    add_step(&store, tc, 1, "gpt-x", "Hi", "Hello");
    let run = store.enqueue_run(tc, None, false, None).unwrap();

    let registry = ProviderRegistry::new(FakeProvider::new("fakeai", vec![]));
    let executor = RunExecutor::new(
        store.clone(),
        Arc::new(registry),
        ExecutorConfig {
            judge_model: "judge-x".into(),
            call_timeout: None,
        },
    );

    assert!(store.claim_run(run).unwrap());
    rusqlite::Connection::open(tmp.path())
        .unwrap()
        .execute_batch("DROP TABLE step_definitions")
        .unwrap();

    let claimed = store.get_run(run).unwrap();
    assert!(executor.execute(&claimed).await.is_err());

    // The run must not be stranded in `running`: nothing re-fetches a
    // running run, so the failure has to reach the terminal status.
    let row = store.get_run(run).unwrap();
    assert_eq!(row.status, RunStatus::Failed);
    assert!(row.completed_at.is_some());
}

#[tokio::test]
async fn batch_status_follows_member_completions() {
    let h = harness(
        vec![Ok("Hello there!".into()), Ok("Hello there!".into())],
        vec![Ok("passed".into()), Ok("passed".into())],
    );
    add_step(&h.store, h.test_case, 1, "gpt-x", "Hi", "Hello");
    let batch = h.store.create_batch("proj", Some("nightly")).unwrap();
    let r1 = h.store.enqueue_run(h.test_case, Some(batch), false, None).unwrap();
    let r2 = h.store.enqueue_run(h.test_case, Some(batch), false, None).unwrap();

    claim_and_execute(&h, r1).await;
    // One member done, one still pending.
    let b = h.store.get_batch(batch).unwrap();
    assert_eq!(b.status.as_str(), "pending");
    assert!(b.completed_at.is_none());

    claim_and_execute(&h, r2).await;
    let b = h.store.get_batch(batch).unwrap();
    assert_eq!(b.status.as_str(), "success");
    assert!(b.completed_at.is_some());
}
