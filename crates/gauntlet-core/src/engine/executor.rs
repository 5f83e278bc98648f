//! Run executor: orchestrates one claimed run.
//!
//! Steps execute strictly sequentially, never in parallel, and the loop
//! never aborts early on a step failure: every step is attempted and yields
//! exactly one step result, so the test author sees full diagnostic
//! coverage. Step-level failures are recovered locally; only run-level
//! failures (missing test case, persistence errors) abort the run, and the
//! scheduler keeps going regardless.

use crate::catalog::ProjectSnapshot;
use crate::engine::aggregate;
use crate::errors::StepError;
use crate::judge::{Judge, Verdict};
use crate::model::{
    canonical_messages, NewStepResult, RunRequest, RunStatus, StepDefinition, StepStatus,
};
use crate::providers::llm::{ChatProvider, ChatRequest, ChatResponse};
use crate::providers::ProviderRegistry;
use crate::storage::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Model used for judge calls, resolved through the same catalog and
    /// registry as step models.
    pub judge_model: String,
    /// Optional bound on each provider call. `None` reproduces the
    /// original unbounded behavior; a stalled call then occupies one
    /// concurrency slot until it resolves.
    pub call_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            judge_model: "gpt-4o".into(),
            call_timeout: None,
        }
    }
}

pub struct RunExecutor {
    store: Store,
    registry: Arc<ProviderRegistry>,
    judge: Judge,
    config: ExecutorConfig,
}

impl RunExecutor {
    pub fn new(store: Store, registry: Arc<ProviderRegistry>, config: ExecutorConfig) -> Self {
        let judge = Judge::new(registry.clone(), config.judge_model.clone());
        Self {
            store,
            registry,
            judge,
            config,
        }
    }

    /// Execute one claimed run to its terminal status.
    ///
    /// A store failure after the claim is fatal to the run but must not
    /// strand it in `running`: nothing re-fetches a running run, and an
    /// owning batch would never complete. So on any error the executor
    /// makes a best-effort attempt to write `failed` before propagating.
    pub async fn execute(&self, run: &RunRequest) -> anyhow::Result<()> {
        match self.try_execute(run).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(run = run.id, "run aborted: {e:#}");
                if let Err(finish_err) = self.finish(run, RunStatus::Failed) {
                    error!(
                        run = run.id,
                        "could not write terminal status for aborted run: {finish_err:#}"
                    );
                }
                Err(e)
            }
        }
    }

    async fn try_execute(&self, run: &RunRequest) -> anyhow::Result<()> {
        let Some(test_case) = self.store.get_test_case(run.test_case_id)? else {
            error!(
                run = run.id,
                test_case = run.test_case_id,
                "owning test case not found, failing run"
            );
            self.finish(run, RunStatus::Failed)?;
            return Ok(());
        };

        let steps = self.store.ready_steps(test_case.id)?;
        // Credentials and catalog are read once here; the run sees a stable
        // snapshot even if configuration changes mid-run.
        let snapshot = ProjectSnapshot::load(&self.store, &test_case.project_id)?;

        if let Some(missing) = self.missing_credentials(&steps, &snapshot) {
            let reason = StepError::MissingCredential {
                providers: missing.clone(),
            }
            .to_string();
            warn!(
                run = run.id,
                test_case = test_case.id,
                providers = ?missing,
                "credentials missing, short-circuiting run without provider calls"
            );
            for step in &steps {
                self.store.insert_step_result(
                    run.id,
                    &NewStepResult {
                        step_definition_id: Some(step.id),
                        input_sent: step.input.clone(),
                        output: None,
                        status: StepStatus::Failed,
                        reason: Some(reason.clone()),
                        model: step.model.clone(),
                        endpoint: step.endpoint.clone(),
                    },
                )?;
            }
            self.finish(run, RunStatus::Failed)?;
            return Ok(());
        }

        let mut any_failed = false;
        for step in &steps {
            let result = self.execute_step(step, &snapshot).await;
            any_failed |= result.status == StepStatus::Failed;
            self.store.insert_step_result(run.id, &result)?;
        }

        let status = if any_failed {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        info!(
            run = run.id,
            test_case = test_case.id,
            steps = steps.len(),
            status = status.as_str(),
            "run completed"
        );
        self.finish(run, status)
    }

    /// Distinct providers referenced by the steps' models that have no
    /// configured credential. Unknown models are skipped here; they fail
    /// per-step instead.
    fn missing_credentials(
        &self,
        steps: &[StepDefinition],
        snapshot: &ProjectSnapshot,
    ) -> Option<Vec<String>> {
        let mut missing: Vec<String> = steps
            .iter()
            .filter_map(|s| snapshot.model(&s.model))
            .filter(|entry| snapshot.credential(&entry.provider).is_none())
            .map(|entry| entry.provider.clone())
            .collect();
        missing.sort();
        missing.dedup();
        if missing.is_empty() {
            None
        } else {
            Some(missing)
        }
    }

    /// Attempt one step. Always returns a result row; every failure mode
    /// collapses into a failed row with a human-readable reason.
    async fn execute_step(
        &self,
        step: &StepDefinition,
        snapshot: &ProjectSnapshot,
    ) -> NewStepResult {
        let messages = match canonical_messages(&step.input) {
            Ok(m) => m,
            Err(detail) => {
                return failed_row(
                    step,
                    step.input.clone(),
                    None,
                    StepError::MalformedInput { detail }.to_string(),
                )
            }
        };
        let input_sent =
            serde_json::to_string(&messages).unwrap_or_else(|_| step.input.clone());

        let Some(entry) = snapshot.model(&step.model) else {
            return failed_row(
                step,
                input_sent,
                None,
                StepError::UnsupportedModel {
                    model: step.model.clone(),
                }
                .to_string(),
            );
        };

        // Registry falls back to the default adapter for unknown provider
        // ids; only a missing credential fails the step here.
        let adapter = self.registry.resolve(&entry.provider);
        let Some(credential) = snapshot.credential(&entry.provider) else {
            return failed_row(
                step,
                input_sent,
                None,
                StepError::MissingCredential {
                    providers: vec![entry.provider.clone()],
                }
                .to_string(),
            );
        };

        let request = ChatRequest {
            model: entry.model.clone(),
            messages,
            temperature: 0.0,
            max_tokens: None,
        };
        let response = match self.call_provider(adapter.as_ref(), &request, credential).await {
            Ok(r) => r,
            Err(reason) => return failed_row(step, input_sent, None, reason),
        };
        let Some(text) = response.primary_text().map(str::to_string) else {
            return failed_row(
                step,
                input_sent,
                None,
                "provider response has no message content".into(),
            );
        };

        match self
            .judge
            .evaluate(
                snapshot,
                &text,
                &step.expected_output,
                step.match_type,
                step.validation_prompt.as_deref(),
            )
            .await
        {
            Ok(Verdict::Passed) => NewStepResult {
                step_definition_id: Some(step.id),
                input_sent,
                output: Some(text),
                status: StepStatus::Success,
                reason: None,
                model: step.model.clone(),
                endpoint: step.endpoint.clone(),
            },
            Ok(Verdict::Failed(reason)) => failed_row(step, input_sent, Some(text), reason),
            Err(e) => failed_row(
                step,
                input_sent,
                Some(text),
                StepError::Judge(format!("{e:#}")).to_string(),
            ),
        }
    }

    async fn call_provider(
        &self,
        adapter: &dyn ChatProvider,
        request: &ChatRequest,
        credential: &str,
    ) -> Result<ChatResponse, String> {
        let call = adapter.chat(request, credential);
        let outcome = match self.config.call_timeout {
            Some(bound) => match timeout(bound, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(format!(
                        "provider call timed out after {}s",
                        bound.as_secs()
                    ))
                }
            },
            None => call.await,
        };
        outcome.map_err(|e| e.to_string())
    }

    /// Write the terminal status (at most once) and recompute the owning
    /// batch, if any.
    fn finish(&self, run: &RunRequest, status: RunStatus) -> anyhow::Result<()> {
        let wrote = self.store.finalize_run(run.id, status)?;
        if !wrote {
            warn!(
                run = run.id,
                "terminal status was already written, skipping finalize"
            );
        }
        if let Some(batch_id) = run.batch_id {
            aggregate::recompute_batch(&self.store, batch_id)?;
        }
        Ok(())
    }
}

fn failed_row(
    step: &StepDefinition,
    input_sent: String,
    output: Option<String>,
    reason: String,
) -> NewStepResult {
    NewStepResult {
        step_definition_id: Some(step.id),
        input_sent,
        output,
        status: StepStatus::Failed,
        reason: Some(reason),
        model: step.model.clone(),
        endpoint: step.endpoint.clone(),
    }
}
