//! Workflow execution engine.
//!
//! `WorkflowEngine` drives one case at a time:
//! 1. Resolves the case's current step in its (immutable) workflow version.
//! 2. Dispatches the step to its executor through the [`StepRegistry`].
//! 3. Merges the step's output into a new context and follows its route.
//! 4. Commits every step through [`Store::commit_step`], which settles the
//!    step execution and writes the case under an optimistic version check.
//! 5. Stops at the first human task (case Suspended), at the end of the
//!    graph (Completed) or on the first error (Failed). Nothing is retried.

use std::sync::Arc;

use dashmap::DashMap;
use db::models::{
    CaseRecord, CaseStatus, HumanTaskRecord, PublicationStatus, StepExecutionRecord,
    StepExecutionStatus, StepSettlement,
};
use db::Store;
use notify::{Notification, Notifier};
use serde::Serialize;
use serde_json::{json, Map, Value};
use steps::clock::Clock;
use steps::{Context, StepConfig, StepInvocation, StepOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::models::{WorkflowStep, WorkflowVersion};
use crate::registry::StepRegistry;
use crate::EngineError;

/// `completed_by` recorded on a task closed by a direct `resume`.
const RESUMED_BY: &str = "engine";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Most steps one `advance` may run before the case is failed.
    pub max_chain_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chain_length: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Case state
// ---------------------------------------------------------------------------

/// Snapshot returned by [`WorkflowEngine::get_case_state`].
#[derive(Debug, Clone, Serialize)]
pub struct CaseState {
    pub case: CaseRecord,
    pub latest_execution: Option<StepExecutionRecord>,
    pub open_tasks: Vec<HumanTaskRecord>,
}

/// What the current step asked for, after routing.
enum Step {
    Advanced {
        output: Map<String, Value>,
        outcome: Option<String>,
        next: Option<String>,
    },
    Suspended {
        human_task_id: Uuid,
    },
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Orchestrates case execution. One engine serves every case; operations
/// on different cases share nothing but the version cache.
pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    registry: StepRegistry,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    versions: DashMap<Uuid, Arc<WorkflowVersion>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: StepRegistry,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            clock,
            config,
            versions: DashMap::new(),
        }
    }

    /// Create a case at the version's start step and advance it.
    ///
    /// # Errors
    /// [`EngineError::VersionNotPublished`] unless the version is Published.
    /// A step failure during the first advance leaves the case Failed and
    /// returns [`EngineError::CaseFailed`] carrying its id.
    #[instrument(skip(self, initial_context), fields(case_id))]
    pub async fn start_case(
        &self,
        version_id: Uuid,
        client_id: Uuid,
        initial_context: Map<String, Value>,
    ) -> Result<CaseRecord, EngineError> {
        // Status is read fresh: the cache only holds immutable step graphs.
        let record = self.store.load_workflow_version(version_id).await?;
        if record.status != PublicationStatus::Published {
            return Err(EngineError::VersionNotPublished(version_id));
        }
        let version = Arc::new(WorkflowVersion::from_record(record)?);
        self.versions.insert(version_id, Arc::clone(&version));

        let now = self.clock.now();
        let case = CaseRecord {
            id: Uuid::new_v4(),
            client_id,
            workflow_version_id: version_id,
            current_step_id: Some(version.start_step.clone()),
            status: CaseStatus::Running,
            context: initial_context,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        tracing::Span::current().record("case_id", tracing::field::display(case.id));

        self.store.insert_case(&case).await?;
        self.open_execution(&case, &version.start_step).await?;
        info!(start_step = %version.start_step, "case started");

        self.run(case, None).await
    }

    /// Advance a case from its persisted state.
    pub async fn advance(&self, case_id: Uuid) -> Result<CaseRecord, EngineError> {
        let case = self.store.load_case(case_id).await?;
        self.run(case, None).await
    }

    /// Advance from a snapshot the caller already holds. A stale snapshot
    /// fails with [`EngineError::ConcurrencyConflict`] before any step runs.
    pub async fn advance_case(&self, case: CaseRecord) -> Result<CaseRecord, EngineError> {
        self.run(case, None).await
    }

    /// Like [`advance`](Self::advance), but stops between steps once
    /// `cancel` fires. Committed steps stay committed; the next advance
    /// picks up where this one stopped.
    pub async fn advance_with_cancel(
        &self,
        case_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<CaseRecord, EngineError> {
        let case = self.store.load_case(case_id).await?;
        self.run(case, Some(cancel)).await
    }

    /// Continue a suspended case with a human decision.
    ///
    /// Legal only while the case is Suspended on exactly this step
    /// execution; anything else is [`EngineError::InvalidResumeTarget`]
    /// and changes nothing.
    #[instrument(skip(self, decision))]
    pub async fn resume(
        &self,
        case_id: Uuid,
        step_execution_id: Uuid,
        decision: Map<String, Value>,
    ) -> Result<CaseRecord, EngineError> {
        let invalid = || EngineError::InvalidResumeTarget {
            case_id,
            step_execution_id,
        };

        let case = self.store.load_case(case_id).await?;
        if case.status != CaseStatus::Suspended {
            return Err(invalid());
        }
        let execution = self
            .store
            .latest_step_execution(case_id)
            .await?
            .filter(|e| e.id == step_execution_id && e.status == StepExecutionStatus::Suspended)
            .ok_or_else(invalid)?;

        let version = self.version(case.workflow_version_id).await?;
        let step = version
            .step(&execution.step_id)
            .ok_or_else(|| EngineError::UnknownStep(execution.step_id.clone()))?;

        let label = match &step.config {
            StepConfig::HumanTask(config) => decision.get(&config.decision_variable).and_then(label_of),
            _ => None,
        };
        let next = match step.route(label.as_deref()) {
            Ok(next) => next,
            Err(err) => return self.fail(case, &execution, err).await,
        };

        let mut case = case;
        let expected = case.version;
        case.context = Context::new(case.context).merged(&decision).into();
        case.status = CaseStatus::Running;
        case.current_step_id = next.clone();
        if next.is_none() {
            case.status = CaseStatus::Completed;
        }
        case.updated_at = self.clock.now();

        let settlement = self.settlement(
            execution.id,
            StepExecutionStatus::Succeeded,
            Some(json!({ "decision": decision, "outcome": label })),
            None,
        );
        let case = self.store.commit_step(&case, expected, Some(&settlement)).await?;
        info!(step_id = %execution.step_id, next = ?next, "case resumed");

        // Resumed directly rather than through `complete_human_task`.
        if let Some(task) = self.store.open_task_for_step_execution(execution.id).await? {
            self.store
                .complete_human_task(task.id, &Value::Object(decision.clone()), RESUMED_BY, self.clock.now())
                .await?;
        }

        if case.status == CaseStatus::Completed {
            return Ok(self.completed(case));
        }
        self.drive(case, &version, None).await
    }

    /// The single completion action for a human task: Open → Completed,
    /// then resume the case with the decision.
    #[instrument(skip(self, decision))]
    pub async fn complete_human_task(
        &self,
        task_id: Uuid,
        decision: Map<String, Value>,
        completed_by: &str,
    ) -> Result<CaseRecord, EngineError> {
        let task = self
            .store
            .complete_human_task(task_id, &Value::Object(decision.clone()), completed_by, self.clock.now())
            .await
            .map_err(|e| match e {
                db::DbError::InvalidTransition { .. } => EngineError::TaskNotOpen(task_id),
                other => other.into(),
            })?;
        info!(case_id = %task.case_id, "human task completed");

        self.resume(task.case_id, task.step_execution_id, decision).await
    }

    /// Fail a suspended case: settle its step as Failed and cancel its
    /// open tasks.
    #[instrument(skip(self))]
    pub async fn cancel_case(&self, case_id: Uuid, reason: &str) -> Result<CaseRecord, EngineError> {
        let mut case = self.store.load_case(case_id).await?;
        if case.status != CaseStatus::Suspended {
            return Err(EngineError::CaseNotSuspended(case_id));
        }
        let execution = self.store.latest_step_execution(case_id).await?;
        let step_id = case.current_step_id.clone();

        let expected = case.version;
        case.status = CaseStatus::Failed;
        case.updated_at = self.clock.now();
        let settlement = execution.map(|e| {
            self.settlement(e.id, StepExecutionStatus::Failed, None, Some(reason.to_owned()))
        });
        let case = self
            .store
            .commit_step(&case, expected, settlement.as_ref())
            .await?;

        for task in self.store.open_tasks_for_case(case_id).await? {
            self.store.cancel_human_task(task.id, self.clock.now()).await?;
        }
        warn!(reason, "case cancelled");
        self.notifier.notify(Notification::CaseFailed {
            case_id,
            step_id,
            reason: reason.to_owned(),
        });
        Ok(case)
    }

    pub async fn get_case_state(&self, case_id: Uuid) -> Result<CaseState, EngineError> {
        Ok(CaseState {
            case: self.store.load_case(case_id).await?,
            latest_execution: self.store.latest_step_execution(case_id).await?,
            open_tasks: self.store.open_tasks_for_case(case_id).await?,
        })
    }

    /// Every step execution of the case, oldest first.
    pub async fn history(&self, case_id: Uuid) -> Result<Vec<StepExecutionRecord>, EngineError> {
        Ok(self.store.list_step_executions(case_id).await?)
    }

    // -----------------------------------------------------------------------
    // Internal: the advance loop
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(case_id = %case.id))]
    async fn run(
        &self,
        case: CaseRecord,
        cancel: Option<&CancellationToken>,
    ) -> Result<CaseRecord, EngineError> {
        if case.status != CaseStatus::Running {
            debug!(status = %case.status, "case is not running");
            return Ok(case);
        }
        let version = self.version(case.workflow_version_id).await?;

        // Claim the case: a caller holding a stale snapshot stops here.
        let expected = case.version;
        let case = self.store.commit_step(&case, expected, None).await?;

        self.drive(case, &version, cancel).await
    }

    async fn drive(
        &self,
        mut case: CaseRecord,
        version: &WorkflowVersion,
        cancel: Option<&CancellationToken>,
    ) -> Result<CaseRecord, EngineError> {
        let mut steps_run = 0usize;

        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                info!("advance cancelled between steps");
                return Ok(case);
            }
            let Some(step_id) = case.current_step_id.clone() else {
                return self.finish(case).await;
            };

            let execution = self.open_execution(&case, &step_id).await?;
            let result = if steps_run >= self.config.max_chain_length {
                Err(EngineError::ChainLimitExceeded {
                    case_id: case.id,
                    limit: self.config.max_chain_length,
                })
            } else {
                match version.step(&step_id) {
                    Some(step) => self.run_step(&case, step, &execution).await,
                    None => Err(EngineError::UnknownStep(step_id.clone())),
                }
            };
            steps_run += 1;

            match result {
                Ok(Step::Advanced {
                    output,
                    outcome,
                    next,
                }) => {
                    let expected = case.version;
                    case.context = Context::new(case.context).merged(&output).into();
                    case.current_step_id = next.clone();
                    if next.is_none() {
                        case.status = CaseStatus::Completed;
                    }
                    case.updated_at = self.clock.now();

                    let settlement = self.settlement(
                        execution.id,
                        StepExecutionStatus::Succeeded,
                        Some(json!({ "output": output, "outcome": outcome })),
                        None,
                    );
                    case = self.store.commit_step(&case, expected, Some(&settlement)).await?;
                    info!(step_id = %step_id, outcome = ?outcome, next = ?next, "step succeeded");

                    if case.status == CaseStatus::Completed {
                        return Ok(self.completed(case));
                    }
                }
                Ok(Step::Suspended { human_task_id }) => {
                    let expected = case.version;
                    case.status = CaseStatus::Suspended;
                    case.updated_at = self.clock.now();
                    let settlement = self.settlement(
                        execution.id,
                        StepExecutionStatus::Suspended,
                        Some(json!({ "human_task_id": human_task_id })),
                        None,
                    );
                    let case = self.store.commit_step(&case, expected, Some(&settlement)).await?;
                    info!(step_id = %step_id, %human_task_id, "case suspended");
                    return Ok(case);
                }
                // The step may or may not have committed; report it as is.
                Err(err) if err.is_persistence() => return Err(err),
                Err(err) => return self.fail(case, &execution, err).await,
            }

            tokio::task::yield_now().await;
        }
    }

    async fn run_step(
        &self,
        case: &CaseRecord,
        step: &WorkflowStep,
        execution: &StepExecutionRecord,
    ) -> Result<Step, EngineError> {
        let executor = self.registry.resolve(step.config.step_type())?;
        let context = Context::new(case.context.clone());
        let outcome = executor
            .execute(StepInvocation {
                case_id: case.id,
                step_execution_id: execution.id,
                step_id: &step.id,
                config: &step.config,
                context: &context,
            })
            .await
            .map_err(|e| EngineError::from_step(&step.id, e))?;

        match outcome {
            StepOutcome::Advance { output, outcome } => {
                let next = step.route(outcome.as_deref())?;
                Ok(Step::Advanced {
                    output,
                    outcome,
                    next,
                })
            }
            StepOutcome::Suspend { human_task_id } => Ok(Step::Suspended { human_task_id }),
        }
    }

    /// The Pending execution for `step_id`: the latest one if a previous
    /// advance was interrupted before running it, otherwise a new one.
    async fn open_execution(
        &self,
        case: &CaseRecord,
        step_id: &str,
    ) -> Result<StepExecutionRecord, EngineError> {
        if let Some(latest) = self.store.latest_step_execution(case.id).await? {
            if latest.step_id == step_id && latest.status == StepExecutionStatus::Pending {
                return Ok(latest);
            }
        }
        let execution = StepExecutionRecord {
            id: Uuid::new_v4(),
            case_id: case.id,
            step_id: step_id.to_owned(),
            sequence: 0,
            status: StepExecutionStatus::Pending,
            input: Value::Object(case.context.clone()),
            result: None,
            error: None,
            started_at: self.clock.now(),
            finished_at: None,
        };
        Ok(self.store.insert_step_execution(&execution).await?)
    }

    /// Persist a step failure on the case, then hand the error back as
    /// [`EngineError::CaseFailed`].
    async fn fail(
        &self,
        mut case: CaseRecord,
        execution: &StepExecutionRecord,
        err: EngineError,
    ) -> Result<CaseRecord, EngineError> {
        error!(step_id = %execution.step_id, "step failed: {err}");

        let expected = case.version;
        case.status = CaseStatus::Failed;
        case.updated_at = self.clock.now();
        let settlement = self.settlement(
            execution.id,
            StepExecutionStatus::Failed,
            None,
            Some(err.to_string()),
        );
        self.store.commit_step(&case, expected, Some(&settlement)).await?;

        // A failed resume leaves the step's task behind.
        if execution.status == StepExecutionStatus::Suspended {
            if let Some(task) = self.store.open_task_for_step_execution(execution.id).await? {
                self.store.cancel_human_task(task.id, self.clock.now()).await?;
            }
        }

        self.notifier.notify(Notification::CaseFailed {
            case_id: case.id,
            step_id: Some(execution.step_id.clone()),
            reason: err.to_string(),
        });
        Err(EngineError::CaseFailed {
            case_id: case.id,
            source: Box::new(err),
        })
    }

    /// A Running case whose cursor is already past the last step.
    async fn finish(&self, mut case: CaseRecord) -> Result<CaseRecord, EngineError> {
        let expected = case.version;
        case.status = CaseStatus::Completed;
        case.updated_at = self.clock.now();
        let case = self.store.commit_step(&case, expected, None).await?;
        Ok(self.completed(case))
    }

    fn completed(&self, case: CaseRecord) -> CaseRecord {
        info!(case_id = %case.id, "case completed");
        self.notifier
            .notify(Notification::CaseCompleted { case_id: case.id });
        case
    }

    fn settlement(
        &self,
        step_execution_id: Uuid,
        status: StepExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> StepSettlement {
        StepSettlement {
            step_execution_id,
            status,
            result,
            error,
            finished_at: Some(self.clock.now()),
        }
    }

    /// Published and archived versions never change, so they are cached.
    async fn version(&self, id: Uuid) -> Result<Arc<WorkflowVersion>, EngineError> {
        let cached = self.versions.get(&id).map(|v| Arc::clone(v.value()));
        if let Some(version) = cached {
            return Ok(version);
        }
        let version = Arc::new(WorkflowVersion::from_record(
            self.store.load_workflow_version(id).await?,
        )?);
        if version.status != PublicationStatus::Draft {
            self.versions.insert(id, Arc::clone(&version));
        }
        Ok(version)
    }
}

/// Branch label carried by a decision value.
fn label_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
