use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use photoshift_contracts::errors::OrchestrationError;
use photoshift_contracts::events::EventWriter;
use photoshift_contracts::jobs::{
    FailureKind, ImageRef, InvalidTransition, JobHandle, JobId, JobState, JobStatus,
    TransformationJob,
};
use photoshift_contracts::operations::CostTable;
use photoshift_contracts::runs::receipts::{build_receipt, write_receipt, JobReceipt};
use photoshift_contracts::runs::summary::{write_summary, SessionSummary};
use serde_json::{json, Map, Value};

use crate::batch::{BatchCoordinator, BatchRequest, BatchResult};
use crate::config::OrchestratorConfig;
use crate::fallback::FallbackSimulator;
use crate::ledger::{CreditLedger, LedgerError};
use crate::poller::{CancelFlag, Clock, JobStatusPoller, PollState, SystemClock};
use crate::provider::{ProviderSubmitRequest, RemoteStatus, SubmitOutcome, TransformationProvider};
use crate::request::{RequestBuilder, TransformationRequest};
use crate::storage::{FsImageStore, ImageStore};

struct JobEntry {
    job: TransformationJob,
    cancel: CancelFlag,
    charged: bool,
    poll_attempts: u32,
    provider_request: Map<String, Value>,
    provider_response: Map<String, Value>,
}

/// Owns every job of one session and the consumer's credit ledger.
///
/// All job state transitions happen here. Credits are committed exactly once,
/// when a job enters `Completed`; failed, timed-out and cancelled jobs never
/// touch the ledger.
pub struct Orchestrator {
    config: OrchestratorConfig,
    ledger: CreditLedger,
    builder: RequestBuilder,
    provider: Arc<dyn TransformationProvider>,
    clock: Arc<dyn Clock>,
    simulator: FallbackSimulator,
    events: EventWriter,
    jobs: Mutex<IndexMap<JobId, JobEntry>>,
    started_at: DateTime<Utc>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        ledger: CreditLedger,
        provider: Arc<dyn TransformationProvider>,
        events: EventWriter,
    ) -> Result<Self, OrchestrationError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let orchestrator = Self {
            simulator: FallbackSimulator::new(config.placeholder_base.clone()),
            builder: RequestBuilder::new(Arc::new(FsImageStore::new()), CostTable::default()),
            started_at: clock.now(),
            clock,
            config,
            ledger,
            provider,
            events,
            jobs: Mutex::new(IndexMap::new()),
        };
        orchestrator.emit(
            "session_started",
            json!({
                "provider": orchestrator.provider.name(),
                "credits_available": orchestrator.ledger.available(),
                "fallback_enabled": orchestrator.config.fallback_enabled,
                "poll_interval_s": orchestrator.config.poll_interval.as_secs_f64(),
                "max_poll_attempts": orchestrator.config.max_poll_attempts,
            }),
        )?;
        Ok(orchestrator)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.started_at = clock.now();
        self.clock = clock;
        self
    }

    pub fn with_image_store(mut self, store: Arc<dyn ImageStore>) -> Self {
        self.builder = RequestBuilder::new(store, self.builder.costs().clone());
        self
    }

    pub fn with_cost_table(mut self, costs: CostTable) -> Self {
        self.builder = RequestBuilder::new(self.builder.store().clone(), costs);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn costs(&self) -> &CostTable {
        self.builder.costs()
    }

    pub fn simulator(&self) -> &FallbackSimulator {
        &self.simulator
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    /// Validates, pre-checks credits, dispatches and drives one job to a
    /// terminal or timed-out state.
    ///
    /// Content-safety and authentication failures, and transient failures
    /// when fallback is disabled, are returned as errors; the job itself is
    /// still recorded as `Failed`. Remote failures reported while polling,
    /// time-outs and cancellations return `Ok` and are read back through
    /// [`Orchestrator::get_job_status`].
    pub fn submit_transformation(
        &self,
        request: &TransformationRequest,
    ) -> Result<JobId, OrchestrationError> {
        let job_id = self.enqueue_transformation(request)?;
        self.run_job(&job_id)?;
        Ok(job_id)
    }

    /// Registers a pending job without dispatching it.
    pub fn enqueue_transformation(
        &self,
        request: &TransformationRequest,
    ) -> Result<JobId, OrchestrationError> {
        let job = self.builder.build(request, self.clock.now())?;
        if !self.ledger.check_sufficient(job.cost) {
            let available = self.ledger.available();
            self.emit(
                "job_rejected",
                json!({
                    "operation": job.operation,
                    "cost": job.cost,
                    "credits_available": available,
                }),
            )?;
            return Err(OrchestrationError::InsufficientCredits {
                required: job.cost,
                available,
            });
        }
        self.register(job)
    }

    pub fn submit_batch(&self, batch: &BatchRequest) -> Result<BatchResult, OrchestrationError> {
        BatchCoordinator::new(self).run(batch)
    }

    pub fn get_job_status(&self, job_id: &JobId) -> Result<TransformationJob, OrchestrationError> {
        self.jobs()
            .get(job_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| OrchestrationError::UnknownJob(job_id.clone()))
    }

    /// Snapshot of every job in submission order.
    pub fn jobs_snapshot(&self) -> Vec<TransformationJob> {
        self.jobs().values().map(|entry| entry.job.clone()).collect()
    }

    /// Stops polling for a job. Pending jobs are cancelled immediately; a job
    /// that is being driven stops at its next tick. The remote job itself is
    /// left alone, and finished jobs are unaffected.
    pub fn cancel_job(&self, job_id: &JobId) -> Result<(), OrchestrationError> {
        let cancelled_pending = {
            let mut jobs = self.jobs();
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| OrchestrationError::UnknownJob(job_id.clone()))?;
            entry.cancel.cancel();
            if entry.job.status() == JobStatus::Pending {
                entry.job.transition(JobState::Cancelled, self.clock.now())?;
                true
            } else {
                false
            }
        };
        if cancelled_pending {
            self.emit(
                "job_cancelled",
                json!({"job_id": job_id, "poll_attempts": 0}),
            )?;
        }
        Ok(())
    }

    pub fn top_up_credits(&self, amount: u64) -> Result<u64, OrchestrationError> {
        let balance = self.ledger.top_up(amount)?;
        self.emit(
            "credits_topped_up",
            json!({"amount": amount, "credits_available": balance}),
        )?;
        Ok(balance)
    }

    /// Dispatches a pending job and drives it until it settles. Jobs that
    /// already left `Pending` are returned unchanged.
    pub fn run_job(&self, job_id: &JobId) -> Result<TransformationJob, OrchestrationError> {
        let (job, cancel) = {
            let now = self.clock.now();
            let mut jobs = self.jobs();
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| OrchestrationError::UnknownJob(job_id.clone()))?;
            if entry.job.status() != JobStatus::Pending {
                return Ok(entry.job.clone());
            }
            entry
                .job
                .transition(JobState::Processing { handle: None }, now)?;
            (entry.job.clone(), entry.cancel.clone())
        };
        self.emit(
            "job_processing",
            json!({"job_id": job_id, "provider": self.provider.name()}),
        )?;

        if !self.ledger.check_sufficient(job.cost) {
            let available = self.ledger.available();
            self.fail(
                job_id,
                FailureKind::InsufficientCredits,
                format!("{} credits required, {available} available", job.cost),
            )?;
            return Err(OrchestrationError::InsufficientCredits {
                required: job.cost,
                available,
            });
        }

        let loaded = self.builder.store().load(&job.source_image);
        if cancel.is_cancelled() {
            return self.settle_cancelled(job_id, 0);
        }
        let source_image = match loaded {
            Ok(bytes) => bytes,
            Err(err) => {
                let message = format!("source image '{}' cannot be read: {err:#}", job.source_image);
                self.fail(job_id, FailureKind::SourceUnavailable, message.clone())?;
                return Err(OrchestrationError::Validation(message));
            }
        };

        let request = ProviderSubmitRequest {
            job_id: job_id.clone(),
            prompt: job.prompt.clone(),
            operation: job.operation,
            source_ref: job.source_image.clone(),
            source_image,
        };
        let submission = self.provider.submit(&request);

        if cancel.is_cancelled() {
            return self.settle_cancelled(job_id, 0);
        }

        match submission {
            Ok(submission) => {
                self.update(job_id, |entry, _| {
                    entry.provider_request = submission.provider_request.clone();
                    entry.provider_response = submission.provider_response.clone();
                    Ok(())
                })?;
                match submission.outcome {
                    SubmitOutcome::Immediate(result) => self.complete(job_id, result, false),
                    SubmitOutcome::Processing(handle) => self.poll(job_id, handle, &cancel),
                }
            }
            Err(err) if err.kind.is_fallback_eligible() && self.config.fallback_enabled => {
                let result = self.simulator.simulate(&job);
                self.emit(
                    "fallback_simulated",
                    json!({
                        "job_id": job_id,
                        "cause": err.kind,
                        "error": err.message,
                        "result": result,
                    }),
                )?;
                self.complete(job_id, result, true)
            }
            Err(err) => {
                self.fail(job_id, err.kind.into(), err.to_string())?;
                Err(OrchestrationError::Provider {
                    job_id: job_id.clone(),
                    source: err,
                })
            }
        }
    }

    /// Checks back on a timed-out job with a single status query.
    pub fn recheck_job(&self, job_id: &JobId) -> Result<TransformationJob, OrchestrationError> {
        let (handle, attempts) = {
            let jobs = self.jobs();
            let entry = jobs
                .get(job_id)
                .ok_or_else(|| OrchestrationError::UnknownJob(job_id.clone()))?;
            match &entry.job.state {
                JobState::TimedOut { handle, attempts } => (handle.clone(), *attempts),
                _ => return Ok(entry.job.clone()),
            }
        };

        let status = self.provider.query_status(&handle);
        self.update(job_id, |entry, _| {
            entry.poll_attempts = attempts + 1;
            Ok(())
        })?;
        self.emit(
            "job_rechecked",
            json!({
                "job_id": job_id,
                "handle": handle,
                "status": match &status {
                    Ok(RemoteStatus::Processing) => "processing",
                    Ok(RemoteStatus::Completed(_)) => "completed",
                    Ok(RemoteStatus::Failed(_)) => "failed",
                    Err(_) => "error",
                },
            }),
        )?;
        match status {
            Ok(RemoteStatus::Completed(result)) => self.complete(job_id, result, false),
            Ok(RemoteStatus::Failed(message)) => self.fail(job_id, FailureKind::RemoteFailure, message),
            Ok(RemoteStatus::Processing) => self.get_job_status(job_id),
            Err(err) if err.kind.is_retryable() => self.get_job_status(job_id),
            Err(err) => Err(OrchestrationError::Provider {
                job_id: job_id.clone(),
                source: err,
            }),
        }
    }

    /// Writes the session summary and closes the journal for this session.
    pub fn finish(&self, summary_path: &Path) -> Result<SessionSummary, OrchestrationError> {
        let mut summary = SessionSummary {
            session_id: self.events.session_id().to_string(),
            started_at: self.started_at.to_rfc3339_opts(SecondsFormat::Micros, false),
            finished_at: self
                .clock
                .now()
                .to_rfc3339_opts(SecondsFormat::Micros, false),
            credits_spent: self.ledger.spent(),
            credits_available: self.ledger.available(),
            ..SessionSummary::default()
        };
        summary.tally(&self.jobs_snapshot());
        let mut extra = Map::new();
        extra.insert(
            "provider".to_string(),
            Value::String(self.provider.name().to_string()),
        );
        write_summary(summary_path, &summary, Some(&extra)).map_err(|source| {
            OrchestrationError::Artifact {
                path: summary_path.display().to_string(),
                source,
            }
        })?;
        self.emit(
            "session_finished",
            json!({"summary_path": summary_path.to_string_lossy()}),
        )?;
        Ok(summary)
    }

    pub(crate) fn builder(&self) -> &RequestBuilder {
        &self.builder
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn register(&self, job: TransformationJob) -> Result<JobId, OrchestrationError> {
        let job_id = job.id.clone();
        let payload = json!({
            "job_id": job_id,
            "operation": job.operation,
            "cost": job.cost,
            "source_image": job.source_image,
        });
        // An unjournaled job is never registered.
        self.emit("job_created", payload)?;
        self.jobs().insert(
            job_id.clone(),
            JobEntry {
                job,
                cancel: CancelFlag::new(),
                charged: false,
                poll_attempts: 0,
                provider_request: Map::new(),
                provider_response: Map::new(),
            },
        );
        Ok(job_id)
    }

    pub(crate) fn emit(&self, event_type: &str, payload: Value) -> Result<(), OrchestrationError> {
        self.events.emit(event_type, map_object(payload))?;
        Ok(())
    }

    fn poll(
        &self,
        job_id: &JobId,
        handle: JobHandle,
        cancel: &CancelFlag,
    ) -> Result<TransformationJob, OrchestrationError> {
        self.update(job_id, |entry, _| entry.job.attach_handle(handle.clone()))?;
        self.emit(
            "job_polling",
            json!({
                "job_id": job_id,
                "handle": handle,
                "interval_s": self.config.poll_interval.as_secs_f64(),
                "max_attempts": self.config.max_poll_attempts,
            }),
        )?;

        let poller = JobStatusPoller::new(
            self.provider.as_ref(),
            self.clock.as_ref(),
            self.config.poll_interval,
            self.config.max_poll_attempts,
        );
        let report = poller.run(&handle, cancel, |attempt, state| {
            self.emit(
                "poll_tick",
                json!({"job_id": job_id, "attempt": attempt, "state": poll_state_label(state)}),
            )
        })?;
        self.update(job_id, |entry, _| {
            entry.poll_attempts = report.attempts;
            Ok(())
        })?;

        match report.state {
            PollState::Completed(result) => self.complete(job_id, result, false),
            PollState::Failed { kind, message } => self.fail(job_id, kind, message),
            PollState::Cancelled => self.settle_cancelled(job_id, report.attempts),
            PollState::TimedOut | PollState::Processing => {
                let job = self.update(job_id, |entry, now| {
                    entry.job.transition(
                        JobState::TimedOut {
                            handle: handle.clone(),
                            attempts: report.attempts,
                        },
                        now,
                    )
                })?;
                self.emit(
                    "job_timed_out",
                    json!({
                        "job_id": job_id,
                        "handle": handle,
                        "poll_attempts": report.attempts,
                    }),
                )?;
                Ok(job)
            }
        }
    }

    /// Commits the job's cost and marks it completed, atomically with respect
    /// to other transitions of the same job.
    fn complete(
        &self,
        job_id: &JobId,
        result: ImageRef,
        simulated: bool,
    ) -> Result<TransformationJob, OrchestrationError> {
        let now = self.clock.now();
        let committed = {
            let mut jobs = self.jobs();
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| OrchestrationError::UnknownJob(job_id.clone()))?;
            let settling = matches!(
                entry.job.status(),
                JobStatus::Processing | JobStatus::TimedOut
            );
            if entry.charged || !settling {
                return Err(OrchestrationError::InvalidTransition(InvalidTransition {
                    from: entry.job.status(),
                    to: JobStatus::Completed,
                }));
            }
            match self.ledger.commit(entry.job.cost) {
                Ok(balance) => {
                    entry.job.transition(
                        JobState::Completed {
                            result: result.clone(),
                            simulated,
                        },
                        now,
                    )?;
                    entry.charged = true;
                    Ok((
                        balance,
                        JobReceipt {
                            job: entry.job.clone(),
                            provider: self.provider.name().to_string(),
                            credits_charged: entry.job.cost,
                            balance_after: balance,
                            poll_attempts: entry.poll_attempts,
                        },
                        entry.provider_request.clone(),
                        entry.provider_response.clone(),
                    ))
                }
                Err(err) => Err(err),
            }
        };

        let (balance, receipt, provider_request, provider_response) = match committed {
            Ok(parts) => parts,
            Err(LedgerError::InsufficientCredits {
                required,
                available,
            }) => {
                self.fail(
                    job_id,
                    FailureKind::InsufficientCredits,
                    format!("{required} credits required at completion, {available} available"),
                )?;
                return Err(OrchestrationError::InsufficientCredits {
                    required,
                    available,
                });
            }
            Err(err) => return Err(err.into()),
        };

        self.emit(
            "credits_committed",
            json!({
                "job_id": job_id,
                "cost": receipt.credits_charged,
                "credits_available": balance,
            }),
        )?;
        let receipt_path = self.write_job_receipt(&receipt, &provider_request, &provider_response)?;
        self.emit(
            "job_completed",
            json!({
                "job_id": job_id,
                "result": result,
                "simulated": simulated,
                "poll_attempts": receipt.poll_attempts,
                "receipt_path": receipt_path.map(|path| path.to_string_lossy().to_string()),
            }),
        )?;
        Ok(receipt.job)
    }

    fn fail(
        &self,
        job_id: &JobId,
        kind: FailureKind,
        message: String,
    ) -> Result<TransformationJob, OrchestrationError> {
        let job = self.update(job_id, |entry, now| {
            entry.job.transition(
                JobState::Failed {
                    kind,
                    message: message.clone(),
                },
                now,
            )
        })?;
        self.emit(
            "job_failed",
            json!({"job_id": job_id, "kind": kind, "error": message}),
        )?;
        Ok(job)
    }

    fn settle_cancelled(
        &self,
        job_id: &JobId,
        attempts: u32,
    ) -> Result<TransformationJob, OrchestrationError> {
        let job = self.update(job_id, |entry, now| {
            entry.job.transition(JobState::Cancelled, now)
        })?;
        self.emit(
            "job_cancelled",
            json!({"job_id": job_id, "poll_attempts": attempts}),
        )?;
        Ok(job)
    }

    fn write_job_receipt(
        &self,
        receipt: &JobReceipt,
        provider_request: &Map<String, Value>,
        provider_response: &Map<String, Value>,
    ) -> Result<Option<PathBuf>, OrchestrationError> {
        let Some(dir) = &self.config.receipts_dir else {
            return Ok(None);
        };
        let path = dir.join(format!("receipt-{}.json", receipt.job.id));
        let payload = build_receipt(receipt, provider_request, provider_response);
        write_receipt(&path, &payload).map_err(|source| OrchestrationError::Artifact {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Some(path))
    }

    /// Applies `change` to one job under the registry lock and returns the
    /// resulting snapshot.
    fn update(
        &self,
        job_id: &JobId,
        change: impl FnOnce(&mut JobEntry, DateTime<Utc>) -> Result<(), InvalidTransition>,
    ) -> Result<TransformationJob, OrchestrationError> {
        let now = self.clock.now();
        let mut jobs = self.jobs();
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| OrchestrationError::UnknownJob(job_id.clone()))?;
        change(entry, now)?;
        Ok(entry.job.clone())
    }

    fn jobs(&self) -> MutexGuard<'_, IndexMap<JobId, JobEntry>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn poll_state_label(state: &PollState) -> &'static str {
    match state {
        PollState::Processing => "processing",
        PollState::Completed(_) => "completed",
        PollState::Failed { .. } => "failed",
        PollState::TimedOut => "timed_out",
        PollState::Cancelled => "cancelled",
    }
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
