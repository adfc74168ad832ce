use photoshift_contracts::errors::{ErrorKind, OrchestrationError};
use photoshift_contracts::jobs::{FailureKind, ImageRef, JobHandle, JobId, JobState, TransformationJob};
use photoshift_contracts::operations::OperationKind;
use serde_json::json;
use uuid::Uuid;

use crate::orchestrator::Orchestrator;
use crate::request::TransformationRequest;

/// Several transformations submitted together, usually over one source image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRequest {
    pub items: Vec<TransformationRequest>,
}

impl BatchRequest {
    pub fn new(items: Vec<TransformationRequest>) -> Self {
        Self { items }
    }

    /// One request per `(operation, prompt)` pair, all against `source_image`.
    pub fn for_image(
        source_image: &str,
        edits: impl IntoIterator<Item = (OperationKind, String)>,
    ) -> Self {
        Self {
            items: edits
                .into_iter()
                .map(|(operation, prompt)| {
                    TransformationRequest::new(source_image, prompt, operation)
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed {
        job_id: JobId,
        result: ImageRef,
        simulated: bool,
    },
    Failed {
        job_id: JobId,
        kind: FailureKind,
        message: String,
    },
    TimedOut {
        job_id: JobId,
        handle: JobHandle,
    },
    Cancelled {
        job_id: JobId,
    },
}

impl BatchOutcome {
    fn from_job(job: &TransformationJob) -> Self {
        let job_id = job.id.clone();
        match &job.state {
            JobState::Completed { result, simulated } => Self::Completed {
                job_id,
                result: result.clone(),
                simulated: *simulated,
            },
            JobState::Failed { kind, message } => Self::Failed {
                job_id,
                kind: *kind,
                message: message.clone(),
            },
            JobState::TimedOut { handle, .. } => Self::TimedOut {
                job_id,
                handle: handle.clone(),
            },
            JobState::Cancelled => Self::Cancelled { job_id },
            JobState::Pending | JobState::Processing { .. } => Self::Failed {
                job_id,
                kind: FailureKind::ProviderUnknown,
                message: format!("job stopped while {}", job.status()),
            },
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::TimedOut { job_id, .. }
            | Self::Cancelled { job_id } => job_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::TimedOut { .. } => "timed_out",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub batch_id: String,
    /// One entry per request, in request order.
    pub outcomes: Vec<BatchOutcome>,
    pub credits_spent: u64,
}

impl BatchResult {
    fn count(&self, label: &str) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.label() == label)
            .count()
    }

    pub fn completed(&self) -> usize {
        self.count("completed")
    }

    pub fn failed(&self) -> usize {
        self.count("failed")
    }

    pub fn timed_out(&self) -> usize {
        self.count("timed_out")
    }

    pub fn cancelled(&self) -> usize {
        self.count("cancelled")
    }

    pub fn all_completed(&self) -> bool {
        self.completed() == self.outcomes.len()
    }
}

/// Runs a batch against one orchestrator.
///
/// Every request is validated and the aggregate cost is checked against the
/// ledger before anything is dispatched; either check failing rejects the
/// whole batch with no jobs created. Accepted jobs then run in request order
/// and each one settles on its own, so a batch may end partially complete.
pub struct BatchCoordinator<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> BatchCoordinator<'a> {
    pub fn new(orchestrator: &'a Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn run(&self, batch: &BatchRequest) -> Result<BatchResult, OrchestrationError> {
        let batch_id = Uuid::new_v4().to_string();
        let now = self.orchestrator.now();

        let mut jobs = Vec::with_capacity(batch.len());
        for (index, request) in batch.items.iter().enumerate() {
            match self.orchestrator.builder().build(request, now) {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    self.reject(&batch_id, &format!("item {index}: {err}"))?;
                    return Err(match err {
                        OrchestrationError::Validation(message) => {
                            OrchestrationError::Validation(format!("batch item {index}: {message}"))
                        }
                        other => other,
                    });
                }
            }
        }

        let required = jobs
            .iter()
            .fold(0u64, |total, job| total.saturating_add(job.cost));
        let ledger = self.orchestrator.ledger();
        if !ledger.check_sufficient(required) {
            let available = ledger.available();
            self.reject(
                &batch_id,
                &format!("{required} credits required, {available} available"),
            )?;
            return Err(OrchestrationError::InsufficientCredits {
                required,
                available,
            });
        }

        let spent_before = ledger.spent();
        let mut job_ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            job_ids.push(self.orchestrator.register(job)?);
        }
        self.orchestrator.emit(
            "batch_started",
            json!({
                "batch_id": batch_id,
                "jobs": job_ids,
                "credits_required": required,
            }),
        )?;

        let mut outcomes = Vec::with_capacity(job_ids.len());
        for job_id in &job_ids {
            match self.orchestrator.run_job(job_id) {
                Ok(job) => outcomes.push(BatchOutcome::from_job(&job)),
                Err(err) if err.kind() == ErrorKind::Journal => return Err(err),
                Err(_) => {
                    let job = self.orchestrator.get_job_status(job_id)?;
                    outcomes.push(BatchOutcome::from_job(&job));
                }
            }
        }

        let result = BatchResult {
            batch_id,
            outcomes,
            credits_spent: ledger.spent().saturating_sub(spent_before),
        };
        self.orchestrator.emit(
            "batch_finished",
            json!({
                "batch_id": result.batch_id,
                "completed": result.completed(),
                "failed": result.failed(),
                "timed_out": result.timed_out(),
                "cancelled": result.cancelled(),
                "credits_spent": result.credits_spent,
            }),
        )?;
        Ok(result)
    }

    fn reject(&self, batch_id: &str, reason: &str) -> Result<(), OrchestrationError> {
        self.orchestrator.emit(
            "batch_rejected",
            json!({"batch_id": batch_id, "reason": reason}),
        )
    }
}
