use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::ProviderErrorKind;
use crate::operations::OperationKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path or URL of an image, either a source photo or a produced result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_remote(&self) -> bool {
        let lowered = self.0.trim().to_ascii_lowercase();
        lowered.starts_with("http://") || lowered.starts_with("https://")
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider-side identifier for a job that is still processing remotely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition again. `TimedOut` is not terminal:
    /// a later check-back may still resolve it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ContentSafetyRejected,
    AuthenticationFailed,
    RateLimited,
    Unavailable,
    ProviderUnknown,
    /// The provider accepted the job but later reported it failed.
    RemoteFailure,
    /// The job completed but the ledger could no longer cover its cost.
    InsufficientCredits,
    SourceUnavailable,
}

impl From<ProviderErrorKind> for FailureKind {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::ContentSafetyRejected => Self::ContentSafetyRejected,
            ProviderErrorKind::AuthenticationFailed => Self::AuthenticationFailed,
            ProviderErrorKind::RateLimited => Self::RateLimited,
            ProviderErrorKind::Unavailable => Self::Unavailable,
            ProviderErrorKind::Unknown => Self::ProviderUnknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing {
        handle: Option<JobHandle>,
    },
    Completed {
        result: ImageRef,
        simulated: bool,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
    TimedOut {
        handle: JobHandle,
        attempts: u32,
    },
    Cancelled,
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Pending => JobStatus::Pending,
            Self::Processing { .. } => JobStatus::Processing,
            Self::Completed { .. } => JobStatus::Completed,
            Self::Failed { .. } => JobStatus::Failed,
            Self::TimedOut { .. } => JobStatus::TimedOut,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("job cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationJob {
    pub id: JobId,
    pub source_image: ImageRef,
    pub prompt: String,
    pub operation: OperationKind,
    pub cost: u64,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    /// Set once the job reaches a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransformationJob {
    pub fn new(
        source_image: ImageRef,
        prompt: impl Into<String>,
        operation: OperationKind,
        cost: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::generate(),
            source_image,
            prompt: prompt.into(),
            operation,
            cost,
            state: JobState::Pending,
            created_at,
            completed_at: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self.state, JobState::Completed { simulated: true, .. })
    }

    pub fn result_ref(&self) -> Option<&ImageRef> {
        match &self.state {
            JobState::Completed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<&JobHandle> {
        match &self.state {
            JobState::Processing { handle } => handle.as_ref(),
            JobState::TimedOut { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// Moves the job forward. Transitions are monotonic:
    /// `Pending -> Processing -> {Completed | Failed | TimedOut | Cancelled}`,
    /// a pending job may be cancelled or rejected before dispatch, and a
    /// timed-out job may only resolve to `Completed` or `Failed`.
    pub fn transition(
        &mut self,
        next: JobState,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        let from = self.status();
        let to = next.status();
        let allowed = match from {
            JobStatus::Pending => matches!(
                to,
                JobStatus::Processing | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Processing => matches!(
                to,
                JobStatus::Completed
                    | JobStatus::Failed
                    | JobStatus::TimedOut
                    | JobStatus::Cancelled
            ),
            JobStatus::TimedOut => matches!(to, JobStatus::Completed | JobStatus::Failed),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        };
        if !allowed {
            return Err(InvalidTransition { from, to });
        }
        self.state = next;
        if to.is_terminal() {
            self.completed_at = Some(at);
        }
        Ok(())
    }

    /// Records the provider handle on a processing job without changing its status.
    pub fn attach_handle(&mut self, handle: JobHandle) -> Result<(), InvalidTransition> {
        match &mut self.state {
            JobState::Processing { handle: slot } => {
                *slot = Some(handle);
                Ok(())
            }
            other => Err(InvalidTransition {
                from: other.status(),
                to: JobStatus::Processing,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::{json, Value};

    use super::{
        FailureKind, ImageRef, JobHandle, JobState, JobStatus, TransformationJob,
    };
    use crate::operations::OperationKind;

    fn pending_job() -> TransformationJob {
        TransformationJob::new(
            ImageRef::new("/photos/chair.png"),
            "studio lighting",
            OperationKind::EnhanceLighting,
            1,
            Utc::now(),
        )
    }

    #[test]
    fn new_jobs_start_pending_with_unique_ids() {
        let first = pending_job();
        let second = pending_job();
        assert_eq!(first.status(), JobStatus::Pending);
        assert_ne!(first.id, second.id);
        assert!(first.result_ref().is_none());
        assert!(!first.is_simulated());
    }

    #[test]
    fn lifecycle_moves_forward_and_stamps_completion() {
        let mut job = pending_job();
        job.transition(JobState::Processing { handle: None }, Utc::now())
            .unwrap();
        job.attach_handle(JobHandle::new("pred-1")).unwrap();
        assert_eq!(job.handle().map(JobHandle::as_str), Some("pred-1"));
        assert!(job.completed_at.is_none());

        job.transition(
            JobState::Completed {
                result: ImageRef::new("https://cdn.example/out.png"),
                simulated: true,
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.is_simulated());
        assert!(job.completed_at.is_some());
        assert_eq!(
            job.result_ref().map(ImageRef::as_str),
            Some("https://cdn.example/out.png")
        );
    }

    #[test]
    fn backward_and_terminal_transitions_are_rejected() {
        let mut job = pending_job();
        let err = job
            .transition(
                JobState::Completed {
                    result: ImageRef::new("x"),
                    simulated: false,
                },
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err.from, JobStatus::Pending);
        assert_eq!(err.to, JobStatus::Completed);

        job.transition(JobState::Processing { handle: None }, Utc::now())
            .unwrap();
        job.transition(
            JobState::Failed {
                kind: FailureKind::RemoteFailure,
                message: "boom".to_string(),
            },
            Utc::now(),
        )
        .unwrap();
        assert!(job
            .transition(JobState::Processing { handle: None }, Utc::now())
            .is_err());
        assert!(job.transition(JobState::Cancelled, Utc::now()).is_err());
    }

    #[test]
    fn timed_out_jobs_can_only_resolve() {
        let mut job = pending_job();
        job.transition(JobState::Processing { handle: None }, Utc::now())
            .unwrap();
        job.transition(
            JobState::TimedOut {
                handle: JobHandle::new("pred-9"),
                attempts: 30,
            },
            Utc::now(),
        )
        .unwrap();
        assert!(!job.status().is_terminal());
        assert!(job.completed_at.is_none());
        assert!(job.transition(JobState::Cancelled, Utc::now()).is_err());
        assert!(job
            .transition(JobState::Processing { handle: None }, Utc::now())
            .is_err());
        job.transition(
            JobState::Completed {
                result: ImageRef::new("late.png"),
                simulated: false,
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
    }

    #[test]
    fn state_serializes_with_status_tag() -> anyhow::Result<()> {
        let state = JobState::TimedOut {
            handle: JobHandle::new("pred-3"),
            attempts: 5,
        };
        let value = serde_json::to_value(&state)?;
        assert_eq!(
            value,
            json!({"status": "timed_out", "handle": "pred-3", "attempts": 5})
        );
        let job = pending_job();
        let value = serde_json::to_value(&job)?;
        assert_eq!(value["state"]["status"], Value::String("pending".to_string()));
        assert_eq!(value["operation"], json!("enhance-lighting"));
        Ok(())
    }

    #[test]
    fn image_ref_detects_remote_urls() {
        assert!(ImageRef::new("https://cdn.example/a.png").is_remote());
        assert!(ImageRef::new("HTTP://cdn.example/a.png").is_remote());
        assert!(!ImageRef::new("/tmp/a.png").is_remote());
    }
}
