use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jobs::{InvalidTransition, JobId};

/// Cause classification for a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    ContentSafetyRejected,
    AuthenticationFailed,
    RateLimited,
    Unavailable,
    Unknown,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContentSafetyRejected => "content_safety_rejected",
            Self::AuthenticationFailed => "authentication_failed",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Unknown => "unknown",
        }
    }

    /// Only transient failures may be answered with a simulated result.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Unavailable)
    }

    /// Whether a caller may reasonably try the same request again later.
    pub fn is_retryable(&self) -> bool {
        self.is_fallback_eligible()
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{provider} {kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub provider: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(
        kind: ProviderErrorKind,
        provider: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// Flat classification of [`OrchestrationError`] for boundary layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InsufficientCredits,
    InvalidAmount,
    Provider(ProviderErrorKind),
    UnknownJob,
    InvalidTransition,
    Journal,
    Artifact,
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("invalid transformation request: {0}")]
    Validation(String),

    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: u64, available: u64 },

    #[error("top-up amount must be positive, got {0}")]
    InvalidAmount(u64),

    #[error("job {job_id} failed: {source}")]
    Provider {
        job_id: JobId,
        #[source]
        source: ProviderError,
    },

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("event journal write failed: {0:#}")]
    Journal(#[from] anyhow::Error),

    /// A receipt or summary file could not be written.
    #[error("failed to write {path}: {source:#}")]
    Artifact { path: String, source: anyhow::Error },
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::InsufficientCredits { .. } => ErrorKind::InsufficientCredits,
            Self::InvalidAmount(_) => ErrorKind::InvalidAmount,
            Self::Provider { source, .. } => ErrorKind::Provider(source.kind),
            Self::UnknownJob(_) => ErrorKind::UnknownJob,
            Self::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Self::Journal(_) => ErrorKind::Journal,
            Self::Artifact { .. } => ErrorKind::Artifact,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { source, .. } => source.kind.is_retryable(),
            _ => false,
        }
    }
}
