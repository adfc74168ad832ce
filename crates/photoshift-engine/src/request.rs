use std::sync::Arc;

use chrono::{DateTime, Utc};
use photoshift_contracts::errors::OrchestrationError;
use photoshift_contracts::jobs::{ImageRef, TransformationJob};
use photoshift_contracts::operations::{CostTable, OperationKind};

use crate::storage::ImageStore;

/// Caller-supplied description of one transformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformationRequest {
    pub source_image: ImageRef,
    pub prompt: String,
    pub operation: OperationKind,
}

impl TransformationRequest {
    pub fn new(
        source_image: impl Into<String>,
        prompt: impl Into<String>,
        operation: OperationKind,
    ) -> Self {
        Self {
            source_image: ImageRef::new(source_image),
            prompt: prompt.into(),
            operation,
        }
    }
}

/// Validates requests and turns them into pending jobs priced from the cost table.
pub struct RequestBuilder {
    store: Arc<dyn ImageStore>,
    costs: CostTable,
}

impl RequestBuilder {
    pub fn new(store: Arc<dyn ImageStore>, costs: CostTable) -> Self {
        Self { store, costs }
    }

    pub fn costs(&self) -> &CostTable {
        &self.costs
    }

    pub fn store(&self) -> &Arc<dyn ImageStore> {
        &self.store
    }

    pub fn cost_of(&self, operation: OperationKind) -> u64 {
        self.costs.cost(operation)
    }

    pub fn build(
        &self,
        request: &TransformationRequest,
        now: DateTime<Utc>,
    ) -> Result<TransformationJob, OrchestrationError> {
        let source = request.source_image.as_str().trim();
        if source.is_empty() {
            return Err(OrchestrationError::Validation(
                "source image reference is empty".to_string(),
            ));
        }
        let source_image = ImageRef::new(source);
        if !self.store.is_resolvable(&source_image) {
            return Err(OrchestrationError::Validation(format!(
                "source image '{source}' cannot be resolved"
            )));
        }
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(OrchestrationError::Validation(
                "prompt is empty".to_string(),
            ));
        }
        Ok(TransformationJob::new(
            source_image,
            prompt,
            request.operation,
            self.cost_of(request.operation),
            now,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use photoshift_contracts::errors::{ErrorKind, OrchestrationError};
    use photoshift_contracts::jobs::JobStatus;
    use photoshift_contracts::operations::{CostTable, OperationKind};

    use super::{RequestBuilder, TransformationRequest};
    use crate::testing::MemoryImageStore;

    fn builder() -> RequestBuilder {
        RequestBuilder::new(
            Arc::new(MemoryImageStore::with(&["chair.png"])),
            CostTable::default(),
        )
    }

    #[test]
    fn valid_request_builds_pending_job_with_catalog_cost() -> Result<(), OrchestrationError> {
        let job = builder().build(
            &TransformationRequest::new(
                " chair.png ",
                "  warm evening light ",
                OperationKind::LifestyleContext,
            ),
            Utc::now(),
        )?;
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.cost, 2);
        assert_eq!(job.prompt, "warm evening light");
        assert_eq!(job.source_image.as_str(), "chair.png");
        assert!(!job.id.as_str().is_empty());
        Ok(())
    }

    #[test]
    fn empty_source_is_rejected() {
        let err = builder()
            .build(
                &TransformationRequest::new("  ", "x", OperationKind::RemoveBackground),
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn unresolvable_source_is_rejected() {
        let err = builder()
            .build(
                &TransformationRequest::new("sofa.png", "x", OperationKind::RemoveBackground),
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("sofa.png"));
    }

    #[test]
    fn whitespace_prompt_is_rejected() {
        let err = builder()
            .build(
                &TransformationRequest::new("chair.png", " \n\t ", OperationKind::CustomPrompt),
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn cost_overrides_flow_into_jobs() -> Result<(), OrchestrationError> {
        let mut costs = CostTable::default();
        costs.set(OperationKind::RemoveBackground, 4);
        let builder = RequestBuilder::new(Arc::new(MemoryImageStore::with(&["chair.png"])), costs);
        let job = builder.build(
            &TransformationRequest::new("chair.png", "cut out", OperationKind::RemoveBackground),
            Utc::now(),
        )?;
        assert_eq!(job.cost, 4);
        Ok(())
    }
}
