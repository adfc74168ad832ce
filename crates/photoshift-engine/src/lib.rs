//! Credit-metered orchestration of remote image transformations.
//!
//! [`Orchestrator`] is the entry point: it validates requests, pre-checks the
//! [`CreditLedger`], dispatches to a [`TransformationProvider`], polls
//! long-running jobs and commits credits once a job completes.

pub mod batch;
pub mod config;
pub mod fallback;
pub mod ledger;
pub mod orchestrator;
pub mod poller;
pub mod provider;
pub mod request;
pub mod storage;

#[cfg(test)]
mod testing;

pub use batch::{BatchCoordinator, BatchOutcome, BatchRequest, BatchResult};
pub use config::{load_cost_table, OrchestratorConfig};
pub use fallback::FallbackSimulator;
pub use ledger::{CreditLedger, LedgerError};
pub use orchestrator::Orchestrator;
pub use poller::{CancelFlag, Clock, JobStatusPoller, PollMachine, PollState, SystemClock};
pub use provider::{
    default_provider_registry, DryrunProvider, ProviderRegistry, RemoteStatus, ReplicateProvider,
    SubmitOutcome, TransformationProvider,
};
pub use request::{RequestBuilder, TransformationRequest};
pub use storage::{FsImageStore, ImageBytes, ImageStore};
