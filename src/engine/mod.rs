//! Resumable phase engine: step registry, durable progress, and the driver loop.
//!
//! Nothing outside this module touches the progress record directly.
mod context;
mod driver;
mod error;
mod phase;
mod registry;
mod store;

pub use context::StepContext;
pub use driver::{Engine, PhaseOutcome, RunOptions, WorkflowEvent, WorkflowState};
pub use error::WorkflowError;
pub use phase::Phase;
pub use registry::{Step, StepAction, StepInfo, StepOutput, StepRegistry};
pub use store::{
    Artifacts, HistoryEntry, HistoryOutcome, ProgressRecord, ProgressStore, RebootMarker,
};
