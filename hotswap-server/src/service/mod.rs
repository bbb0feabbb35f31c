//! Service layer
//!
//! Services contain the building blocks the workflow stages are made of:
//! running steps, owning processes, tracking upstreams and recording state.
//!
//! Step execution and state reporting are trait-based so stages can be
//! tested with fakes.

pub mod process;
pub mod registry;
pub mod state;
pub mod step;

// Re-export traits
pub use state::StateSink;
pub use step::StepExecutor;

// Re-export implementations
pub use process::{ManagedProcess, ProcessHandle, ProcessState, ProcessTable};
pub use registry::{Instance, RegistryError, UpstreamRegistry};
pub use state::InMemoryStateSink;
pub use step::{StepContext, StepError, StepRunner};
