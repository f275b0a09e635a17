//! OCI hooks: discovery, activation conditions and execution.

pub mod condition;
pub mod descriptor;
pub mod orchestrator;
pub mod registry;
pub mod state;

pub use condition::{all_match, Condition, ConditionContext, Pattern};
pub use descriptor::{HookCommand, HookDescriptor, Stage};
pub use orchestrator::{HookError, HookOrchestrator, PRE_LAUNCH_STAGES};
pub use registry::HookRegistry;
pub use state::{ContainerStatus, State};
