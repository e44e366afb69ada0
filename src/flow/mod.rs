//! Logical flows, the per-tenant flow registry, and the modification
//! task state machine.

pub mod database;
pub mod group;
pub mod selector;
pub mod task;
pub mod vflow;

pub use database::{FlowDatabase, FlowDatabaseStats};
pub use group::FlowGroupId;
pub use selector::FlowSelector;
pub use task::{FlowModHandle, FlowModResult, TaskState};
pub use vflow::VirtualFlow;
