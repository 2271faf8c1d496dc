//! Task execution: the per-attempt state machine, the scoped resource
//! registry used for cooperative cancellation, and the task thread itself.

mod environment;
mod invokable;
mod registry;
mod state;
mod task;

pub use environment::*;
pub use invokable::*;
pub use registry::*;
pub use state::*;
pub use task::*;

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod state_tests;

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod registry_tests;

#[cfg(test)]
#[path = "tests/task_tests.rs"]
mod task_tests;
