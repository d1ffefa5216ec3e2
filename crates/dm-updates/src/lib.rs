//! Container update pipeline: checker, direct and agent execution paths,
//! label subtraction, and the pending-update registry.

pub mod checker;
pub mod executor;
pub mod labels;
pub mod pending;
pub mod types;

pub use checker::{CheckStats, UpdateChecker};
pub use executor::UpdateExecutor;
pub use pending::{PendingUpdates, UpdateCompletion};
pub use types::{ProgressCallback, UpdateContext, UpdateResult, noop_progress};
