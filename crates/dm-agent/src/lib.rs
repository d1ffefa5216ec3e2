//! Agent coordination: persistent WebSocket sessions to remote agents with
//! correlated request/response, lifecycle tracking, and self-update support.

pub mod coordinator;
pub mod pending;
pub mod protocol;

pub use coordinator::{AgentCoordinator, AgentDomainEvent, RegisterRequest};
pub use pending::PendingCommands;
pub use protocol::{AgentFrame, CommandResult, CommandStatus, ServerFrame};
