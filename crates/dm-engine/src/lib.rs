//! Docker/Podman Engine API access: a thin HTTP client, the layered image
//! pull tracker, and the monitor that owns one client per host.

pub mod client;
pub mod health;
pub mod monitor;
pub mod pull;
pub mod types;

pub use client::EngineClient;
pub use health::{DebouncedHealth, HealthStatus};
pub use monitor::{ContainerInfo, Monitor};
pub use pull::{PullSnapshot, pull_with_progress};
