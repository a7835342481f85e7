pub mod manager;
pub mod models;
pub mod naming;
pub mod ports;
pub mod specs;
pub mod waiter;

pub use manager::SandboxManager;
pub use models::{
    ExposedUrl, SandboxInfo, SandboxPage, SandboxSpecInfo, SandboxSpecPage, SandboxStatus,
};
pub use specs::SandboxSpecService;
pub use waiter::{ReadinessWaiter, WaitError};
