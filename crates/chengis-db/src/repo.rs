//! Repository traits and PostgreSQL implementations.

pub mod agent;
pub mod approval;
pub mod build;
pub mod event;
pub mod queue;
pub mod secrets;

pub use agent::AgentRepo;
pub use approval::ApprovalRepo;
pub use build::BuildRepo;
pub use event::EventRepo;
pub use queue::{NewQueueItem, QueueRepo, RequeueSummary};
pub use secrets::{SecretRepo, SecretRow};
