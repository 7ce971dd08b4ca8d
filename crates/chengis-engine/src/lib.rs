//! Build execution and distribution engine.
//!
//! Braids together pipeline interpretation (stages, parallel blocks, gates,
//! matrix fan-out), the master/worker dispatch plane (durable queue, circuit
//! breaking, orphan recovery, leader election), the event bus feeding live
//! streams, and the secret-aware build runner.

pub mod approval;
pub mod artifact;
pub mod breaker;
pub mod bus;
pub mod client;
pub mod dispatcher;
pub mod leader;
pub mod matrix;
pub mod notify;
pub mod orphan;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod registry;
pub mod runner;
pub mod scm;

pub use approval::ApprovalManager;
pub use breaker::{BreakerRegistry, BreakerState};
pub use bus::EventBus;
pub use client::AgentClient;
pub use dispatcher::{DispatchDecision, Dispatcher};
pub use leader::{LeaderHandle, start_leader_loop};
pub use orphan::OrphanMonitor;
pub use pipeline::PipelineExecutor;
pub use pool::BuildWorkerPool;
pub use processor::QueueProcessor;
pub use registry::AgentRegistry;
pub use runner::BuildRunner;
