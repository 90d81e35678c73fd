//! # flotilla-engine
//!
//! Coordination runtime on top of `flotilla-store`.
//!
//! - **Coordinator**: the single facade over events, cursors, leases,
//!   checkpoints and agents; owns the background tasks
//! - **Recovery**: plans and performs checkpoint resumes
//! - **Supervisor**: one actor per agent, heartbeat checks, bounded respawn
//! - **Sweeper** / **auto checkpoints**: periodic maintenance loops

#![deny(unsafe_code)]

pub mod auto_checkpoint;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod recovery;
pub mod supervisor;
pub mod sweeper;

pub use auto_checkpoint::SnapshotSource;
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::EngineError;
pub use health::{HealthStatus, SystemHealth};
pub use recovery::{RecoveryEngine, RecoveryPlan, RecoveryReport, ResumeOptions, ResumeTarget};
pub use supervisor::{
    LaunchSpec, LaunchedWorker, ProcessLauncher, Supervisor, SupervisorConfig, WorkerExit, WorkerHandle,
    WorkerLauncher,
};
