//! Job execution and log streaming core for the Decode learning sandbox.
//!
//! The crate launches the transformation tool per (user, lesson) workspace,
//! tracks asynchronous runs as jobs, streams their merged output to a single
//! consumer, and gates request admission. HTTP wiring lives in `decode-server`.

pub mod admission;
pub mod config;
pub mod jobs;
pub mod pool;
pub mod publisher;
pub mod runner;
mod streamer;
#[cfg(test)]
mod testing;
pub mod warehouse;
pub mod workspace;

pub use admission::{AdmissionError, ConcurrencyLimiter, InflightPermit, RateLimiter};
pub use config::{ConfigError, CoreConfig};
pub use jobs::{Job, JobEvent, JobFailure, JobId, JobKind, JobRegistry, JobSummary};
pub use pool::{ConnectionPool, Connector, PoolError, PooledConnection};
pub use publisher::{LogStreamPublisher, StreamEvent};
pub use runner::{ModelSelection, ProcessRunner, RunError, RunReport, SeedLaunch, SeedOutcome};
pub use warehouse::{SqliteConnector, Warehouse, WarehouseError};
pub use workspace::{schema_for, Lesson, Workspace, WorkspaceError, WorkspaceManager};
