//! Run lifecycle, persistence and waiting.

mod config;
mod memory_store;
mod runner;
#[cfg(feature = "sqlite")]
mod sqlite_store;
pub mod store;
mod wait;

pub use config::RunnerConfig;
pub use memory_store::MemoryExecutionStore;
pub use runner::{Runner, RunnerBuilder, RunnerError};
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteExecutionStore;
pub use store::{
    ExecutionStore, RunId, RunInputs, RunRecord, RunState, StoreError, TaskRun,
};
pub use wait::WaitContext;
