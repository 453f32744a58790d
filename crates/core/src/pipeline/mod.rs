//! Pipeline resource manager.
//!
//! Owns the single execution context: the loaded checkpoint and the
//! attached adapters. Only the task executor mutates it.

mod manager;
mod sqlite_store;
mod types;

pub use manager::{PipelineManager, PipelineStatusHandle};
pub use sqlite_store::SqlitePipelineStore;
pub use types::*;
