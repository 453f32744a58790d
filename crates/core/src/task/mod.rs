//! Generation tasks and their persistence.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteTaskStore;
pub use store::{TaskStore, TaskStoreError};
pub use types::{AdapterMode, AdapterSpec, GenerationRequest, Task, TaskStatus};
