//! Content-addressed model store abstraction.
//!
//! The scheduler loads checkpoints and adapters through the `ModelStore`
//! trait; the download manager registers finished artifacts through it.

mod fs_store;
mod types;

pub use fs_store::FsModelStore;
pub use types::*;
