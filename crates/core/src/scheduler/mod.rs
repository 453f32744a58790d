//! Generation task scheduler.
//!
//! The coordinator accepts submissions, cancellations and promotions and
//! owns the task queue. A single executor drains the queue: it reconciles
//! the pipeline for each task, runs the generator and records the outcome.
//!
//! # Example
//!
//! ```rust,ignore
//! let coordinator = SchedulerCoordinator::new(config, store, models, pipeline_store, generator, progress);
//! coordinator.start().await;
//!
//! let receipt = coordinator.submit(GenerationRequest::new("A")).await?;
//! let mut updates = coordinator.subscribe().await;
//! while let Some(snapshot) = updates.next().await {
//!     println!("{} pending", snapshot.queue_length);
//! }
//! ```

mod coordinator;
mod executor;
mod types;

pub use coordinator::SchedulerCoordinator;
pub use types::*;
