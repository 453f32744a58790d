//! In-memory ordered queue of pending generation tasks.
//!
//! Pending tasks are kept in execution order: promotion time descending,
//! then creation time ascending. Within a tier of equal promotion time a
//! task is placed right after the last task targeting the same checkpoint,
//! so consecutive tasks on one checkpoint run back to back.
//!
//! The queue holds no lock of its own; the scheduler coordinator owns it
//! and serializes every mutation.

mod types;

pub use types::{QueueError, QueuedTaskView};

use chrono::{DateTime, Utc};

use crate::batch::{BatchItem, BatchResult};
use crate::task::Task;

/// Ordered pending tasks plus the single running slot.
#[derive(Debug, Default)]
pub struct TaskQueue {
    pending: Vec<Task>,
    running: Option<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending task and return its position.
    pub fn submit(&mut self, task: Task) -> usize {
        self.place(task)
    }

    /// Remove pending tasks by id.
    ///
    /// Each id is handled on its own: the running task and unknown ids are
    /// reported as failures without affecting the rest of the batch.
    pub fn cancel(&mut self, ids: &[String]) -> BatchResult<Task> {
        ids.iter()
            .map(|id| match self.cancel_one(id) {
                Ok(task) => BatchItem::ok(id.clone(), task),
                Err(e) => BatchItem::err(id.clone(), e.to_string()),
            })
            .collect()
    }

    /// Remove one pending task.
    pub fn cancel_one(&mut self, id: &str) -> Result<Task, QueueError> {
        self.check_cancellable(id)?;
        let index = self.index_of(id).ok_or(QueueError::NotFound)?;
        Ok(self.pending.remove(index))
    }

    /// Whether `cancel_one` would succeed, without changing anything.
    pub fn check_cancellable(&self, id: &str) -> Result<(), QueueError> {
        if self.running.as_ref().is_some_and(|t| t.id == id) {
            return Err(QueueError::AlreadyRunning);
        }
        if self.index_of(id).is_none() {
            return Err(QueueError::NotFound);
        }
        Ok(())
    }

    /// Whether a task can be promoted, without changing anything.
    pub fn check_promotable(&self, id: &str) -> Result<(), QueueError> {
        if self.running.as_ref().is_some_and(|t| t.id == id) {
            return Err(QueueError::RunningNotPromotable);
        }
        if self.index_of(id).is_none() {
            return Err(QueueError::NotFound);
        }
        Ok(())
    }

    /// Promote pending tasks to the front, all sharing promotion time `at`.
    ///
    /// The promoted tasks are re-placed oldest first, so checkpoint
    /// affinity still groups them among themselves. Each successful item
    /// carries the task's new position.
    pub fn promote(&mut self, ids: &[String], at: DateTime<Utc>) -> BatchResult<usize> {
        let mut outcomes: Vec<Option<QueueError>> = Vec::with_capacity(ids.len());
        let mut lifted = Vec::new();

        for id in ids {
            match self.check_promotable(id) {
                Ok(()) => {
                    if let Some(index) = self.index_of(id) {
                        let mut task = self.pending.remove(index);
                        task.promoted_at = at;
                        lifted.push(task);
                    }
                    outcomes.push(None);
                }
                // A duplicate id in the same batch was already lifted
                Err(QueueError::NotFound) if lifted.iter().any(|t| &t.id == id) => {
                    outcomes.push(None);
                }
                Err(e) => outcomes.push(Some(e)),
            }
        }

        lifted.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for task in lifted {
            self.place(task);
        }

        ids.iter()
            .zip(outcomes)
            .map(|(id, outcome)| match outcome {
                None => match self.position(id) {
                    Some(position) => BatchItem::ok(id.clone(), position),
                    None => BatchItem::err(id.clone(), QueueError::NotFound.to_string()),
                },
                Some(e) => BatchItem::err(id.clone(), e.to_string()),
            })
            .collect()
    }

    /// The task that runs next.
    pub fn peek(&self) -> Option<&Task> {
        self.pending.first()
    }

    /// Move a pending task into the running slot.
    pub fn start(&mut self, id: &str) -> Result<&Task, QueueError> {
        if self.running.is_some() {
            return Err(QueueError::Busy);
        }
        let index = self.index_of(id).ok_or(QueueError::NotFound)?;
        let task = self.running.insert(self.pending.remove(index));
        Ok(&*task)
    }

    /// Drop a task from the queue, whether running or pending.
    pub fn remove(&mut self, id: &str) -> Option<Task> {
        if self.running.as_ref().is_some_and(|t| t.id == id) {
            return self.running.take();
        }
        self.index_of(id).map(|index| self.pending.remove(index))
    }

    /// The running task, if any.
    pub fn running(&self) -> Option<&Task> {
        self.running.as_ref()
    }

    /// Pending tasks in execution order.
    pub fn pending(&self) -> &[Task] {
        &self.pending
    }

    /// 0-based position of a pending task.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index_of(id)
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending tasks as observer views.
    pub fn snapshot(&self) -> Vec<QueuedTaskView> {
        self.pending
            .iter()
            .enumerate()
            .map(|(position, task)| QueuedTaskView {
                id: task.id.clone(),
                position,
                checkpoint: task.checkpoint.clone(),
                promoted_at: task.promoted_at,
                created_at: task.created_at,
            })
            .collect()
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.pending.iter().position(|t| t.id == id)
    }

    /// Insert according to tier, affinity and creation order.
    fn place(&mut self, task: Task) -> usize {
        let tier_start = self
            .pending
            .iter()
            .position(|t| t.promoted_at <= task.promoted_at)
            .unwrap_or(self.pending.len());
        let tier_end = self.pending[tier_start..]
            .iter()
            .position(|t| t.promoted_at < task.promoted_at)
            .map(|offset| tier_start + offset)
            .unwrap_or(self.pending.len());

        let tier = &self.pending[tier_start..tier_end];
        let index = match tier.iter().rposition(|t| t.checkpoint == task.checkpoint) {
            Some(last_same) => tier_start + last_same + 1,
            None => tier
                .iter()
                .position(|t| t.created_at > task.created_at)
                .map(|offset| tier_start + offset)
                .unwrap_or(tier_end),
        };

        self.pending.insert(index, task);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::GenerationRequest;
    use chrono::Duration;

    fn task(id: &str, checkpoint: &str, created_offset_secs: i64) -> Task {
        let base = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut task = Task::from_request(
            GenerationRequest::new(checkpoint),
            base + Duration::seconds(created_offset_secs),
        );
        task.id = id.to_string();
        task
    }

    fn order(queue: &TaskQueue) -> Vec<&str> {
        queue.pending().iter().map(|t| t.id.as_str()).collect()
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_same_checkpoint_tasks_stay_in_submission_order() {
        let mut queue = TaskQueue::new();
        assert_eq!(queue.submit(task("T1", "A", 0)), 0);
        assert_eq!(queue.submit(task("T2", "A", 1)), 1);
        assert_eq!(queue.submit(task("T3", "B", 2)), 2);
        assert_eq!(order(&queue), vec!["T1", "T2", "T3"]);
    }

    #[test]
    fn test_affinity_groups_checkpoints() {
        let mut queue = TaskQueue::new();
        queue.submit(task("T1", "A", 0));
        queue.submit(task("T2", "B", 1));
        let position = queue.submit(task("T3", "A", 2));

        assert_eq!(position, 1);
        assert_eq!(order(&queue), vec!["T1", "T3", "T2"]);
    }

    #[test]
    fn test_cancel_reports_per_id() {
        let mut queue = TaskQueue::new();
        queue.submit(task("T1", "A", 0));
        queue.submit(task("T2", "A", 1));
        queue.submit(task("T3", "B", 2));

        let result = queue.cancel(&ids(&["T2", "T9"]));
        assert_eq!(result.succeeded_ids(), vec!["T2"]);
        let failures = result.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, "T9");
        assert_eq!(failures[0].reason, "not found");
        assert_eq!(order(&queue), vec!["T1", "T3"]);
    }

    #[test]
    fn test_running_task_cannot_be_cancelled() {
        let mut queue = TaskQueue::new();
        queue.submit(task("T1", "A", 0));
        queue.start("T1").unwrap();

        let err = queue.cancel_one("T1").unwrap_err();
        assert_eq!(err, QueueError::AlreadyRunning);
        assert_eq!(err.to_string(), "task already running, cannot cancel");
        assert_eq!(queue.running().map(|t| t.id.as_str()), Some("T1"));
    }

    #[test]
    fn test_promote_moves_task_to_front() {
        let mut queue = TaskQueue::new();
        queue.submit(task("T1", "A", 0));
        queue.submit(task("T2", "B", 1));
        queue.submit(task("T3", "A", 2));
        assert_eq!(order(&queue), vec!["T1", "T3", "T2"]);

        let result = queue.promote(&ids(&["T2"]), Utc::now());
        assert_eq!(result.items, vec![BatchItem::ok("T2", 0)]);
        assert_eq!(order(&queue), vec!["T2", "T1", "T3"]);
    }

    #[test]
    fn test_later_promotion_wins() {
        let mut queue = TaskQueue::new();
        queue.submit(task("T1", "A", 0));
        queue.submit(task("T2", "B", 1));
        queue.submit(task("T3", "C", 2));

        let first = Utc::now();
        queue.promote(&ids(&["T2"]), first);
        queue.promote(&ids(&["T3"]), first + Duration::milliseconds(1));
        assert_eq!(order(&queue), vec!["T3", "T2", "T1"]);
    }

    #[test]
    fn test_batch_promotion_keeps_affinity_within_tier() {
        let mut queue = TaskQueue::new();
        queue.submit(task("T1", "A", 0));
        queue.submit(task("T2", "B", 1));
        queue.submit(task("T3", "C", 2));
        queue.submit(task("T4", "B", 3));
        assert_eq!(order(&queue), vec!["T1", "T2", "T4", "T3"]);

        let result = queue.promote(&ids(&["T3", "T4", "T2"]), Utc::now());
        assert_eq!(order(&queue), vec!["T2", "T4", "T3", "T1"]);
        assert!(result.items.iter().all(|i| i.is_ok()));
        assert_eq!(queue.position("T3"), Some(2));
    }

    #[test]
    fn test_promote_unknown_and_running_fail_individually() {
        let mut queue = TaskQueue::new();
        queue.submit(task("T1", "A", 0));
        queue.submit(task("T2", "B", 1));
        queue.start("T1").unwrap();

        let result = queue.promote(&ids(&["T1", "T9", "T2"]), Utc::now());
        assert_eq!(result.succeeded_ids(), vec!["T2"]);
        let failures = result.failures();
        assert_eq!(failures[0].id, "T1");
        assert_eq!(failures[1].reason, "not found");
    }

    #[test]
    fn test_new_submission_lands_after_promoted_tier() {
        let mut queue = TaskQueue::new();
        queue.submit(task("T1", "A", 0));
        queue.submit(task("T2", "B", 1));
        queue.promote(&ids(&["T2"]), Utc::now());

        // Affinity never lifts a task out of its own tier.
        queue.submit(task("T3", "B", 2));
        assert_eq!(order(&queue), vec!["T2", "T1", "T3"]);
    }

    #[test]
    fn test_start_and_remove() {
        let mut queue = TaskQueue::new();
        queue.submit(task("T1", "A", 0));
        queue.submit(task("T2", "A", 1));

        let head = queue.peek().unwrap().id.clone();
        assert_eq!(head, "T1");
        queue.start(&head).unwrap();
        assert_eq!(queue.start("T2").unwrap_err(), QueueError::Busy);
        assert_eq!(queue.len(), 1);

        let removed = queue.remove("T1").unwrap();
        assert_eq!(removed.id, "T1");
        assert!(queue.running().is_none());
        assert_eq!(queue.peek().unwrap().id, "T2");
    }

    #[test]
    fn test_snapshot_positions() {
        let mut queue = TaskQueue::new();
        queue.submit(task("T1", "A", 0));
        queue.submit(task("T2", "B", 1));

        let views = queue.snapshot();
        assert_eq!(views.len(), 2);
        assert_eq!(views[1].id, "T2");
        assert_eq!(views[1].position, 1);
        assert_eq!(views[1].checkpoint, "B");
    }
}
