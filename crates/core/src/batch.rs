//! Per-element results for batch operations.
//!
//! A batch never fails as a whole: each id is attempted on its own and
//! reported as either a success or a failure with a reason.

use serde::{Deserialize, Serialize};

/// Outcome for one element of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchItem<T> {
    Ok { id: String, value: T },
    Err { id: String, reason: String },
}

impl<T> BatchItem<T> {
    pub fn ok(id: impl Into<String>, value: T) -> Self {
        BatchItem::Ok {
            id: id.into(),
            value,
        }
    }

    pub fn err(id: impl Into<String>, reason: impl Into<String>) -> Self {
        BatchItem::Err {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            BatchItem::Ok { id, .. } | BatchItem::Err { id, .. } => id,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, BatchItem::Ok { .. })
    }
}

/// A failed batch element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub id: String,
    pub reason: String,
}

/// Ordered outcomes of a batch, one per requested id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult<T> {
    pub items: Vec<BatchItem<T>>,
}

impl<T> BatchResult<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, item: BatchItem<T>) {
        self.items.push(item);
    }

    /// Successful elements with their values.
    pub fn succeeded(&self) -> impl Iterator<Item = (&str, &T)> {
        self.items.iter().filter_map(|item| match item {
            BatchItem::Ok { id, value } => Some((id.as_str(), value)),
            BatchItem::Err { .. } => None,
        })
    }

    /// Ids of the successful elements, in request order.
    pub fn succeeded_ids(&self) -> Vec<String> {
        self.succeeded().map(|(id, _)| id.to_string()).collect()
    }

    /// Failed elements, in request order.
    pub fn failures(&self) -> Vec<BatchFailure> {
        self.items
            .iter()
            .filter_map(|item| match item {
                BatchItem::Err { id, reason } => Some(BatchFailure {
                    id: id.clone(),
                    reason: reason.clone(),
                }),
                BatchItem::Ok { .. } => None,
            })
            .collect()
    }
}

impl<T> Default for BatchResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<BatchItem<T>> for BatchResult<T> {
    fn from_iter<I: IntoIterator<Item = BatchItem<T>>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}
