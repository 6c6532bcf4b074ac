//! Per-item failures collected alongside partial results.
//!
//! An aggregation call never fails as a whole because one CronJob, Job or Pod
//! could not be processed. Each such failure is recorded against the item it
//! concerns so callers can tell "nothing exists" from "some of it failed".

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, ObjectKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemErrorKind {
    /// The CronJob's schedule could not be evaluated.
    InvalidSchedule,
    /// Listing the Jobs or Pods owned by the item failed.
    Resolution,
    /// Fetching the log stream of a pod failed.
    LogFetch,
}

impl fmt::Display for ItemErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemErrorKind::InvalidSchedule => write!(f, "InvalidSchedule"),
            ItemErrorKind::Resolution => write!(f, "Resolution"),
            ItemErrorKind::LogFetch => write!(f, "LogFetch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub item: ObjectKey,
    pub kind: ItemErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn new(item: ObjectKey, kind: ItemErrorKind, cause: &Error) -> Self {
        Self {
            item,
            kind,
            message: cause.to_string(),
        }
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.item, self.kind, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorList(Vec<ItemError>);

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ItemError) {
        self.0.push(error);
    }

    pub fn record(&mut self, item: ObjectKey, kind: ItemErrorKind, cause: &Error) {
        self.push(ItemError::new(item, kind, cause));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemError> {
        self.0.iter()
    }

    /// Failures recorded against `item`.
    pub fn for_item<'a>(&'a self, item: &'a ObjectKey) -> impl Iterator<Item = &'a ItemError> {
        self.0.iter().filter(move |e| &e.item == item)
    }

    /// Order by item so results do not depend on fan-out completion order.
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| a.item.cmp(&b.item));
    }

    /// Plain-text rendering: one `Error: <item>` block per failure.
    pub fn render_text(&self) -> String {
        self.0
            .iter()
            .map(|e| format!("Error: {}\n----\n{}\n", e.item, e.message))
            .collect()
    }
}

impl IntoIterator for ErrorList {
    type Item = ItemError;
    type IntoIter = std::vec::IntoIter<ItemError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
