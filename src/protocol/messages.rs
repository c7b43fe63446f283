//! HTTP-facing message types for the celery bridge
//!
//! This module defines the task submission payload accepted on `POST /tasks`
//! and the result document returned to the caller.

use crate::error::ErrorKind;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Task submission received from an HTTP client
///
/// Field names follow the wire contract (`Name`, `Args`, `Kwargs`).
///
/// # Examples
/// ```
/// use celery_bridge::protocol::Task;
///
/// let task: Task = serde_json::from_str(r#"{"Name": "tasks.add", "Args": ["4", "8"]}"#).unwrap();
/// assert_eq!(task.name, "tasks.add");
/// assert_eq!(task.args, vec!["4", "8"]);
/// assert!(task.kwargs.is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Task {
    /// Dotted name of the remote operation, e.g. `tasks.add`
    pub name: String,
    /// Positional arguments, in order
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<String>,
    /// Keyword arguments
    #[serde(default, deserialize_with = "null_as_default")]
    pub kwargs: Map<String, Value>,
}

impl Task {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_kwarg<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }
}

/// Clients written against the original API send `null` for empty collections
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Terminal status of a submission
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failure,
}

/// Outcome of a single submission
///
/// Exactly one of success or failure; a failure always carries the error kind
/// that produced it so the HTTP layer can pick a status code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TaskResult {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub kind: Option<ErrorKind>,
}

impl TaskResult {
    pub fn success() -> Self {
        Self {
            status: TaskStatus::Success,
            error: None,
            kind: None,
        }
    }

    pub fn failure<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            status: TaskStatus::Failure,
            error: Some(message.into()),
            kind: Some(kind),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}
