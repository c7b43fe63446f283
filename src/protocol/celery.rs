//! Celery task message encoding
//!
//! Tasks are published using celery's JSON message protocol (version 1): the
//! body carries the task name, a fresh id and the call arguments, while the
//! broker-visible properties describe the encoding so a stock celery worker can
//! decode it.

use super::messages::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub const CONTENT_TYPE: &str = "application/json";
pub const CONTENT_ENCODING: &str = "utf-8";
/// AMQP delivery mode for messages that survive a broker restart
pub const PERSISTENT_DELIVERY: u8 = 2;

/// Reasons a task cannot be represented as a celery message
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("Task name must not be empty")]
    EmptyName,
    #[error("Invalid task name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
    #[error("Failed to serialize task message")]
    Serialization(#[from] serde_json::Error),
}

/// Celery protocol v1 message body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CeleryMessage {
    pub id: Uuid,
    pub task: String,
    pub args: Vec<String>,
    pub kwargs: Map<String, Value>,
    pub retries: u32,
    /// Earliest execution time; absent means run as soon as a worker is free
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

impl CeleryMessage {
    /// Build a message for immediate execution
    pub fn from_task(task: &Task) -> Result<Self, EncodingError> {
        validate_task_name(&task.name)?;

        Ok(Self {
            id: Uuid::new_v4(),
            task: task.name.clone(),
            args: task.args.clone(),
            kwargs: task.kwargs.clone(),
            retries: 0,
            eta: None,
            expires: None,
        })
    }

    /// Serialize the body and attach broker-visible properties
    pub fn encode(&self) -> Result<EncodedMessage, EncodingError> {
        let body = serde_json::to_vec(self)?;

        Ok(EncodedMessage {
            message_id: self.id.to_string(),
            task_name: self.task.clone(),
            body,
            content_type: CONTENT_TYPE,
            content_encoding: CONTENT_ENCODING,
            delivery_mode: PERSISTENT_DELIVERY,
            priority: 0,
            timestamp: Utc::now().timestamp().max(0) as u64,
        })
    }

    pub fn decode(body: &[u8]) -> Result<Self, EncodingError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Wire-ready message: body bytes plus the AMQP basic properties to send with it
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMessage {
    pub message_id: String,
    pub task_name: String,
    pub body: Vec<u8>,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
    pub delivery_mode: u8,
    pub priority: u8,
    pub timestamp: u64,
}

/// Validate and encode a task in one step
pub fn encode_task(task: &Task) -> Result<EncodedMessage, EncodingError> {
    CeleryMessage::from_task(task)?.encode()
}

/// Celery resolves tasks by their registered name, which never contains
/// whitespace or control characters
fn validate_task_name(name: &str) -> Result<(), EncodingError> {
    if name.trim().is_empty() {
        return Err(EncodingError::EmptyName);
    }

    if let Some(c) = name.chars().find(|c| c.is_whitespace() || c.is_control()) {
        return Err(EncodingError::InvalidName {
            name: name.to_string(),
            reason: format!("contains disallowed character {c:?}"),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_encode_add_task() {
        let task = Task::new("tasks.add").with_args(["4", "8"]);
        let encoded = encode_task(&task).unwrap();

        assert_eq!(encoded.task_name, "tasks.add");
        assert_eq!(encoded.content_type, "application/json");
        assert_eq!(encoded.content_encoding, "utf-8");
        assert_eq!(encoded.delivery_mode, 2);

        let decoded = CeleryMessage::decode(&encoded.body).unwrap();
        assert_eq!(decoded.task, "tasks.add");
        assert_eq!(decoded.args, vec!["4", "8"]);
        assert_eq!(decoded.retries, 0);
        assert_eq!(decoded.id.to_string(), encoded.message_id);
    }

    #[test]
    fn test_body_layout() {
        let task = Task::new("tasks.add").with_args(["1"]);
        let encoded = encode_task(&task).unwrap();
        let body: Value = serde_json::from_slice(&encoded.body).unwrap();

        assert_eq!(body["task"], json!("tasks.add"));
        assert_eq!(body["args"], json!(["1"]));
        assert_eq!(body["kwargs"], json!({}));
        assert!(body["id"].is_string());
        assert!(body.get("eta").is_none());
        assert!(body.get("expires").is_none());
    }

    #[test]
    fn test_each_message_gets_fresh_id() {
        let task = Task::new("tasks.add");
        let first = encode_task(&task).unwrap();
        let second = encode_task(&task).unwrap();
        assert_ne!(first.message_id, second.message_id);
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(matches!(
            encode_task(&Task::new("")),
            Err(EncodingError::EmptyName)
        ));
        assert!(matches!(
            encode_task(&Task::new("   ")),
            Err(EncodingError::EmptyName)
        ));
    }

    #[test]
    fn test_name_with_whitespace_rejected() {
        let result = encode_task(&Task::new("tasks add"));
        assert!(matches!(result, Err(EncodingError::InvalidName { .. })));

        let result = encode_task(&Task::new("tasks.add\n"));
        assert!(matches!(result, Err(EncodingError::InvalidName { .. })));
    }

    #[test]
    fn test_kwargs_preserved() {
        let task = Task::new("tasks.report")
            .with_kwarg("nested", json!({"a": [1, 2, 3]}))
            .with_kwarg("flag", json!(false));
        let encoded = encode_task(&task).unwrap();
        let decoded = CeleryMessage::decode(&encoded.body).unwrap();

        assert_eq!(decoded.kwargs, task.kwargs);
    }

    proptest! {
        #[test]
        fn prop_valid_names_round_trip(
            name in "[a-zA-Z_][a-zA-Z0-9_.]{0,40}",
            args in proptest::collection::vec(".*", 0..6),
        ) {
            let task = Task::new(name.clone()).with_args(args.clone());
            let encoded = encode_task(&task).unwrap();
            let decoded = CeleryMessage::decode(&encoded.body).unwrap();
            prop_assert_eq!(decoded.task, name);
            prop_assert_eq!(decoded.args, args);
        }
    }
}
