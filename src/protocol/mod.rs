//! Task submission types and the celery wire encoding
//!
//! [`messages`] holds the HTTP-facing task and result documents; [`celery`]
//! turns a task into the message a celery worker consumes.

pub mod celery;
pub mod messages;

pub use celery::{encode_task, CeleryMessage, EncodedMessage, EncodingError};
pub use messages::*;
