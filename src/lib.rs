//! Celery bridge
//!
//! An HTTP service that turns JSON task submissions into celery task messages
//! and publishes them to an AMQP broker over mutual TLS.
//!
//! # Overview
//!
//! - [`protocol`] defines the task document and its celery encoding
//! - [`transport`] resolves TLS material once, opens broker sessions and keeps
//!   one session current across broker failures
//! - [`gateway`] publishes each task on its own channel and reports the outcome
//! - [`http`] serves `POST /tasks` and the health endpoints
//!
//! # Quick Start
//!
//! ```rust
//! use celery_bridge::protocol::{encode_task, CeleryMessage, Task};
//!
//! let task = Task::new("tasks.add").with_args(["4", "8"]);
//! let message = encode_task(&task).unwrap();
//!
//! let decoded = CeleryMessage::decode(&message.body).unwrap();
//! assert_eq!(decoded.task, "tasks.add");
//! assert_eq!(decoded.args, vec!["4", "8"]);
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, BridgeResult, ErrorKind};
pub use gateway::{PublishGateway, SubmitError, TaskPublisher};
pub use protocol::{Task, TaskResult, TaskStatus};
pub use transport::{ConnectionState, SessionManager, TransportConfig, TransportConfigResolver};
