//! Broker session lifecycle
//!
//! - [`connection`] holds the state, reconnect settings and errors
//! - [`health_monitor`] holds the pure transition and retry decisions
//! - [`manager`] runs connect, supervision and shutdown
//!
//! ```rust
//! use celery_bridge::testing::MockBroker;
//! use celery_bridge::transport::{ConnectionState, ReconnectConfig, SessionManager};
//!
//! # tokio_test::block_on(async {
//! let broker = MockBroker::new();
//! broker.fail_next_connects(2);
//!
//! let sessions = SessionManager::new(broker.clone(), ReconnectConfig::fixed(5));
//! sessions.connect().await.unwrap();
//! assert_eq!(sessions.connection_state(), ConnectionState::Live);
//! assert_eq!(broker.connect_attempts(), 3);
//!
//! sessions.shutdown().await;
//! assert!(sessions.current_session().is_none());
//! # });
//! ```

pub mod connection;
pub mod health_monitor;
pub mod manager;

pub use connection::{ConnectionState, ReconnectConfig, SessionError};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use manager::SessionManager;
