//! AMQP 0-9-1 broker backed by lapin over rustls
//!
//! - [`connection`] opens mutually authenticated sessions and tracks their
//!   closure
//! - [`channel`] owns the per-publish channel and the celery message
//!   properties

pub mod channel;
pub mod connection;

pub use channel::{message_properties, AmqpChannel};
pub use connection::{AmqpBroker, AmqpSession};
