//! Broker transport layer
//!
//! The bridge talks to the broker through three seams:
//!
//! - [`Broker`] opens authenticated sessions
//! - [`BrokerSession`] is one live connection; it hands out channels and
//!   reports its own closure through a [`CloseSignal`]
//! - [`PublishChannel`] is a short-lived conduit used for exactly one publish
//!
//! [`amqp`] implements them with lapin over rustls, [`session`] keeps one
//! session current across failures, and [`tls`] resolves the connection
//! settings and trust material.

use crate::protocol::EncodedMessage;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

pub mod amqp;
pub mod session;
pub mod tls;

pub use session::{ConnectionState, ReconnectConfig, SessionError, SessionManager};
pub use tls::{TransportConfig, TransportConfigResolver};

/// Errors raised at the broker boundary
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Channel creation failed: {0}")]
    ChannelFailed(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Session closed: {0}")]
    SessionClosed(String),
    #[error("Close failed: {0}")]
    CloseFailed(String),
}

/// Exchange and routing key every task is published to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRoute {
    pub exchange: String,
    pub routing_key: String,
}

impl PublishRoute {
    pub fn new<E: Into<String>, R: Into<String>>(exchange: E, routing_key: R) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl Default for PublishRoute {
    /// Default exchange, routed to the `celery` queue
    fn default() -> Self {
        Self::new("", "celery")
    }
}

/// One-shot closure notification shared by a session and its observers
///
/// The first reason recorded wins; later calls to [`CloseSignal::close`] are
/// ignored.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the session closed. Returns true if this call closed it.
    pub fn close<S: Into<String>>(&self, reason: S) -> bool {
        let reason = reason.into();
        self.tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Wait until the session is closed and return the reason
    pub async fn closed(&self) -> String {
        let mut rx = self.tx.subscribe();
        let reason = match rx.wait_for(|state| state.is_some()).await {
            Ok(state) => state.clone().unwrap_or_default(),
            // The sender lives in `self`, so this only happens during teardown
            Err(_) => "close signal dropped".to_string(),
        };
        reason
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory for broker sessions
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Session: BrokerSession;

    /// Open a new authenticated session
    async fn connect(&self) -> Result<Self::Session, TransportError>;

    /// Broker address for logging, without credentials
    fn endpoint(&self) -> String;
}

/// A live logical connection to the broker
#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    type Channel: PublishChannel;

    /// Open a fresh channel for a single publish
    async fn create_channel(&self) -> Result<Self::Channel, TransportError>;

    /// Closure notification for this session
    fn close_signal(&self) -> &CloseSignal;

    /// Close the session; a closed session is never reused
    async fn close(&self) -> Result<(), TransportError>;

    fn is_live(&self) -> bool {
        !self.close_signal().is_closed()
    }
}

/// A channel owned by exactly one publish call
#[async_trait]
pub trait PublishChannel: Send + Sync + 'static {
    async fn publish(
        &self,
        route: &PublishRoute,
        message: &EncodedMessage,
    ) -> Result<(), TransportError>;

    /// Release the channel
    async fn close(self) -> Result<(), TransportError>;
}
