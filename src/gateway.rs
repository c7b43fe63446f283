//! Task submission against the current broker session
//!
//! Every submission opens its own channel from the current session, publishes
//! one celery message on it and closes it again, whatever the outcome. A
//! channel error therefore only ever fails the request that caused it.

use crate::error::{sanitize_error_message, ErrorKind};
use crate::observability::metrics;
use crate::protocol::{encode_task, EncodingError, Task, TaskResult};
use crate::publish_span;
use crate::transport::{
    Broker, BrokerSession, ConnectionState, PublishChannel, PublishRoute, SessionError,
    SessionManager, TransportError,
};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

/// Why a submission failed
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid task: {0}")]
    Encoding(#[from] EncodingError),
    #[error("not connected to broker: {state}")]
    NotConnected { state: ConnectionState },
    #[error("{0}")]
    Channel(TransportError),
    #[error("{0}")]
    Publish(TransportError),
    #[error("publish not confirmed within {0:?}")]
    Timeout(Duration),
}

impl SubmitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubmitError::Encoding(_) => ErrorKind::Encoding,
            SubmitError::NotConnected { .. } | SubmitError::Channel(_) => ErrorKind::Channel,
            SubmitError::Publish(_) | SubmitError::Timeout(_) => ErrorKind::Publish,
        }
    }
}

impl From<SessionError> for SubmitError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::NotConnected { state } => SubmitError::NotConnected { state },
            other => SubmitError::Channel(TransportError::SessionClosed(other.to_string())),
        }
    }
}

/// What the HTTP layer needs from the gateway
#[async_trait]
pub trait TaskPublisher: Send + Sync + 'static {
    /// Submit one task; always returns exactly one terminal result
    async fn submit(&self, task: Task) -> TaskResult;

    fn connection_state(&self) -> ConnectionState;
}

/// Publishes tasks through the session manager's current session
pub struct PublishGateway<B: Broker> {
    sessions: SessionManager<B>,
    route: PublishRoute,
    publish_timeout: Duration,
}

impl<B: Broker> Clone for PublishGateway<B> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            route: self.route.clone(),
            publish_timeout: self.publish_timeout,
        }
    }
}

impl<B: Broker> PublishGateway<B> {
    pub fn new(sessions: SessionManager<B>, route: PublishRoute, publish_timeout: Duration) -> Self {
        Self {
            sessions,
            route,
            publish_timeout,
        }
    }

    pub fn sessions(&self) -> &SessionManager<B> {
        &self.sessions
    }

    /// Encode, publish and report the outcome
    pub async fn submit(&self, task: Task) -> TaskResult {
        let span = publish_span!(task = %task.name);

        async {
            metrics().task_received();
            let started = Instant::now();

            match self.try_submit(&task).await {
                Ok(message_id) => {
                    let elapsed = started.elapsed();
                    metrics().task_published(elapsed);
                    info!(
                        message_id = %message_id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Task published"
                    );
                    TaskResult::success()
                }
                Err(error) => {
                    let kind = error.kind();
                    metrics().task_failed(kind);
                    warn!(kind = kind.as_str(), error = %error, "Task submission failed");
                    TaskResult::failure(kind, sanitize_error_message(&error.to_string()))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Returns the message id of the published task. The channel is released
    /// on every path once it has been opened.
    pub async fn try_submit(&self, task: &Task) -> Result<String, SubmitError> {
        let message = encode_task(task)?;
        let session = self.sessions.require_session()?;

        let channel = match tokio::time::timeout(self.publish_timeout, session.create_channel()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return Err(SubmitError::Channel(e)),
            Err(_) => {
                return Err(SubmitError::Channel(TransportError::ChannelFailed(format!(
                    "no channel within {:?}",
                    self.publish_timeout
                ))))
            }
        };
        debug!(message_id = %message.message_id, "Publishing task");

        let outcome =
            match tokio::time::timeout(self.publish_timeout, channel.publish(&self.route, &message))
                .await
            {
                Ok(Ok(())) => Ok(message.message_id.clone()),
                Ok(Err(e)) => Err(SubmitError::Publish(e)),
                Err(_) => Err(SubmitError::Timeout(self.publish_timeout)),
            };

        match tokio::time::timeout(self.publish_timeout, channel.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Channel close failed"),
            Err(_) => warn!("Channel close timed out"),
        }

        outcome
    }
}

#[async_trait]
impl<B: Broker> TaskPublisher for PublishGateway<B> {
    async fn submit(&self, task: Task) -> TaskResult {
        PublishGateway::submit(self, task).await
    }

    fn connection_state(&self) -> ConnectionState {
        self.sessions.connection_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBroker;
    use crate::transport::ReconnectConfig;

    fn gateway(broker: &MockBroker) -> PublishGateway<MockBroker> {
        let sessions = SessionManager::new(broker.clone(), ReconnectConfig::fixed(10));
        PublishGateway::new(sessions, PublishRoute::default(), Duration::from_millis(500))
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            SubmitError::Encoding(EncodingError::EmptyName).kind(),
            ErrorKind::Encoding
        );
        assert_eq!(
            SubmitError::NotConnected {
                state: ConnectionState::Connecting { attempt: 1 }
            }
            .kind(),
            ErrorKind::Channel
        );
        assert_eq!(
            SubmitError::Channel(TransportError::ChannelFailed("x".into())).kind(),
            ErrorKind::Channel
        );
        assert_eq!(
            SubmitError::Publish(TransportError::PublishFailed("x".into())).kind(),
            ErrorKind::Publish
        );
        assert_eq!(
            SubmitError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Publish
        );
    }

    #[test]
    fn test_session_error_conversion() {
        let error: SubmitError = SessionError::NotConnected {
            state: ConnectionState::Closing,
        }
        .into();
        assert!(matches!(error, SubmitError::NotConnected { .. }));
        assert_eq!(error.kind(), ErrorKind::Channel);
    }

    #[tokio::test]
    async fn test_submit_before_connect_fails_with_channel_kind() {
        let broker = MockBroker::new();
        let gateway = gateway(&broker);

        let result = gateway.submit(Task::new("tasks.add")).await;

        assert!(!result.is_success());
        assert_eq!(result.kind, Some(ErrorKind::Channel));
        assert_eq!(broker.channels_opened(), 0);
    }

    #[tokio::test]
    async fn test_encoding_failure_opens_no_channel() {
        let broker = MockBroker::new();
        let gateway = gateway(&broker);
        gateway.sessions().connect().await.unwrap();

        let result = gateway.submit(Task::new("   ")).await;

        assert_eq!(result.kind, Some(ErrorKind::Encoding));
        assert_eq!(broker.channels_opened(), 0);
        gateway.sessions().shutdown().await;
    }

    #[tokio::test]
    async fn test_try_submit_returns_message_id() {
        let broker = MockBroker::new();
        let gateway = gateway(&broker);
        gateway.sessions().connect().await.unwrap();

        let id = gateway.try_submit(&Task::new("tasks.add")).await.unwrap();

        assert_eq!(broker.published()[0].message_id, id);
        assert_eq!(broker.open_channels(), 0);
        gateway.sessions().shutdown().await;
    }
}
