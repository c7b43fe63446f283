//! Mock broker for testing
//!
//! [`MockBroker`] implements the transport seams in memory. Connect failures,
//! channel failures, publish failures and slow publishes can be scripted, and
//! every accepted publish is recorded for inspection.

use crate::protocol::EncodedMessage;
use crate::transport::{
    Broker, BrokerSession, CloseSignal, PublishChannel, PublishRoute, TransportError,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A message accepted by the mock broker
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: String,
    pub task_name: String,
    pub body: Vec<u8>,
    pub session_id: usize,
    pub channel_id: usize,
}

#[derive(Debug, Default)]
struct BrokerState {
    connect_attempts: AtomicUsize,
    pending_connect_failures: AtomicUsize,
    unavailable: AtomicBool,
    fail_channel_creation: AtomicBool,
    fail_publish: AtomicBool,
    publish_delay_ms: AtomicU64,
    open_channels: AtomicUsize,
    channels_opened: AtomicUsize,
    published: Mutex<Vec<PublishedMessage>>,
    sessions: Mutex<Vec<MockSession>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory broker; clones share state
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connection attempts
    pub fn fail_next_connects(&self, count: usize) {
        self.state
            .pending_connect_failures
            .store(count, Ordering::SeqCst);
    }

    /// Refuse every connection attempt until made available again
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_channel_failure(&self, fail: bool) {
        self.state
            .fail_channel_creation
            .store(fail, Ordering::SeqCst);
    }

    pub fn set_publish_failure(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Delay every publish; a publish in flight fails if its session closes
    pub fn set_publish_delay(&self, delay: Duration) {
        self.state
            .publish_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<MockSession> {
        lock(&self.state.sessions).clone()
    }

    pub fn latest_session(&self) -> Option<MockSession> {
        lock(&self.state.sessions).last().cloned()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state.published).clone()
    }

    /// Channels handed out and not yet closed
    pub fn open_channels(&self) -> usize {
        self.state.open_channels.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }

    fn take_scripted_failure(&self) -> bool {
        self.state
            .pending_connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Broker for MockBroker {
    type Session = MockSession;

    async fn connect(&self) -> Result<MockSession, TransportError> {
        let attempt = self.state.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if self.state.unavailable.load(Ordering::SeqCst) || self.take_scripted_failure() {
            return Err(TransportError::ConnectionFailed(format!(
                "connection refused (attempt {attempt})"
            )));
        }

        let mut sessions = lock(&self.state.sessions);
        let session = MockSession {
            id: sessions.len(),
            close_signal: CloseSignal::new(),
            connected: Arc::new(AtomicBool::new(true)),
            broker: Arc::clone(&self.state),
        };
        sessions.push(session.clone());
        Ok(session)
    }

    fn endpoint(&self) -> String {
        "mock-broker:5671".to_string()
    }
}

/// In-memory session
#[derive(Debug, Clone)]
pub struct MockSession {
    id: usize,
    close_signal: CloseSignal,
    connected: Arc<AtomicBool>,
    broker: Arc<BrokerState>,
}

impl MockSession {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Simulate the broker or network dropping the session
    pub fn drop_connection(&self, reason: &str) {
        self.close_signal.close(reason);
    }

    /// Simulate a connection that goes away without reporting an error
    pub fn drop_silently(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    type Channel = MockChannel;

    async fn create_channel(&self) -> Result<MockChannel, TransportError> {
        if let Some(reason) = self.close_signal.reason() {
            return Err(TransportError::SessionClosed(reason));
        }
        if self.broker.fail_channel_creation.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelFailed(
                "channel_max reached".to_string(),
            ));
        }

        self.broker.open_channels.fetch_add(1, Ordering::SeqCst);
        let id = self.broker.channels_opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockChannel {
            id,
            session: self.clone(),
        })
    }

    fn close_signal(&self) -> &CloseSignal {
        &self.close_signal
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_signal.close("closed by client");
        Ok(())
    }

    fn is_live(&self) -> bool {
        !self.close_signal.is_closed() && self.connected.load(Ordering::SeqCst)
    }
}

/// In-memory channel
#[derive(Debug)]
pub struct MockChannel {
    id: usize,
    session: MockSession,
}

impl MockChannel {
    fn session_closed(&self) -> Option<TransportError> {
        self.session
            .close_signal
            .reason()
            .map(|reason| TransportError::PublishFailed(format!("session closed: {reason}")))
    }
}

#[async_trait]
impl PublishChannel for MockChannel {
    async fn publish(
        &self,
        route: &PublishRoute,
        message: &EncodedMessage,
    ) -> Result<(), TransportError> {
        let broker = &self.session.broker;

        let delay = broker.publish_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::select! {
                reason = self.session.close_signal.closed() => {
                    return Err(TransportError::PublishFailed(format!("session closed: {reason}")));
                }
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }

        if let Some(error) = self.session_closed() {
            return Err(error);
        }
        if broker.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed(format!(
                "broker rejected message {}",
                message.message_id
            )));
        }

        lock(&broker.published).push(PublishedMessage {
            exchange: route.exchange.clone(),
            routing_key: route.routing_key.clone(),
            message_id: message.message_id.clone(),
            task_name: message.task_name.clone(),
            body: message.body.clone(),
            session_id: self.session.id,
            channel_id: self.id,
        });
        Ok(())
    }

    async fn close(self) -> Result<(), TransportError> {
        self.session
            .broker
            .open_channels
            .fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
