//! Owner of the single current broker session
//!
//! [`SessionManager::connect`] blocks until the first session is live, then
//! hands the session to one supervisor task. The supervisor waits for the
//! session to close, clears it, and reconnects in a loop until a replacement
//! is live or shutdown is requested. Publishers read the current session
//! through a watch channel, so they see either a live session or none.

use super::connection::{ConnectionState, ReconnectConfig, SessionError};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use crate::observability::metrics;
use crate::session_span;
use crate::transport::{Broker, BrokerSession};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

/// How long shutdown waits for the supervisor before aborting it
const SUPERVISOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How often the supervisor checks that the current session is still live
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_millis(250);

type SessionSlot<B> = Option<Arc<<B as Broker>::Session>>;

/// Keeps one broker session current across failures
pub struct SessionManager<B: Broker> {
    inner: Arc<Inner<B>>,
}

impl<B: Broker> Clone for SessionManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<B: Broker> {
    broker: B,
    reconnect: ReconnectConfig,
    current: watch::Sender<SessionSlot<B>>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    reconnect_count: AtomicU64,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Broker> SessionManager<B> {
    pub fn new(broker: B, reconnect: ReconnectConfig) -> Self {
        let (current, _) = watch::channel(None);
        let (state, _) = watch::channel(ConnectionState::default());
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                broker,
                reconnect,
                current,
                state,
                shutdown,
                started: AtomicBool::new(false),
                reconnect_count: AtomicU64::new(0),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Connect to the broker, retrying until a session is live, and start
    /// supervising it
    pub async fn connect(&self) -> Result<Arc<B::Session>, SessionError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }

        info!(broker = %self.inner.broker.endpoint(), "Connecting to broker");
        let session = Arc::clone(&self.inner).establish(false).await?;

        let mut supervisor = self.inner.supervisor.lock().await;
        if !self.inner.install(&session) {
            let _ = session.close().await;
            return Err(SessionError::ShutdownRequested);
        }

        let span = session_span!(broker = %self.inner.broker.endpoint());
        let task = Arc::clone(&self.inner).supervise(Arc::clone(&session));
        *supervisor = Some(tokio::spawn(task.instrument(span)));

        Ok(session)
    }

    /// The current session, if one is live
    pub fn current_session(&self) -> Option<Arc<B::Session>> {
        self.inner
            .current
            .borrow()
            .as_ref()
            .filter(|session| session.is_live())
            .cloned()
    }

    /// The current session or the state explaining why there is none
    pub fn require_session(&self) -> Result<Arc<B::Session>, SessionError> {
        self.current_session()
            .ok_or_else(|| SessionError::NotConnected {
                state: self.connection_state(),
            })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Sessions established after the first one
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Stop reconnecting, close the current session and wait for the
    /// supervisor. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        self.inner.transition(ConnectionEvent::ShutdownRequested);

        let handle = self.inner.supervisor.lock().await.take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(SUPERVISOR_JOIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => info!("Session supervisor stopped"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Session supervisor ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Session supervisor did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        if let Some(session) = self.inner.current.send_replace(None) {
            if let Err(e) = session.close().await {
                warn!("Error closing broker session: {}", e);
            }
            metrics().session_closed();
        }

        self.inner.transition(ConnectionEvent::ShutdownComplete);
        info!("Session manager shut down");
    }
}

impl<B: Broker> Inner<B> {
    /// Apply an event to the state machine. After shutdown begins only the
    /// shutdown events are applied.
    fn transition(&self, event: ConnectionEvent) {
        let shutdown_event = matches!(
            event,
            ConnectionEvent::ShutdownRequested | ConnectionEvent::ShutdownComplete
        );
        if !shutdown_event && *self.shutdown.borrow() {
            return;
        }

        let mut change = None;
        self.state.send_if_modified(|state| {
            let next = HealthMonitor::determine_next_state(state, &event);
            if *state == next {
                return false;
            }
            let previous = std::mem::replace(state, next);
            change = Some((previous, state.clone()));
            true
        });

        if let Some((from, to)) = change {
            HealthMonitor::log_state_transition(&from, &to);
        }
    }

    /// Publish a new current session unless shutdown has begun. The shutdown
    /// flag is checked while the slot is held so shutdown always sees the
    /// installed session.
    fn install(&self, session: &Arc<B::Session>) -> bool {
        let mut installed = false;
        self.current.send_if_modified(|slot| {
            if *self.shutdown.borrow() {
                return false;
            }
            *slot = Some(Arc::clone(session));
            installed = true;
            true
        });
        installed
    }

    /// Clear the slot if it still holds `session`
    fn clear(&self, session: &Arc<B::Session>) {
        self.current.send_if_modified(|slot| {
            let is_current = slot
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, session));
            if is_current {
                *slot = None;
            }
            is_current
        });
    }

    /// Connect until a session is live. On reconnect every attempt is
    /// preceded by the backoff delay; at startup the first attempt is not.
    async fn establish(self: Arc<Self>, reconnecting: bool) -> Result<Arc<B::Session>, SessionError> {
        let mut attempt = 0u32;
        let mut retries = 0u32;

        loop {
            if reconnecting || attempt > 0 {
                let shutdown_requested = *self.shutdown.borrow();
                match HealthMonitor::should_attempt_reconnection(
                    retries,
                    &self.reconnect,
                    shutdown_requested,
                ) {
                    ReconnectionDecision::Proceed { attempt: retry, delay_ms } => {
                        info!(retry = retry, delay_ms = delay_ms, "Retrying broker connection");
                        if !self.interruptible_sleep(delay_ms).await {
                            return Err(SessionError::ShutdownRequested);
                        }
                        retries = retry;
                    }
                    ReconnectionDecision::AbortShutdownRequested => {
                        return Err(SessionError::ShutdownRequested);
                    }
                }
            }

            attempt += 1;
            self.transition(ConnectionEvent::ConnectStarted { attempt });
            metrics().connection_attempt();

            let result = tokio::select! {
                biased;
                _ = wait_for_shutdown(self.shutdown.subscribe()) => {
                    return Err(SessionError::ShutdownRequested);
                }
                result = self.broker.connect() => result,
            };

            match result {
                Ok(session) => {
                    self.transition(ConnectionEvent::ConnectSucceeded);
                    metrics().connection_established();
                    return Ok(Arc::new(session));
                }
                Err(e) => {
                    metrics().connection_failed();
                    self.transition(ConnectionEvent::ConnectFailed(e.to_string()));
                }
            }
        }
    }

    /// Returns false if shutdown was requested during the wait
    async fn interruptible_sleep(&self, delay_ms: u64) -> bool {
        tokio::select! {
            _ = wait_for_shutdown(self.shutdown.subscribe()) => {
                info!("Shutdown requested during reconnection delay");
                false
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Watch the current session and replace it whenever it closes
    async fn supervise(self: Arc<Self>, mut session: Arc<B::Session>) {
        loop {
            let reason = tokio::select! {
                biased;
                _ = wait_for_shutdown(self.shutdown.subscribe()) => break,
                reason = session.close_signal().closed() => reason,
                reason = wait_until_not_live(session.as_ref()) => reason,
            };

            self.clear(&session);
            self.transition(ConnectionEvent::SessionClosed(reason));
            metrics().session_lost();
            let _ = session.close().await;

            let replacement = match Arc::clone(&self).establish(true).await {
                Ok(replacement) => replacement,
                Err(_) => break,
            };

            if !self.install(&replacement) {
                let _ = replacement.close().await;
                break;
            }
            self.reconnect_count.fetch_add(1, Ordering::Relaxed);
            session = replacement;
        }
        info!("Session supervisor exiting");
    }
}

/// Resolves once the session stops reporting itself live without having
/// fired its close signal
async fn wait_until_not_live<S: BrokerSession>(session: &S) -> String {
    let mut ticker = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !session.is_live() {
            let reason = "session no longer connected";
            session.close_signal().close(reason);
            return session
                .close_signal()
                .reason()
                .unwrap_or_else(|| reason.to_string());
        }
    }
}

/// Resolves once the shutdown flag is set
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
