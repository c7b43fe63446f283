//! Pure state transition and reconnection decisions for the session manager

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{debug, info, warn};

/// Events that move the session state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectStarted { attempt: u32 },
    ConnectSucceeded,
    ConnectFailed(String),
    /// The current session closed (broker close, network failure)
    SessionClosed(String),
    ShutdownRequested,
    ShutdownComplete,
}

/// Decision result for a retry
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Wait `delay_ms`, then make retry number `attempt`
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
}

pub struct HealthMonitor;

impl HealthMonitor {
    /// Next state after an event. Once closing, only shutdown completion moves
    /// the machine on.
    pub fn determine_next_state(
        current: &ConnectionState,
        event: &ConnectionEvent,
    ) -> ConnectionState {
        match (current, event) {
            (ConnectionState::Closing, ConnectionEvent::ShutdownComplete) => {
                ConnectionState::Disconnected("shut down".to_string())
            }
            (ConnectionState::Closing, _) => ConnectionState::Closing,
            (_, ConnectionEvent::ShutdownRequested) => ConnectionState::Closing,
            (_, ConnectionEvent::ConnectStarted { attempt }) => {
                ConnectionState::Connecting { attempt: *attempt }
            }
            (_, ConnectionEvent::ConnectSucceeded) => ConnectionState::Live,
            (_, ConnectionEvent::ConnectFailed(reason))
            | (_, ConnectionEvent::SessionClosed(reason)) => {
                ConnectionState::Disconnected(reason.clone())
            }
            (_, ConnectionEvent::ShutdownComplete) => {
                ConnectionState::Disconnected("shut down".to_string())
            }
        }
    }

    /// Retries are unlimited; only shutdown stops them
    pub fn should_attempt_reconnection(
        retries_so_far: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        let attempt = retries_so_far.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting { attempt }, ConnectionState::Live) if *attempt > 1 => {
                info!(attempts = attempt, "Broker session established after retries");
            }
            (_, ConnectionState::Live) => {
                info!("Broker session live");
            }
            (ConnectionState::Live, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "Broker session lost");
            }
            (ConnectionState::Connecting { attempt }, ConnectionState::Disconnected(reason)) => {
                warn!(attempt = attempt, reason = %reason, "Broker connection attempt failed");
            }
            (_, ConnectionState::Closing) => {
                info!("Session manager closing");
            }
            _ => {
                debug!("Session state: {} -> {}", from, to);
            }
        }
    }
}
