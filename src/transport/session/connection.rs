//! Session state and reconnection configuration

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle of the broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session; carries the reason the last one ended or failed
    Disconnected(String),
    /// Connection attempt in progress (1-based attempt count)
    Connecting { attempt: u32 },
    /// A session is current and accepting channels
    Live,
    /// Shutdown requested; no further reconnection
    Closing,
}

impl ConnectionState {
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Live)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "disconnected",
            ConnectionState::Connecting { .. } => "connecting",
            ConnectionState::Live => "live",
            ConnectionState::Closing => "closing",
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected("not started".to_string())
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({reason})"),
            ConnectionState::Connecting { attempt } => write!(f, "connecting (attempt {attempt})"),
            ConnectionState::Live => f.write_str("live"),
            ConnectionState::Closing => f.write_str("closing"),
        }
    }
}

/// Reconnection configuration
///
/// Retries never stop. With an empty pattern every retry waits `delay_ms`;
/// otherwise the pattern supplies the first delays and `delay_ms` applies
/// once it is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub delay_ms: u64,
    pub backoff_pattern: Vec<u64>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            backoff_pattern: Vec::new(),
        }
    }
}

impl ReconnectConfig {
    /// Fixed delay between every attempt
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            backoff_pattern: Vec::new(),
        }
    }

    /// Delay before the given 1-based attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.delay_ms)
    }

    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.calculate_backoff_delay(attempt))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.delay_ms == 0 {
            return Err("reconnect delay must be greater than 0".to_string());
        }
        if self.backoff_pattern.contains(&0) {
            return Err("reconnect backoff entries must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Session manager lifecycle errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Shutdown requested before a session was established")]
    ShutdownRequested,
    #[error("Session manager already started")]
    AlreadyStarted,
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
}
