//! Secure broker sessions
//!
//! The TLS handshake is driven by our own rustls client configuration so the
//! broker certificate is checked against the configured server identity rather
//! than the host we dial.

use super::channel::AmqpChannel;
use crate::transport::{Broker, BrokerSession, CloseSignal, TransportConfig, TransportError};
use async_trait::async_trait;
use lapin::tcp::{HandshakeError, HandshakeResult, RustlsConnector, TcpStream};
use lapin::uri::AMQPUri;
use lapin::{Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CONNECTION_NAME: &str = "celery-bridge";

/// Opens sessions against the broker described by a [`TransportConfig`]
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    config: Arc<TransportConfig>,
}

impl AmqpBroker {
    pub fn new(config: Arc<TransportConfig>) -> Self {
        Self { config }
    }

    fn parse_uri(&self) -> Result<AMQPUri, TransportError> {
        self.config.uri.parse::<AMQPUri>().map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "invalid broker URI {}: {e}",
                self.config.redacted_uri()
            ))
        })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Session = AmqpSession;

    async fn connect(&self) -> Result<AmqpSession, TransportError> {
        let uri = self.parse_uri()?;
        let host = self.config.host.clone();
        let port = self.config.port;
        let server_name = self.config.server_name.clone();
        let tls = RustlsConnector::from(self.config.tls.clone());

        debug!(broker = %self.endpoint(), server_name = %server_name, "Opening TLS connection");

        let connector = Box::new(move |_: &AMQPUri| -> HandshakeResult {
            TcpStream::connect((host.as_str(), port))
                .map_err(HandshakeError::Failure)?
                .into_rustls(&tls, &server_name)
        });

        let properties =
            ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into());

        let connection = Connection::connector(uri, connector, properties)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        info!(broker = %self.endpoint(), "Broker session established");
        Ok(AmqpSession::new(connection))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

/// One live lapin connection
pub struct AmqpSession {
    connection: Connection,
    close_signal: CloseSignal,
}

impl AmqpSession {
    fn new(connection: Connection) -> Self {
        let close_signal = CloseSignal::new();

        let signal = close_signal.clone();
        connection.on_error(move |error| {
            warn!(error = %error, "Broker connection error");
            signal.close(error.to_string());
        });

        Self {
            connection,
            close_signal,
        }
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    type Channel = AmqpChannel;

    async fn create_channel(&self) -> Result<AmqpChannel, TransportError> {
        if let Some(reason) = self.close_signal.reason() {
            return Err(TransportError::SessionClosed(reason));
        }

        match self.connection.create_channel().await {
            Ok(channel) => AmqpChannel::open(channel).await,
            Err(e) => {
                // A dead connection is only reported through on_error when the
                // heartbeat notices; record it here as well
                if !self.connection.status().connected() {
                    self.close_signal.close(e.to_string());
                }
                Err(TransportError::ChannelFailed(e.to_string()))
            }
        }
    }

    fn close_signal(&self) -> &CloseSignal {
        &self.close_signal
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.close_signal.close("session closed by bridge") {
            return Ok(());
        }
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "bridge shutting down")
            .await
            .map_err(|e| TransportError::CloseFailed(e.to_string()))
    }

    /// A broker close with a non-error reply code never reaches `on_error`,
    /// so a dead connection found here is recorded on the close signal too
    fn is_live(&self) -> bool {
        if self.close_signal.is_closed() {
            return false;
        }
        if !self.connection.status().connected() {
            self.close_signal.close("connection closed by broker");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use std::time::Duration;

    fn unreachable_broker() -> AmqpBroker {
        let config = BridgeConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..BridgeConfig::test_config()
        };
        AmqpBroker::new(Arc::new(
            TransportConfig::from_bridge_config(&config).unwrap(),
        ))
    }

    #[test]
    fn test_endpoint_has_no_credentials() {
        let broker = unreachable_broker();
        assert_eq!(broker.endpoint(), "127.0.0.1:1");
    }

    #[test]
    fn test_uri_parses() {
        let uri = unreachable_broker().parse_uri().unwrap();
        assert_eq!(uri.authority.host, "127.0.0.1");
        assert_eq!(uri.authority.port, 1);
        assert_eq!(uri.authority.userinfo.username, "admin");
        assert_eq!(uri.vhost, "/");
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_failure() {
        let broker = unreachable_broker();
        let result = tokio::time::timeout(Duration::from_secs(10), broker.connect())
            .await
            .expect("refused connection should fail fast");

        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
