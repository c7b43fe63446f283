//! Health, readiness, liveness and metrics endpoints
//!
//! Served on the same listener as the task API.

use crate::gateway::TaskPublisher;
use crate::observability::metrics::metrics;
use crate::transport::ConnectionState;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn new(healthy: bool, message: String) -> Self {
        Self {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            message: Some(message),
            last_check: current_timestamp(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub connection_state: String,
    pub checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    state: String,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

/// Broker check: healthy only while a session is live
pub fn check_broker(state: &ConnectionState) -> HealthCheck {
    match state {
        ConnectionState::Live => HealthCheck::new(true, "Broker session live".to_string()),
        other => HealthCheck::new(false, format!("Broker session {other}")),
    }
}

/// Publish check: unhealthy when every submission since startup has failed
/// at the broker
pub fn check_publishing() -> HealthCheck {
    let tasks = metrics().get_metrics().tasks;
    let broker_failures = tasks.channel_failures + tasks.publish_failures;

    if tasks.published == 0 && broker_failures > 0 {
        HealthCheck::new(
            false,
            format!("{broker_failures} submissions failed, none published"),
        )
    } else {
        HealthCheck::new(true, format!("{} tasks published", tasks.published))
    }
}

pub fn health_status(publisher: &dyn TaskPublisher) -> HealthStatus {
    let state = publisher.connection_state();

    let mut checks = HashMap::new();
    checks.insert("broker".to_string(), check_broker(&state));
    checks.insert("publishing".to_string(), check_publishing());

    let healthy = checks.values().all(|check| check.status == "healthy");

    HealthStatus {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: current_timestamp(),
        uptime_seconds: metrics().get_metrics().uptime_seconds,
        connection_state: state.to_string(),
        checks,
    }
}

fn with_publisher(
    publisher: Arc<dyn TaskPublisher>,
) -> impl Filter<Extract = (Arc<dyn TaskPublisher>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&publisher))
}

/// `GET /health`, `GET /ready`, `GET /live` and `GET /metrics`
pub fn health_routes(
    publisher: Arc<dyn TaskPublisher>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_publisher(Arc::clone(&publisher)))
        .map(|publisher: Arc<dyn TaskPublisher>| {
            let status = health_status(publisher.as_ref());
            let code = if status.status == "healthy" {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            warp::reply::with_status(warp::reply::json(&status), code)
        });

    let ready = warp::path("ready")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_publisher(publisher))
        .map(|publisher: Arc<dyn TaskPublisher>| {
            let state = publisher.connection_state();
            let response = ReadinessResponse {
                ready: state.is_live(),
                state: state.to_string(),
                timestamp: current_timestamp(),
            };
            let code = if response.ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            warp::reply::with_status(warp::reply::json(&response), code)
        });

    let live = warp::path("live")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

    let metrics_route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::json(&metrics().get_metrics()));

    health
        .or(ready)
        .unify()
        .or(live.map(|reply| warp::reply::with_status(reply, StatusCode::OK)))
        .unify()
        .or(metrics_route.map(|reply| warp::reply::with_status(reply, StatusCode::OK)))
        .unify()
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Task, TaskResult};
    use async_trait::async_trait;

    struct FixedState(ConnectionState);

    #[async_trait]
    impl TaskPublisher for FixedState {
        async fn submit(&self, _task: Task) -> TaskResult {
            TaskResult::success()
        }

        fn connection_state(&self) -> ConnectionState {
            self.0.clone()
        }
    }

    fn publisher(state: ConnectionState) -> Arc<dyn TaskPublisher> {
        Arc::new(FixedState(state))
    }

    #[test]
    fn test_broker_check() {
        assert_eq!(check_broker(&ConnectionState::Live).status, "healthy");

        let check = check_broker(&ConnectionState::Connecting { attempt: 3 });
        assert_eq!(check.status, "unhealthy");
        assert!(check.message.unwrap().contains("attempt 3"));
    }

    #[tokio::test]
    async fn test_ready_follows_session_state() {
        let live = health_routes(publisher(ConnectionState::Live));
        let response = warp::test::request().path("/ready").reply(&live).await;
        assert_eq!(response.status(), StatusCode::OK);

        let down = health_routes(publisher(ConnectionState::Disconnected(
            "refused".to_string(),
        )));
        let response = warp::test::request().path("/ready").reply(&down).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["ready"], false);
        assert_eq!(body["state"], "disconnected (refused)");
    }

    #[tokio::test]
    async fn test_health_degraded_without_session() {
        let routes = health_routes(publisher(ConnectionState::Closing));
        let response = warp::test::request().path("/health").reply(&routes).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["checks"]["broker"]["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_live_and_metrics() {
        let routes = health_routes(publisher(ConnectionState::Closing));

        let response = warp::test::request().path("/live").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = warp::test::request().path("/metrics").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body["tasks"]["received"].is_u64());
    }
}
