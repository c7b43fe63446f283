//! HTTP front door
//!
//! `POST /tasks` accepts a JSON task document and answers with a
//! `{"Status": ...}` result once the broker has confirmed or refused the
//! publish. The health endpoints share the same listener.

use crate::error::{BridgeError, ErrorKind};
use crate::gateway::TaskPublisher;
use crate::observability::health_routes;
use crate::protocol::{Task, TaskResult};
use bytes::Bytes;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Largest accepted request body
pub const MAX_BODY_BYTES: u64 = 1024 * 1024;

fn with_publisher(
    publisher: Arc<dyn TaskPublisher>,
) -> impl Filter<Extract = (Arc<dyn TaskPublisher>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&publisher))
}

/// `POST /tasks`
pub fn task_route(
    publisher: Arc<dyn TaskPublisher>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path("tasks")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_publisher(publisher))
        .and_then(handle_submit)
}

/// Every route the bridge serves, with rejections rendered as failure documents
pub fn routes(
    publisher: Arc<dyn TaskPublisher>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    task_route(Arc::clone(&publisher))
        .or(health_routes(publisher))
        .recover(handle_rejection)
}

async fn handle_submit(
    body: Bytes,
    publisher: Arc<dyn TaskPublisher>,
) -> Result<impl Reply, Infallible> {
    let result = match serde_json::from_slice::<Task>(&body) {
        Ok(task) => {
            debug!(task = %task.name, args = task.args.len(), "Task request received");
            // Run the publish on its own task so a client hanging up does not
            // abandon a channel mid-publish
            match tokio::spawn(async move { publisher.submit(task).await }).await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Submission task aborted");
                    TaskResult::failure(ErrorKind::Publish, "submission aborted")
                }
            }
        }
        Err(e) => {
            debug!(error = %e, "Rejected malformed task request");
            TaskResult::failure(ErrorKind::Encoding, format!("malformed request: {e}"))
        }
    };

    Ok(result_reply(&result))
}

fn result_reply(result: &TaskResult) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = result
        .kind
        .map(|kind| {
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        })
        .unwrap_or(StatusCode::OK);

    warp::reply::with_status(warp::reply::json(result), status)
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if rejection
        .find::<warp::reject::PayloadTooLarge>()
        .is_some()
    {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("request body exceeds {MAX_BODY_BYTES} bytes"),
        )
    } else if rejection.find::<warp::reject::LengthRequired>().is_some() {
        (
            StatusCode::LENGTH_REQUIRED,
            "content-length header required".to_string(),
        )
    } else if rejection
        .find::<warp::reject::MethodNotAllowed>()
        .is_some()
    {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed".to_string(),
        )
    } else {
        error!(rejection = ?rejection, "Unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        )
    };

    let body = json!({ "Status": "failure", "Error": message });
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

/// Bind the listener. The returned future serves requests until `shutdown`
/// resolves and in-flight requests have drained.
pub fn bind<F>(
    addr: SocketAddr,
    publisher: Arc<dyn TaskPublisher>,
    shutdown: F,
) -> Result<(SocketAddr, impl Future<Output = ()>), BridgeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (bound, server) = warp::serve(routes(publisher))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| BridgeError::http(format!("failed to bind {addr}: {e}")))?;

    info!(address = %bound, "HTTP listener bound");
    Ok((bound, server))
}
