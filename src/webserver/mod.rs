//! HTTP endpoint serving the Prometheus registry.
//!
//! Runtime metrics and user gauges are registered with a
//! [`prometheus::Registry`]; this server exposes one of them in the
//! text exposition format at `/metrics`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use axum::extract::Extension;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::Encoder;
use prometheus::Registry;
use prometheus::TextEncoder;

use crate::errors::StageError;
use crate::errors::StageException;
use crate::errors::StageResult;

/// Environment variable with the port to listen on.
pub const PORT_VAR: &str = "FUNCTIONAL_STAGE_METRICS_PORT";

const DEFAULT_PORT: u16 = 3030;

struct State {
    registry: Registry,
}

/// Port from [`PORT_VAR`], 3030 if unset.
pub fn metrics_port() -> StageResult<u16> {
    match std::env::var(PORT_VAR) {
        Ok(var) => var
            .parse()
            .map_err(|err| StageError::config(format!("Unable to parse {PORT_VAR}={var:?}: {err}"))),
        Err(_) => Ok(DEFAULT_PORT),
    }
}

fn router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .layer(Extension(Arc::new(State { registry })))
}

/// Serve `registry` until the server fails.
pub async fn run_webserver(registry: Registry, port: u16) -> StageResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting metrics server on {addr:?}");

    axum::Server::bind(&addr)
        .serve(router(registry).into_make_service())
        .await
        .map_err(|err| StageError::config(format!("Unable to serve metrics at port {port}: {err}")))
}

/// Serve the default Prometheus registry from a background thread
/// with its own runtime.
pub fn start_metrics_server() -> StageResult<JoinHandle<()>> {
    let port = metrics_port()?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .reraise("error starting metrics server runtime")?;
    let registry = prometheus::default_registry().clone();
    std::thread::Builder::new()
        .name("metrics-server".to_string())
        .spawn(move || {
            if let Err(err) = rt.block_on(run_webserver(registry, port)) {
                tracing::error!("{err}");
            }
        })
        .reraise("error spawning metrics server thread")
}

fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|err| prometheus::Error::Msg(err.to_string()))
}

async fn get_metrics(Extension(state): Extension<Arc<State>>) -> impl IntoResponse {
    let (status, body) = match render(&state.registry) {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let content_type = TextEncoder::new().format_type().to_string();
    (status, [(CONTENT_TYPE, content_type)], body)
}
