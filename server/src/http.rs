//! HTTP glue: login, logout and a server state summary.
//!
//! - `GET /get-worker-port/:user_id/:client_port` pulls a worker, binds it
//!   to the caller and answers with the worker's port as plain text
//! - `PATCH /disconnect/:user_id` returns the user's worker to the pool
//! - `GET /server-state` reports idle workers and remaining resources

use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use axum::{Json, Router};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::game::SharedWorld;
use crate::worker_pool::WorkerPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<WorkerPool>,
    pub world: SharedWorld,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerState {
    pub worker_count: usize,
    pub coin_count: usize,
    pub item_count: usize,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if !self.is_recoverable() {
            error!("Request failed: {}", self);
        }
        let status = match &self {
            Error::Capacity | Error::UserAlreadyBound(_) => StatusCode::CONFLICT,
            Error::InvalidClientInformation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/get-worker-port/:user_id/:client_port", get(get_worker_port))
        .route("/disconnect/:user_id", patch(disconnect))
        .route("/server-state", get(server_state))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> io::Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn get_worker_port(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((user_id, client_port)): Path<(String, String)>,
) -> Result<String, Error> {
    let client_port = client_port
        .parse::<u16>()
        .ok()
        .filter(|&port| port != 0)
        .ok_or(Error::InvalidClientInformation("client port"))?;
    info!("Login from {} (userId={} clientPort={})", remote.ip(), user_id, client_port);

    if state.pool.get_by_user_id(&user_id).is_ok() {
        return Err(Error::UserAlreadyBound(user_id));
    }

    let worker = state.pool.pull().map_err(|e| {
        warn!("Rejecting login of {}: {}", user_id, e);
        e
    })?;

    let bound = worker
        .set_client_information(&user_id, remote.ip(), client_port)
        .and_then(|()| worker.start_send_user_related_data_to_client());
    if let Err(e) = bound {
        error!("Binding worker {} to {} failed: {}", worker.id(), user_id, e);
        state.pool.put(worker.id())?;
        return Err(e);
    }

    state.world.register_score(&user_id);
    Ok(worker.port().to_string())
}

async fn disconnect(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<&'static str, Error> {
    let (id, _) = state.pool.get_by_user_id(&user_id)?;
    state.pool.put_owned(id, &user_id)?;
    state.world.deregister(&user_id);

    info!("User {} disconnected from worker {}", user_id, id);
    Ok("worker successfully returned to pool")
}

async fn server_state(State(state): State<AppState>) -> Json<ServerState> {
    Json(ServerState {
        worker_count: state.pool.available_count(),
        coin_count: state.world.coin_count(),
        item_count: state.world.item_count(),
    })
}
