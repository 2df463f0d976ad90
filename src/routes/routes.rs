//! Defines the gateway's HTTP routes.
//!
//! - `GET  /healthz` — liveness
//! - `POST /upload?uploadType=media|resumable[&uploadId=…]` — uploads
//! - `PUT  /upload/{id}` — start replacing the content of an existing file
//! - `POST /copy`, `POST /move`, `POST /shift?type=copy|move` — transfers
//!
//! Every route except `/healthz` expects the caller id in `X-User-Id`.

use crate::{
    handlers::{
        health_handlers::healthz,
        transfer_handlers::{copy_file, move_file, shift},
        upload_handlers::{init_update, upload},
    },
    services::GatewayState,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the router. State is attached by the caller.
pub fn routes() -> Router<GatewayState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/upload", post(upload))
        .route("/upload/{id}", put(init_update))
        .route("/copy", post(copy_file))
        .route("/move", post(move_file))
        .route("/shift", post(shift))
}
