//! HTTP handlers for copying and moving files between owners.

use crate::{
    errors::AppError,
    handlers::auth::AuthUser,
    models::transfer::TransferMode,
    services::{
        GatewayState,
        transfer_service::{TransferOutcome, TransferRequest},
    },
};
use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;

/// Body of `/copy`, `/move` and `/shift`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReq {
    pub file_id: String,
    /// The destination owner.
    pub user_id: String,
    #[serde(default)]
    pub new_parent: String,
}

#[derive(Debug, Deserialize)]
pub struct ShiftQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// `POST /copy`
pub async fn copy_file(
    State(state): State<GatewayState>,
    AuthUser(user): AuthUser,
    Json(req): Json<TransferReq>,
) -> Result<Json<TransferOutcome>, AppError> {
    run(state, user, req, TransferMode::Copy).await
}

/// `POST /move`
pub async fn move_file(
    State(state): State<GatewayState>,
    AuthUser(user): AuthUser,
    Json(req): Json<TransferReq>,
) -> Result<Json<TransferOutcome>, AppError> {
    run(state, user, req, TransferMode::Move).await
}

/// `POST /shift?type=copy|move`
pub async fn shift(
    State(state): State<GatewayState>,
    AuthUser(user): AuthUser,
    Query(query): Query<ShiftQuery>,
    Json(req): Json<TransferReq>,
) -> Result<Json<TransferOutcome>, AppError> {
    let mode = query
        .kind
        .ok_or_else(|| AppError::bad_request("type query parameter is required"))?
        .parse::<TransferMode>()
        .map_err(AppError::bad_request)?;
    run(state, user, req, mode).await
}

async fn run(
    state: GatewayState,
    user: String,
    req: TransferReq,
    mode: TransferMode,
) -> Result<Json<TransferOutcome>, AppError> {
    let outcome = state
        .transfers
        .transfer(TransferRequest {
            requester_id: user,
            file_id: req.file_id,
            dest_owner_id: req.user_id,
            new_parent_id: req.new_parent,
            mode,
        })
        .await?;
    Ok(Json(outcome))
}
