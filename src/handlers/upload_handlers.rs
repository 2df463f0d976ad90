//! HTTP handlers for uploads.
//!
//! `POST /upload` dispatches on `uploadType`:
//! - `media`: the whole (small) body is the content;
//! - `resumable` without `uploadId`: start a session;
//! - `resumable` with `uploadId`: stream the body into the session.
//!
//! Bodies of part transfers are streamed, never buffered whole.

use crate::{
    errors::AppError,
    handlers::auth::AuthUser,
    models::file::File,
    services::{
        GatewayState,
        upload_service::{InitUpload, MAX_MEDIA_BYTES},
    },
};
use axum::{
    Json,
    body::{Body, to_bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;

pub const UPLOAD_LENGTH_HEADER: &str = "x-upload-content-length";
pub const UPLOAD_TYPE_HEADER: &str = "x-upload-content-type";
pub const UPLOAD_ID_HEADER: &str = "x-upload-id";

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
const MAX_METADATA_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    pub upload_type: Option<String>,
    pub upload_id: Option<String>,
    /// File name, for media uploads.
    pub title: Option<String>,
    /// Parent folder, for media uploads.
    pub parent: Option<String>,
}

/// Metadata sent with a resumable upload init.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadataReq {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub parent: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitResponse {
    upload_id: String,
}

/// A parsed `Content-Range: bytes {start}-{end}/{total}` header.
#[derive(Debug, PartialEq, Eq)]
pub struct ContentRange {
    pub start: i64,
    /// `None` for `bytes */{total}`.
    pub end: Option<i64>,
    pub total: i64,
}

/// `POST /upload?uploadType=…`
pub async fn upload(
    State(state): State<GatewayState>,
    AuthUser(user): AuthUser,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    match (query.upload_type.as_deref(), query.upload_id) {
        (Some("media"), _) => {
            let req = InitUpload {
                name: query.title.unwrap_or_default(),
                mime_type: content_type(&headers).unwrap_or_else(|| DEFAULT_MIME_TYPE.into()),
                declared_size: 0,
                parent_id: query.parent.unwrap_or_default(),
            };
            let data = to_bytes(body, MAX_MEDIA_BYTES).await.map_err(|err| {
                AppError::new(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("media body rejected: {}", err),
                )
            })?;
            let file = state.uploads.upload_media(&user, req, data).await?;
            Ok((StatusCode::CREATED, Json(file)).into_response())
        }
        (Some("resumable"), None) => init_resumable(state, &user, &headers, body).await,
        (Some("resumable"), Some(upload_id)) => {
            let file = transfer_parts(state, &user, &upload_id, &headers, body).await?;
            Ok((StatusCode::OK, Json(file)).into_response())
        }
        (other, _) => Err(AppError::bad_request(format!(
            "unsupported uploadType {:?}",
            other.unwrap_or("")
        ))),
    }
}

/// `PUT /upload/{id}`: start a session replacing the content of file `id`.
pub async fn init_update(
    State(state): State<GatewayState>,
    AuthUser(user): AuthUser,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let declared_size = declared_length(&headers)?;
    let mime_type = header_str(&headers, UPLOAD_TYPE_HEADER).map(str::to_string);
    let session = state
        .uploads
        .init_update(&user, &file_id, declared_size, mime_type)
        .await?;
    session_response(session.upload_id)
}

async fn init_resumable(
    state: GatewayState,
    user: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let declared_size = declared_length(headers)?;
    let raw = to_bytes(body, MAX_METADATA_BYTES)
        .await
        .map_err(|err| AppError::bad_request(format!("reading metadata: {}", err)))?;
    let meta: FileMetadataReq = if raw.is_empty() {
        FileMetadataReq::default()
    } else {
        serde_json::from_slice(&raw)
            .map_err(|err| AppError::bad_request(format!("invalid metadata: {}", err)))?
    };

    let mime_type = if meta.mime_type.is_empty() {
        header_str(headers, UPLOAD_TYPE_HEADER)
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string()
    } else {
        meta.mime_type
    };
    let session = state
        .uploads
        .init(
            user,
            InitUpload {
                name: meta.title,
                mime_type,
                declared_size,
                parent_id: meta.parent,
            },
        )
        .await?;
    session_response(session.upload_id)
}

async fn transfer_parts(
    state: GatewayState,
    user: &str,
    upload_id: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<File, AppError> {
    let expected_total = match header_str(headers, header::CONTENT_RANGE.as_str()) {
        Some(value) => {
            let range = parse_content_range(value).map_err(AppError::bad_request)?;
            check_whole_body(&range)?;
            Some(range.total)
        }
        None => None,
    };

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));
    let file = state
        .uploads
        .transfer_parts(user, upload_id, expected_total, stream)
        .await?;
    Ok(file)
}

/// Sessions take their content in one request: the window must span the
/// whole body.
fn check_whole_body(range: &ContentRange) -> Result<(), AppError> {
    if range.start != 0 {
        return Err(AppError::bad_request(format!(
            "resuming from byte {} is not supported",
            range.start
        )));
    }
    let last = range.total - 1;
    match range.end {
        Some(end) if end == last => Ok(()),
        None if range.total == 0 => Ok(()),
        Some(end) => Err(AppError::bad_request(format!(
            "chunk ending at byte {} of {} is not supported, send the whole body",
            end, range.total
        ))),
        None => Err(AppError::bad_request(format!(
            "bytes */{} carries no content",
            range.total
        ))),
    }
}

fn session_response(upload_id: String) -> Result<Response, AppError> {
    let value = HeaderValue::from_str(&upload_id)
        .map_err(|err| AppError::internal(format!("invalid upload id: {}", err)))?;
    Ok((
        StatusCode::OK,
        [(HeaderName::from_static(UPLOAD_ID_HEADER), value)],
        Json(InitResponse { upload_id }),
    )
        .into_response())
}

fn declared_length(headers: &HeaderMap) -> Result<i64, AppError> {
    let value = header_str(headers, UPLOAD_LENGTH_HEADER)
        .ok_or_else(|| AppError::bad_request(format!("{} header is required", UPLOAD_LENGTH_HEADER)))?;
    value
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|size| *size >= 0)
        .ok_or_else(|| AppError::bad_request(format!("invalid upload length `{}`", value)))
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    header_str(headers, header::CONTENT_TYPE.as_str()).map(str::to_string)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse `bytes {start}-{end}/{total}` or `bytes */{total}`.
pub fn parse_content_range(value: &str) -> Result<ContentRange, String> {
    let invalid = || format!("invalid content range `{}`", value);
    let spec = value.trim().strip_prefix("bytes ").ok_or_else(invalid)?;
    let (range, total) = spec.split_once('/').ok_or_else(invalid)?;
    let total = total.trim().parse::<i64>().map_err(|_| invalid())?;
    if total < 0 {
        return Err(invalid());
    }

    if range.trim() == "*" {
        return Ok(ContentRange {
            start: 0,
            end: None,
            total,
        });
    }
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start = start.trim().parse::<i64>().map_err(|_| invalid())?;
    let end = end.trim().parse::<i64>().map_err(|_| invalid())?;
    if start < 0 || end < start || end >= total {
        return Err(invalid());
    }
    Ok(ContentRange {
        start,
        end: Some(end),
        total,
    })
}
