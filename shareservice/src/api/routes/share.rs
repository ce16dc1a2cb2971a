//! Share routes.
//!
//! The photobooth and the download page talk to a single script-style
//! endpoint that dispatches on the `action` field:
//!
//! - `upload` (POST multipart): producer delivers the file for a claimed job
//! - `upload_queue` (GET/POST): producer's long poll for jobs
//! - `download` (GET): viewer waits for and receives the artifact
//! - `info` (GET): protocol version and service name
//! - `list` (GET): all jobs, for diagnosis

use std::convert::Infallible;
use std::path::Path;

use axum::body::{Body, Bytes};
use axum::extract::multipart::Field;
use axum::extract::{Form, FromRequest, Multipart, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use tracing::{info, warn};

use crate::api::error::{ApiError, ApiResult, ErrorFormat};
use crate::api::models::{InfoResponse, ShareParams};
use crate::api::server::AppState;
use crate::config::{PROTOCOL_VERSION, SERVICE_NAME};
use crate::database::models::ShareJobRecord;
use crate::handshake::{StagedUpload, TransportFile, UploadRequest};

/// Create the share router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(share_get).post(share_post))
        .route("/dl.php", get(share_get).post(share_post))
}

async fn share_get(
    State(state): State<AppState>,
    Query(params): Query<ShareParams>,
    headers: HeaderMap,
) -> Response {
    dispatch(state, params, None, headers).await
}

async fn share_post(
    State(state): State<AppState>,
    Query(query): Query<ShareParams>,
    headers: HeaderMap,
    request: Request,
) -> Response {
    let is_multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let (params, file) = if is_multipart {
        match Multipart::from_request(request, &state).await {
            Ok(multipart) => read_multipart(&state.config.staging_dir(), multipart).await,
            Err(rejection) => (
                ShareParams::default(),
                TransportFile::Failed(rejection.body_text()),
            ),
        }
    } else {
        match Form::<ShareParams>::from_request(request, &state).await {
            Ok(Form(params)) => (params, TransportFile::Missing),
            Err(rejection) => {
                let format = ErrorFormat::negotiate(query.action.as_deref(), &headers);
                return ApiError::bad_request(rejection.body_text())
                    .with_format(format)
                    .into_response();
            }
        }
    };

    dispatch(state, query.merge(params), Some(file), headers).await
}

/// Route a request to its action and render failures for the caller.
///
/// `file` is `None` for GET requests, which can never carry an upload.
async fn dispatch(
    state: AppState,
    params: ShareParams,
    file: Option<TransportFile>,
    headers: HeaderMap,
) -> Response {
    let format = ErrorFormat::negotiate(params.action.as_deref(), &headers);
    let action = params.action.as_deref().unwrap_or_default();
    let file_identifier = params.identifier().unwrap_or_default();

    let result = match (action, params.identifier(), file) {
        ("upload", Some(id), Some(file)) => upload(&state, id, params.apikey.clone(), file).await,
        ("upload_queue", _, _) => upload_queue(&state, params.apikey.as_deref()),
        ("download", Some(id), _) => download(&state, id).await,
        ("info", _, _) => Ok(info()),
        ("list", _, _) => list(&state, params.apikey.as_deref()).await,
        _ => {
            warn!(action, file_identifier, "endpoint does not exist");
            Err(ApiError::not_acceptable("endpoint does not exist"))
        }
    };

    match result {
        Ok(response) => response,
        Err(err) => {
            if err.status.is_server_error() {
                warn!(action, file_identifier, status = %err.status, "runtime error: {}", err.message);
            } else {
                info!(action, file_identifier, status = %err.status, "request rejected: {}", err.message);
            }
            err.with_format(format).into_response()
        }
    }
}

/// Collect the form fields and stage the `upload_file` part.
async fn read_multipart(staging_dir: &Path, mut multipart: Multipart) -> (ShareParams, TransportFile) {
    let mut params = ShareParams::default();
    let mut file = TransportFile::Missing;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                file = TransportFile::Failed(e.body_text());
                break;
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        let slot = match name.as_str() {
            "upload_file" => {
                file = stage_field(staging_dir, field).await;
                continue;
            }
            "action" => &mut params.action,
            "id" => &mut params.id,
            "apikey" => &mut params.apikey,
            // Unknown parts are skipped by the next `next_field` call.
            _ => continue,
        };
        match field.text().await {
            Ok(value) => *slot = Some(value),
            Err(e) => {
                file = TransportFile::Failed(e.body_text());
                break;
            }
        }
    }

    (params, file)
}

async fn stage_field(staging_dir: &Path, mut field: Field<'_>) -> TransportFile {
    let mut staged = match StagedUpload::create(staging_dir).await {
        Ok(staged) => staged,
        Err(e) => return TransportFile::Failed(e.to_string()),
    };

    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                if let Err(e) = staged.write_chunk(&chunk).await {
                    return TransportFile::Failed(e.to_string());
                }
            }
            Ok(None) => break,
            Err(e) => return TransportFile::Failed(e.body_text()),
        }
    }

    match staged.finish().await {
        Ok(file) => TransportFile::Received(file),
        Err(e) => TransportFile::Failed(e.to_string()),
    }
}

async fn upload(
    state: &AppState,
    file_identifier: &str,
    api_key: Option<String>,
    file: TransportFile,
) -> ApiResult<Response> {
    let receipt = state
        .upload_handler
        .handle(UploadRequest {
            file_identifier: file_identifier.to_string(),
            api_key,
            file,
        })
        .await?;

    info!(
        file_identifier = %receipt.file_identifier,
        filename = %receipt.filename,
        "Upload accepted"
    );
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "file successfully saved and ready to download",
    )
        .into_response())
}

fn upload_queue(state: &AppState, api_key: Option<&str>) -> ApiResult<Response> {
    state.config.verify_api_key(api_key)?;
    info!("Producer connected to the upload queue");

    let stream = state
        .claim_poller
        .clone()
        .into_stream()
        .take_until(state.shutdown.clone().cancelled_owned())
        .map(|event| Ok::<_, Infallible>(Bytes::from(event.to_line())));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        // Keep nginx from buffering the frames of the long poll.
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal(e.to_string()))
}

async fn download(state: &AppState, file_identifier: &str) -> ApiResult<Response> {
    state.config.ensure_api_key_configured()?;

    let file = state
        .download_waiter
        .wait_for_upload(file_identifier)
        .await?;

    let disposition = HeaderValue::from_str(&format!("inline; filename=\"{}\"", file.filename))
        .unwrap_or_else(|_| HeaderValue::from_static("inline"));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(file.mimetype)),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        file.content,
    )
        .into_response())
}

fn info() -> Response {
    Json(InfoResponse {
        version: PROTOCOL_VERSION,
        name: SERVICE_NAME.to_string(),
    })
    .into_response()
}

async fn list(state: &AppState, api_key: Option<&str>) -> ApiResult<Response> {
    state.config.verify_api_key(api_key)?;

    let jobs: Vec<ShareJobRecord> = state
        .repository
        .list_jobs()
        .await?
        .iter()
        .map(ShareJobRecord::from)
        .collect();

    Ok(Json(jobs).into_response())
}
