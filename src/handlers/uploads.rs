use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    errors::{AppError, Result},
    handlers::AppState,
    middleware::{
        AuthenticatedUser, OFFSET_OCTET_STREAM, TUS_EXTENSION, TUS_EXTENSIONS, TUS_MAX_SIZE,
        TUS_VERSION, TUS_VERSION_HEADER, UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET,
    },
    models::{NewUpload, UploadInfo, UploadMetadata, UploadSession},
};

pub async fn options_uploads(State(state): State<AppState>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
    headers.insert(TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS));
    headers.insert(TUS_MAX_SIZE, HeaderValue::from(state.config.max_upload_size));

    (StatusCode::NO_CONTENT, headers).into_response()
}

pub async fn list_uploads(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Json<Vec<UploadInfo>> {
    Json(state.uploads.list(&user.username).await)
}

pub async fn create_upload(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let declared_length: u64 = required_header(&headers, &UPLOAD_LENGTH)?;
    let metadata = match headers.get(&UPLOAD_METADATA) {
        Some(value) => UploadMetadata::parse(header_str(value, &UPLOAD_METADATA)?)?,
        None => UploadMetadata::default(),
    };

    if let Some(username) = metadata.username.as_deref() {
        if username != user.username {
            return Err(AppError::Forbidden);
        }
    }

    let target_path = metadata
        .target_path()
        .ok_or_else(|| AppError::Validation("Upload-Metadata must name a filename or path".to_string()))?;

    if !body.is_empty() {
        require_offset_content_type(&headers)?;
        if body.len() as u64 > declared_length {
            return Err(AppError::UploadTooLarge {
                max: declared_length,
            });
        }
    }

    let mut session = state
        .uploads
        .create(NewUpload {
            owner: user.username.clone(),
            target_path,
            declared_length,
            metadata,
            client_addr: client_addr(&headers, connect_info, state.config.trust_forwarded_for),
        })
        .await?;

    // creation-with-upload; the client has no Location yet, so a failed
    // first chunk must not leave the reservation behind
    if !body.is_empty() && !session.status.is_terminal() {
        session = match state.uploads.append(session.id, 0, &body).await {
            Ok(session) => session,
            Err(e) => {
                if let Err(abort_err) = state.uploads.abort(session.id).await {
                    debug!(upload = %session.id, error = %abort_err, "session already closed");
                }
                return Err(e);
            }
        };
    }

    let mut response_headers = offset_headers(&session);
    response_headers.insert(
        header::LOCATION,
        HeaderValue::from_str(&format!("/api/uploads/{}", session.id))
            .map_err(|e| AppError::Internal(e.into()))?,
    );

    Ok((StatusCode::CREATED, response_headers).into_response())
}

pub async fn head_upload(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Response> {
    authorize(&state, id, &user)?;
    let session = state.uploads.status(id).await?;

    let mut headers = offset_headers(&session);
    headers.insert(UPLOAD_LENGTH, HeaderValue::from(session.declared_length));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    Ok((StatusCode::OK, headers).into_response())
}

pub async fn patch_upload(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    authorize(&state, id, &user)?;
    require_offset_content_type(&headers)?;
    let offset: u64 = required_header(&headers, &UPLOAD_OFFSET)?;

    let session = state.uploads.append(id, offset, &body).await?;

    Ok((StatusCode::NO_CONTENT, offset_headers(&session)).into_response())
}

pub async fn delete_upload(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    authorize(&state, id, &user)?;
    state.uploads.abort(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Sessions of other users are reported as missing.
fn authorize(state: &AppState, id: Uuid, user: &AuthenticatedUser) -> Result<()> {
    match state.uploads.owner_of(id) {
        Some(owner) if owner == user.username => Ok(()),
        _ => Err(AppError::SessionNotFound),
    }
}

fn offset_headers(session: &UploadSession) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(UPLOAD_OFFSET, HeaderValue::from(session.bytes_received));
    headers
}

fn header_str<'a>(value: &'a HeaderValue, name: &header::HeaderName) -> Result<&'a str> {
    value
        .to_str()
        .map_err(|_| AppError::Validation(format!("{} is not valid ASCII", name)))
}

fn required_header<T: FromStr>(headers: &HeaderMap, name: &header::HeaderName) -> Result<T> {
    let value = headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("missing {} header", name)))?;

    header_str(value, name)?
        .trim()
        .parse()
        .map_err(|_| AppError::Validation(format!("invalid {} header", name)))
}

fn require_offset_content_type(headers: &HeaderMap) -> Result<()> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if content_type.trim().eq_ignore_ascii_case(OFFSET_OCTET_STREAM) {
        Ok(())
    } else {
        Err(AppError::UnsupportedMediaType)
    }
}

/// The socket peer, or the first `X-Forwarded-For` hop when the server sits
/// behind a trusted proxy.
fn client_addr(
    headers: &HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    trust_forwarded_for: bool,
) -> Option<IpAddr> {
    let forwarded = || {
        headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok())
    };

    trust_forwarded_for
        .then(forwarded)
        .flatten()
        .or_else(|| connect_info.map(|ConnectInfo(addr)| addr.ip()))
}
