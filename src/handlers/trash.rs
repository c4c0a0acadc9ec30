use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use crate::{
    errors::{AppError, Result},
    handlers::AppState,
    middleware::AuthenticatedUser,
    models::TrashEntry,
};

pub async fn delete_file(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(path): Path<String>,
) -> Result<Json<TrashEntry>> {
    let entry = state.trash.soft_delete(&user.username, &path).await?;
    Ok(Json(entry))
}

pub async fn list_trash(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Json<Vec<TrashEntry>> {
    Json(state.trash.list(&user.username))
}

pub async fn restore_entry(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    // other users' entries look the same as missing ones
    match state.trash.get(id) {
        Some(entry) if entry.owner == user.username => {}
        _ => return Err(AppError::EntryNotFound),
    }

    state.trash.restore(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
