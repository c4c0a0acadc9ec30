use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::Deserialize;

use crate::{
    errors::Result, handlers::AppState, middleware::AuthenticatedUser, models::UsageReport,
};

#[derive(Debug, Default, Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    pub refresh: bool,
}

pub async fn get_usage(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageReport>> {
    let report = if query.refresh {
        state.usage.refresh_user_usage(&user.username).await?
    } else {
        state.usage.get_user_usage(&user.username).await?
    };

    Ok(Json(report))
}
