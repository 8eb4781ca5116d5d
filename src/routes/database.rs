//! Database schema route handlers

use crate::error::{AppError, AppResult};
use crate::models::Database;
use crate::schema::SchemaSnapshot;
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaResponse {
    pub success: bool,
    pub database: Database,
    pub schema: SchemaSnapshot,
}

/// GET /api/databases/{id}/schema
///
/// Latest snapshot published by a successful sync.
pub async fn get_schema(
    State(state): State<SharedState>,
    Path(id): Path<i32>,
) -> AppResult<Json<SchemaResponse>> {
    let database = state
        .store
        .get_database(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("database {} not found", id)))?;
    let schema = state
        .store
        .find_schema(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("database {:?} has not been synced yet", database.name)))?;

    Ok(Json(SchemaResponse {
        success: true,
        database,
        schema,
    }))
}
