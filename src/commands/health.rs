use crate::bot::types::RunState;
use crate::{error::AppError, state::AppState};
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub bot: RunState,
}

pub async fn build_health_response(
    started_at: Instant,
    pool: &SqlitePool,
    bot: RunState,
) -> HealthResponse {
    let db_status = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "error",
    };

    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        db: db_status,
        bot,
    }
}

pub async fn handle_health(state: &AppState) -> Result<HealthResponse, AppError> {
    Ok(build_health_response(state.started_at, &state.db_pool, state.bot.state()).await)
}

#[cfg(feature = "desktop")]
#[tauri::command]
pub async fn health(state: tauri::State<'_, AppState>) -> Result<HealthResponse, AppError> {
    handle_health(&state).await
}
