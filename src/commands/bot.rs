use crate::bot::types::{
    BotStatus, BotStopResult, Credentials, Snapshot, StartBotArgs, StartOutcome,
};
use crate::error::AppError;
use crate::state::AppState;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotStartResult {
    pub outcome: StartOutcome,
    pub status: BotStatus,
}

/// Explicit credentials win; otherwise the stored record is used. Missing credentials
/// are left for the controller to reject.
async fn resolve_credentials(
    state: &AppState,
    explicit: Option<Credentials>,
) -> Result<Credentials, AppError> {
    if let Some(credentials) = explicit {
        return Ok(credentials);
    }

    let stored = state.credential_store.load().await?;
    debug!(found = stored.is_some(), "start_bot using stored credentials");
    Ok(stored.unwrap_or_default())
}

pub async fn handle_start_bot(
    state: &AppState,
    args: Option<StartBotArgs>,
) -> Result<BotStartResult, AppError> {
    let args = args.unwrap_or_default();
    let config = args.config.unwrap_or_default().normalize()?;
    let credentials = resolve_credentials(state, args.credentials).await?;

    let outcome = state.bot.start(&credentials, &config).await?;
    Ok(BotStartResult {
        outcome,
        status: state.bot.status(),
    })
}

pub async fn handle_stop_bot(state: &AppState) -> BotStopResult {
    state.bot.stop().await
}

pub fn handle_bot_status(state: &AppState) -> BotStatus {
    state.bot.status()
}

pub fn handle_bot_snapshot(state: &AppState) -> Snapshot {
    state.bot.snapshot()
}

#[cfg(feature = "desktop")]
#[tauri::command]
pub async fn start_bot(
    state: tauri::State<'_, AppState>,
    args: Option<StartBotArgs>,
) -> Result<BotStartResult, AppError> {
    handle_start_bot(&state, args).await
}

#[cfg(feature = "desktop")]
#[tauri::command]
pub async fn stop_bot(state: tauri::State<'_, AppState>) -> Result<BotStopResult, AppError> {
    Ok(handle_stop_bot(&state).await)
}

#[cfg(feature = "desktop")]
#[tauri::command]
pub async fn bot_status(state: tauri::State<'_, AppState>) -> Result<BotStatus, AppError> {
    Ok(handle_bot_status(&state))
}

#[cfg(feature = "desktop")]
#[tauri::command]
pub async fn bot_snapshot(state: tauri::State<'_, AppState>) -> Result<Snapshot, AppError> {
    Ok(handle_bot_snapshot(&state))
}
