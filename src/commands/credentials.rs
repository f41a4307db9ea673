use crate::bot::types::Credentials;
use crate::error::AppError;
use crate::state::AppState;

pub async fn handle_save_credentials(
    state: &AppState,
    credentials: Credentials,
) -> Result<(), AppError> {
    state.credential_store.save(&credentials).await
}

pub async fn handle_load_credentials(state: &AppState) -> Result<Option<Credentials>, AppError> {
    state.credential_store.load().await
}

#[cfg(feature = "desktop")]
#[tauri::command]
pub async fn save_credentials(
    state: tauri::State<'_, AppState>,
    credentials: Credentials,
) -> Result<(), AppError> {
    handle_save_credentials(&state, credentials).await
}

#[cfg(feature = "desktop")]
#[tauri::command]
pub async fn load_credentials(
    state: tauri::State<'_, AppState>,
) -> Result<Option<Credentials>, AppError> {
    handle_load_credentials(&state).await
}
