use crate::error::AppError;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::Path;

pub const DEFAULT_DB_FILENAME: &str = "app.db";

pub fn resolve_db_filename() -> String {
    std::env::var("APP_DB_FILENAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_DB_FILENAME.to_string())
}

#[cfg(feature = "desktop")]
fn resolve_db_path(app_handle: &tauri::AppHandle) -> Result<std::path::PathBuf, AppError> {
    use tauri::Manager;

    let mut base_dir = app_handle.path().app_data_dir()?;
    std::fs::create_dir_all(&base_dir)?;
    base_dir.push(resolve_db_filename());
    Ok(base_dir)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, AppError> {
    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

#[cfg(feature = "desktop")]
pub async fn initialize_pool(app_handle: &tauri::AppHandle) -> Result<SqlitePool, AppError> {
    let db_path = resolve_db_path(app_handle)?;
    initialize_pool_from_path(&db_path).await
}
