use crate::commands::{
    bot::{bot_snapshot, bot_status, start_bot, stop_bot},
    credentials::{load_credentials, save_credentials},
    health::health,
    price_feed::{price_series, start_price_feed, stop_price_feed},
};
use crate::config::Settings;
use crate::db::initialize_pool;
use crate::logging::init_tracing;
use crate::state::AppState;
use serde::Serialize;
use tauri::{AppHandle, Emitter, Manager, Wry};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const BOT_STATUS_EVENT: &str = "bot_status";
pub const SYMBOLS_DATA_EVENT: &str = "symbols_data";
pub const PRICE_SERIES_EVENT: &str = "price_series";

/// Registers state, window event forwarding and the command surface on `builder`.
pub fn attach(builder: tauri::Builder<Wry>) -> tauri::Builder<Wry> {
    if let Err(error) = init_tracing() {
        debug!(%error, "keeping the host's tracing subscriber");
    }

    builder
        .setup(|app| {
            let app_handle = app.handle().clone();
            let settings = Settings::from_env()?;
            let db_handle = app_handle.clone();
            let db_pool =
                tauri::async_runtime::block_on(async move { initialize_pool(&db_handle).await })?;

            let state = AppState::new(db_pool, settings)?;
            spawn_event_forwarders(&app_handle, &state);
            info!(
                api_base_url = %state.settings.api_base_url,
                startup_mode = ?state.settings.startup_mode,
                "desktop runtime ready"
            );
            app.manage(state);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            health,
            start_bot,
            stop_bot,
            bot_status,
            bot_snapshot,
            save_credentials,
            load_credentials,
            start_price_feed,
            stop_price_feed,
            price_series
        ])
}

fn spawn_event_forwarders(app_handle: &AppHandle, state: &AppState) {
    forward_watch(app_handle.clone(), BOT_STATUS_EVENT, state.bot.subscribe_status(), Clone::clone);

    let bot = state.bot.clone();
    forward_watch(
        app_handle.clone(),
        SYMBOLS_DATA_EVENT,
        bot.synchronizer().subscribe(),
        move |_revision| bot.snapshot(),
    );

    forward_watch(
        app_handle.clone(),
        PRICE_SERIES_EVENT,
        state.price_poller.subscribe(),
        Clone::clone,
    );
}

fn forward_watch<T, P, F>(
    app_handle: AppHandle,
    event: &'static str,
    mut receiver: watch::Receiver<T>,
    project: F,
) where
    T: Send + Sync + 'static,
    P: Serialize + Clone,
    F: Fn(&T) -> P + Send + 'static,
{
    tauri::async_runtime::spawn(async move {
        while receiver.changed().await.is_ok() {
            let payload = project(&receiver.borrow_and_update());
            if let Err(error) = app_handle.emit(event, payload) {
                warn!(event, %error, "failed to forward event to the window");
            }
        }
    });
}
