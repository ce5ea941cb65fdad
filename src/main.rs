//! Application entry point: audio session host.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (writes defaults on first run).
//! 3. Create the [`tokio`] runtime.
//! 4. Build the [`AudioSessionManager`] over [`CpalBackend`].
//! 5. Spawn the [`SessionRunner`] on the runtime.
//! 6. Start the hotkey listener, the device watcher and the console reader.
//! 7. Wait for Ctrl-C, then tear the session down.

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use audio_session::{
    config::AppConfig,
    engine::CpalBackend,
    hotkey::{HotkeyBindings, HotkeyListener},
    session::{AudioSessionManager, DeviceWatcher, SessionCommand, SessionRunner},
};

// ---------------------------------------------------------------------------
// Console reader
// ---------------------------------------------------------------------------

/// Forward commands typed on stdin (`play`, `visible`, `device-changed`, ...)
/// to the runner.  Lets a host process pipe lifecycle signals in.
fn spawn_console(tx: mpsc::Sender<SessionCommand>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<SessionCommand>() {
                    Ok(cmd) => {
                        if tx.blocking_send(cmd).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("console: {e}"),
                }
            }
        })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("audio-session starting up");

    // 2. Configuration
    let first_run = AppConfig::is_first_run();
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });
    if first_run {
        if let Err(e) = config.save() {
            log::warn!("Could not write default settings: {e}");
        }
    }
    log::info!(
        "unlock policy {:?}, capture mode {:?}",
        config.session.unlock_policy,
        config.session.capture_mode
    );

    // 3. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    // 4. Session manager
    let manager = Arc::new(AudioSessionManager::new(
        Arc::new(CpalBackend::new()),
        &config,
    ));

    // 5. Command runner
    let (tx, rx) = mpsc::channel::<SessionCommand>(32);
    let runner = rt.spawn(SessionRunner::new(Arc::clone(&manager)).run(rx));

    // 6. Input sources
    let _hotkeys = match HotkeyBindings::from_config(&config.hotkey) {
        Ok(bindings) => Some(HotkeyListener::start(bindings, tx.clone())?),
        Err(e) => {
            log::warn!("Hotkeys disabled: {e}");
            None
        }
    };
    let _watcher = DeviceWatcher::start(
        Duration::from_millis(config.audio.device_poll_ms),
        tx.clone(),
    )?;
    spawn_console(tx.clone())?;
    drop(tx);

    log::info!(
        "Ready: {} unlock, {} record, {} play, {} reset",
        config.hotkey.unlock_key,
        config.hotkey.push_to_talk_key,
        config.hotkey.play_key,
        config.hotkey.reset_key
    );

    // 7. Run until Ctrl-C
    rt.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Ctrl-C handler failed: {e}");
        }
    });

    log::info!("audio-session shutting down");
    runner.abort();
    manager.stop_capture();
    manager.close_context();
    log::debug!("final session: {}", manager.snapshot().to_json());
    Ok(())
}
