//! Padbot Daemon - Main Entry Point
//!
//! Chat-driven virtual gamepad bot: viewers type input commands, the bot
//! expands macros, parses them into timed sequences and plays them on a pool
//! of virtual controllers. This binary wires the pieces together:
//! - Configuration and persisted bot data
//! - Virtual controller pool
//! - Per-port input executor
//! - Chat event adapter and message pump

use padbotd::adapter::EventAdapter;
use padbotd::backend::UinputPad;
use padbotd::config::ConfigManager;
use padbotd::controller::{ControllerManager, ReacquireRoutine};
use padbotd::executor::{ExecSettings, InputExecutor};
use padbotd::parser::Vocabulary;
use padbotd::pump::{MessagePump, OutboundQueue, ReconnectRoutine};
use padbotd::transport_stdio::StdioTransport;
use padbotd::BotState;

use padbot_common::transport::{ChatEvent, ChatTransport, OutboundMessage};

use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    info!("Starting padbot daemon v0.1.0");

    let config_dir = env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/padbotd".to_string());
    let config = Arc::new(ConfigManager::new(Path::new(&config_dir)));
    config.ensure_dirs().await?;

    // A broken login document is fatal; everything else has defaults
    let login = match config.load_login().await {
        Ok(login) => login,
        Err(e) => {
            error!("Cannot read login document: {}", e);
            return Err(e.into());
        }
    };
    let settings = config.load_settings().await?;
    let data = config.load_data().await?;

    // Virtual controller pool; running without any pad is pointless
    let manager = Arc::new(
        ControllerManager::init(settings.joystick_count, |index| {
            Box::new(UinputPad::new(index))
        })
        .await,
    );
    if manager.count() == 0 {
        error!("Unable to acquire any virtual controller, exiting");
        return Err("no virtual controllers available".into());
    }

    let outbound_queue = OutboundQueue::new(settings.outbound_queue_cap);
    let outbound = outbound_queue.sender();
    let vocabulary = Arc::new(Vocabulary::standard());

    let executor = InputExecutor::start(
        Arc::clone(&manager),
        Arc::clone(&vocabulary),
        ExecSettings {
            frame_ms: settings.frame_ms,
            queue_depth: settings.input_queue_depth,
            hold_grace_ms: settings.hold_grace_ms,
            channel: login.channel_name.clone(),
        },
        outbound.clone(),
    );

    // Shared state plus the coalesced lazy-save channel
    let (save_tx, mut save_rx) = mpsc::channel(8);
    let state = Arc::new(RwLock::new(BotState::from_parts(settings.clone(), data)));
    {
        let mut locked = state.write().await;
        locked.macros.set_persist_channel(save_tx.clone());
    }

    let saver_state = Arc::clone(&state);
    let saver_config = Arc::clone(&config);
    let saver_outbound = outbound.clone();
    let saver_channel = login.channel_name.clone();
    tokio::spawn(async move {
        while save_rx.recv().await.is_some() {
            let snapshot = saver_state.read().await.to_data();
            if let Err(e) = saver_config.save_data(&snapshot).await {
                error!("CRITICAL - Unable to save data: {}", e);
                saver_outbound.send(OutboundMessage {
                    channel: saver_channel.clone(),
                    text: "CRITICAL - Unable to save data".to_string(),
                });
            }
        }
    });

    // Chat transport; the stdio one stands in for a real chat client
    let transport = StdioTransport::new();
    transport.connect().await?;

    let (event_tx, mut event_rx) = mpsc::channel(256);
    transport.spawn_reader(event_tx.clone());
    event_tx.send(ChatEvent::Connected).await.ok();

    let adapter = Arc::new(EventAdapter::new(
        Arc::clone(&state),
        Arc::clone(&manager),
        Arc::clone(&executor),
        Arc::clone(&vocabulary),
        outbound.clone(),
        save_tx.clone(),
        login.bot_name.clone(),
        login.channel_name.clone(),
    ));
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            adapter.handle_event(event).await;
        }
    });

    // Message pump with the reconnect routine registered
    let mut pump = MessagePump::new(
        transport.clone(),
        outbound_queue,
        settings.main_thread_sleep_ms,
        settings.message_cooldown_ms,
        settings.bot_message_char_limit,
    );
    pump.register_routine(Box::new(ReconnectRoutine::new(
        transport.clone(),
        1_000,
        60_000,
    )));
    pump.register_routine(Box::new(ReacquireRoutine::new(
        Arc::clone(&manager),
        login.channel_name.clone(),
        5_000,
    )));
    let stop = Arc::new(RwLock::new(false));
    let pump_task = tokio::spawn(pump.run(Arc::clone(&stop)));

    info!(
        "padbot '{}' ready on {} with {} controllers",
        login.bot_name,
        login.channel_name,
        manager.count()
    );

    // Wait for shutdown signal
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = interrupt.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }

    // Cooperative shutdown: stop ticking, cancel sequences, drain lanes,
    // release devices, final save
    *stop.write().await = true;
    executor.cancel_all().await;
    if !executor.drain(settings.max_drain_timeout_ms).await {
        warn!("Some input lanes did not drain in time");
    }
    if let Err(e) = pump_task.await {
        warn!("Pump task ended abnormally: {}", e);
    }
    manager.cleanup().await;

    let snapshot = state.read().await.to_data();
    if let Err(e) = config.save_data(&snapshot).await {
        error!("Final save failed: {}", e);
    }

    info!("padbot daemon shutdown complete");
    Ok(())
}
