//! Audio Hub
//!
//! Source arbitration and state synchronization hub for a multi-source home
//! audio device.

use audio_hub::{
    api, arbiter, bus, config, coordinator, daemons, notifier, presence, router, sources, volume,
};

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coordinator::{
    TaskCoordinator, TASK_LIVENESS, TASK_PRESENCE_EVENTS, TASK_PRESENCE_WATCH, TASK_SPOTIFY_POLL,
};
use daemons::snapcast::{SnapcastClient, SnapcastMonitor};
use daemons::spotify::{LibrespotClient, SpotifyPoller};
use presence::bluetoothctl::{self, BluetoothctlPresence};
use presence::{PresenceCollaborator, PresenceTracker};
use sources::services::ServiceRegistry;
use sources::{ScriptSource, SourceRegistry};
use volume::{AmixerMixer, Mixer, SoftMixer, VolumeService};

/// Depth of the presence event queue between watcher and tracker
const PRESENCE_EVENT_BUFFER: usize = 32;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audio_hub=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Audio Hub v{} ({})",
        env!("AUDIO_HUB_VERSION"),
        env!("AUDIO_HUB_GIT_SHA")
    );

    // Load configuration
    let config = config::load_config()?;
    tracing::info!("Configuration loaded, port: {}", config.port);

    // Broadcast hub
    let hub = Arc::new(bus::BroadcastHub::new(config.reconnect.policy()));

    // Script-backed sources
    let scripts_dir = config.scripts_path();
    let mut registry = SourceRegistry::new();
    for id in &config.sources {
        let source = ScriptSource::new(id.clone(), scripts_dir.clone())
            .with_sudo(config.use_sudo)
            .with_timeout(config.timeouts.activation());
        if let Err(e) = registry.register(Arc::new(source)) {
            tracing::warn!("Skipping source {}: {}", id, e);
        }
    }
    tracing::info!(
        "Registered {} source(s) from {}",
        registry.len(),
        scripts_dir.display()
    );
    let registry = Arc::new(registry);

    // Volume
    let curve = config.volume.curve();
    let mixer: Arc<dyn Mixer> = if config.volume.hardware {
        Arc::new(AmixerMixer::new(config.volume.mixer_control.clone()))
    } else {
        Arc::new(SoftMixer::new(curve.to_hardware(50)))
    };
    let volume = Arc::new(
        VolumeService::new(curve, mixer, hub.clone())
            .with_step(config.volume.step)
            .with_ramp(config.volume.ramp_steps, config.volume.ramp_interval()),
    );
    if let Err(e) = volume.initialize().await {
        tracing::warn!("Volume not initialized: {}", e);
    }

    let mut services = ServiceRegistry::new();
    services.register(volume.clone())?;
    let services = Arc::new(services);

    // Snapcast
    let snapcast = if config.snapcast.enabled {
        match SnapcastClient::new(
            &config.snapcast.host,
            config.snapcast.port,
            config.timeouts.status(),
        ) {
            Ok(client) => Some(Arc::new(
                SnapcastMonitor::new(Arc::new(client), hub.clone())
                    .with_timeout(config.timeouts.status()),
            )),
            Err(e) => {
                tracing::warn!("Snapcast monitor disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    // Source change fan-out
    let mut notifier = notifier::SourceChangeNotifier::new();
    notifier.register(Arc::new(notifier::SourceStatusPanel::new(hub.clone())));
    notifier.register(volume.clone());
    if let Some(snapcast) = &snapcast {
        notifier.register(snapcast.clone());
    }

    let arbiter = Arc::new(
        arbiter::SourceArbiter::new(registry.clone(), notifier, hub.clone())
            .with_timeout(config.timeouts.activation()),
    );

    let coordinator = Arc::new(TaskCoordinator::new());
    let mut router = router::ServiceRouter::new(hub.clone(), arbiter.clone())
        .with_services(services)
        .with_volume(volume.clone());

    // Bluetooth presence
    if config.bluetooth.enabled {
        if !registry.contains(&config.bluetooth.source_id) {
            tracing::warn!(
                "Bluetooth source {} has no scripts registered; presence will not switch",
                config.bluetooth.source_id
            );
        }
        let collaborator: Arc<dyn PresenceCollaborator> = Arc::new(BluetoothctlPresence::default());
        let tracker = Arc::new(
            PresenceTracker::new(
                config.bluetooth.source_id.clone(),
                collaborator.clone(),
                arbiter.clone(),
                hub.clone(),
            )
            .with_timeout(config.timeouts.status()),
        );
        tracker.reconcile().await;

        let (events_tx, events_rx) = mpsc::channel(PRESENCE_EVENT_BUFFER);
        let watch_interval = std::time::Duration::from_secs(config.bluetooth.watch_interval_secs);
        let status_timeout = config.timeouts.status();
        coordinator.start(TASK_PRESENCE_WATCH, move |cancel| {
            bluetoothctl::watch(collaborator, events_tx, watch_interval, status_timeout, cancel)
        })?;
        let events_tracker = tracker.clone();
        coordinator.start(TASK_PRESENCE_EVENTS, move |cancel| {
            events_tracker.run(events_rx, cancel)
        })?;

        router = router.with_presence(tracker);
    }

    // Spotify Connect daemon
    if config.spotify.enabled {
        match LibrespotClient::new(
            &config.spotify.host,
            config.spotify.port,
            config.timeouts.status(),
        ) {
            Ok(client) => {
                let client = Arc::new(client);
                let poller = Arc::new(
                    SpotifyPoller::new(client.clone(), arbiter.clone(), hub.clone())
                        .with_control(client)
                        .with_source_id(config.spotify.source_id.clone())
                        .with_interval(std::time::Duration::from_secs(
                            config.spotify.poll_interval_secs.max(1),
                        ))
                        .with_timeout(config.timeouts.status()),
                );
                let task_poller = poller.clone();
                coordinator.start(TASK_SPOTIFY_POLL, move |cancel| async move {
                    let result = task_poller.run(cancel).await;
                    tracing::info!(
                        "Spotify poller {}",
                        daemons::spotify::describe_exit(&result)
                    );
                })?;
                router = router.with_spotify(poller);
            }
            Err(e) => tracing::warn!("Spotify poller disabled: {}", e),
        }
    }

    if let Some(snapcast) = snapcast {
        snapcast.refresh().await;
        router = router.with_snapcast(snapcast);
    }

    // Liveness probing
    let liveness_hub = hub.clone();
    let liveness_interval = config.broadcast.liveness_interval();
    coordinator.start(TASK_LIVENESS, move |cancel| {
        liveness_hub.run_liveness(liveness_interval, cancel)
    })?;

    // Build API routes
    let state = api::AppState::new(Arc::new(router))
        .with_observer_buffer(config.broadcast.observer_buffer);
    let app = api::create_router(state);

    // Start server with graceful shutdown
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator.shutdown_token()))
        .await?;

    // Cleanup: stop background tasks
    tracing::info!("Shutting down background tasks...");
    coordinator.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C, SIGTERM, or coordinator shutdown)
async fn shutdown_signal(shutdown: tokio_util::sync::CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        _ = shutdown.cancelled() => tracing::info!("Coordinator shut down, stopping server..."),
    }
}
