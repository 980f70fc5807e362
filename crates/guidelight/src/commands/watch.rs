//! `guidelight watch`: run a sync session and log every transition.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use guidelight_config::Config;
#[cfg(feature = "audio-output")]
use guidelight_core::alarm::DeviceOutput;
use guidelight_core::alarm::{
    AudioEngine, FileCoordinator, FileSuppressionStore, SampleEngine, SuppressionStore,
};
use guidelight_core::{AlarmCoordinator, SyncController};

use crate::cli::WatchArgs;
use crate::error::CliError;

/// Siren loop length when no sample file is configured.
const SIREN_PERIOD: Duration = Duration::from_secs(1);

pub async fn handle(args: WatchArgs, config: &Config) -> Result<(), CliError> {
    let mut sync = config.to_sync_config()?;
    if let Some(scope) = args.scope {
        sync.scope = scope;
    }

    let store: Arc<dyn SuppressionStore> =
        Arc::new(FileSuppressionStore::open(config.suppression_path())?);
    let engine = Arc::new(build_engine(config, args.mute)?);

    #[cfg(feature = "audio-output")]
    let _output = open_output(&engine, config, args.mute);
    #[cfg(not(feature = "audio-output"))]
    if !args.mute {
        warn!("built without the audio-output feature, the alarm will not be heard");
    }

    // Other guidelight processes on this host share the lock and bus.
    let bus = FileCoordinator::open(config.coordination_dir())?;
    let engine: Arc<dyn AudioEngine> = engine;
    let alarm = AlarmCoordinator::new(sync.alarm.clone(), Arc::new(bus), engine, store);

    let controller = SyncController::new(sync, alarm)?;
    controller.start()?;

    let result = follow(&controller).await;
    controller.shutdown();
    result
}

fn build_engine(config: &Config, mute: bool) -> Result<SampleEngine, CliError> {
    if mute {
        return Ok(SampleEngine::empty());
    }
    match config.alarm.sample_file {
        Some(ref path) => Ok(SampleEngine::load(path)?),
        None => Ok(SampleEngine::siren(config.alarm.sample_rate, SIREN_PERIOD)),
    }
}

#[cfg(feature = "audio-output")]
fn open_output(engine: &Arc<SampleEngine>, config: &Config, mute: bool) -> Option<DeviceOutput> {
    if mute {
        return None;
    }
    match DeviceOutput::spawn(Arc::clone(engine), config.alarm.sample_rate) {
        Ok(output) => Some(output),
        Err(e) => {
            warn!(error = %e, "no audio output, the alarm will not be heard");
            None
        }
    }
}

async fn follow(controller: &SyncController) -> Result<(), CliError> {
    let mut connection = controller.connection_state();
    let mut zone = controller.zone();
    let mut alarm = controller.alarm().subscribe();
    let mut notifications = controller.notifications();
    let mut invalidations = controller.invalidations();
    let mut gateway = controller.gateway_status();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!(error = %e, "could not listen for Ctrl-C");
                }
                info!("interrupted, shutting down");
                return Ok(());
            }
            Ok(()) = connection.changed() => {
                let state = *connection.borrow_and_update();
                info!(?state, "connection");
            }
            Ok(()) = zone.changed() => {
                let z = zone.borrow_and_update().clone();
                info!(
                    active = z.is_emergency_active,
                    zone = ?z.active_zone,
                    wind = %z.wind_direction,
                    deactivating = z.deactivation_in_progress,
                    "zone"
                );
            }
            Ok(()) = alarm.changed() => {
                let a = alarm.borrow_and_update().clone();
                info!(
                    active = a.is_active,
                    playing = a.is_playing,
                    suppressed = a.suppressed,
                    until = ?a.suppressed_until,
                    "alarm"
                );
            }
            Ok(()) = gateway.changed() => {
                let online = gateway.borrow_and_update().as_ref().map(|g| g.online);
                info!(?online, "gateway");
            }
            result = notifications.recv() => match result {
                Ok(notification) => warn!(?notification, "command"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "notifications lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
            result = invalidations.recv() => match result {
                Ok(invalidation) => info!(%invalidation, "view invalidated"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "invalidations lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}
