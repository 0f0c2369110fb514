use std::path::PathBuf;
use std::sync::Arc;

use cinder_config::{CONFIG_PATH_ENV, EngineSettings, SettingsStore, load_settings};
use cinder_fsops::LocalFileSystem;
use cinder_runtime::{RuntimeStore, STORE_FILE_NAME};
use cinder_session::{ControllerOptions, LifecycleState, SessionController, SessionDeps};
use cinder_telemetry::{LogFormat, LoggingConfig};
use cinder_torrent_core::{StaticEnvironment, TorrentRepository, TransferEngine};
use cinder_torrent_loopback::LoopbackEngine;
use tracing::{Instrument, info, warn};

use crate::error::{AppError, AppResult};
use crate::streaming::HttpStreamingEndpoint;

const DATA_DIR_ENV: &str = "CINDER_DATA_DIR";
const TEMP_DIR_NAME: &str = "tmp";

/// Dependencies required to bootstrap the daemon.
pub(crate) struct BootstrapDependencies {
    settings: EngineSettings,
    data_dir: PathBuf,
}

impl BootstrapDependencies {
    /// Resolve settings and the data directory from the environment.
    pub(crate) fn from_env() -> AppResult<Self> {
        let config_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let settings = load_settings(config_path.as_deref())
            .map_err(|err| AppError::config("settings.load", err))?;
        let data_dir = match std::env::var_os(DATA_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => directories::ProjectDirs::from("org", "cinder", "cinder")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or(AppError::MissingDataDir)?,
        };
        Ok(Self { settings, data_dir })
    }
}

/// Entry point for the daemon boot sequence.
///
/// # Errors
///
/// Returns an error if dependency construction or session startup fails.
pub async fn run_app() -> AppResult<()> {
    let dependencies = BootstrapDependencies::from_env()?;
    let logging = LoggingConfig {
        level: &dependencies.settings.logging.level,
        format: LogFormat::from_name(dependencies.settings.logging.format.as_deref()),
        build_sha: option_env!("CINDER_BUILD_SHA").unwrap_or("dev"),
    };
    cinder_telemetry::init_logging(&logging)
        .map_err(|err| AppError::telemetry("telemetry.init", err))?;

    async move {
        let controller = build_controller(dependencies).await?;
        controller
            .start()
            .await
            .map_err(|err| AppError::session("session.start", err))?;

        wait_for_exit(&controller).await;
        controller.stop().await;
        info!("cinder shut down");
        Ok::<(), AppError>(())
    }
    .instrument(cinder_telemetry::daemon_span())
    .await
}

/// Wire the store, engine, filesystem and streaming endpoint into a controller.
pub(crate) async fn build_controller(
    dependencies: BootstrapDependencies,
) -> AppResult<SessionController> {
    let BootstrapDependencies { settings, data_dir } = dependencies;
    info!(data_dir = %data_dir.display(), "cinder bootstrap starting");

    let store: Arc<dyn TorrentRepository> = Arc::new(
        RuntimeStore::open(data_dir.join(STORE_FILE_NAME))
            .await
            .map_err(|err| AppError::runtime("runtime_store.open", err))?,
    );
    let engine: Arc<dyn TransferEngine> = Arc::new(LoopbackEngine::new(Arc::clone(&store)));

    let temp_dir = settings
        .storage
        .temp_dir
        .clone()
        .unwrap_or_else(|| data_dir.join(TEMP_DIR_NAME));
    let fs = LocalFileSystem::new(temp_dir);

    let deps = SessionDeps {
        streaming: Arc::new(HttpStreamingEndpoint::new(Arc::clone(&engine))),
        engine,
        store,
        settings: Arc::new(SettingsStore::new(settings)),
        fs: Arc::new(fs),
        environment: Arc::new(StaticEnvironment::default()),
        completion: None,
    };
    SessionController::new(deps, ControllerOptions::default())
        .map_err(|err| AppError::session("session_controller.new", err))
}

/// Block until Ctrl-C arrives or the session stops on its own.
async fn wait_for_exit(controller: &SessionController) {
    let mut states = controller.observe_state();
    let auto_stopped = async {
        let _ = states
            .wait_for(|state| *state == LifecycleState::Running)
            .await;
        let _ = states
            .wait_for(|state| *state == LifecycleState::Stopped)
            .await;
    };
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        }
        () = auto_stopped => info!("session stopped after downloads completed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn controller_runs_against_on_disk_store() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut settings = EngineSettings::default();
        settings.storage.download_dir = Some(dir.path().join("downloads"));
        let controller = build_controller(BootstrapDependencies {
            settings,
            data_dir: dir.path().join("data"),
        })
        .await?;

        controller.start().await?;
        let mut states = controller.observe_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|state| *state == LifecycleState::Running),
        )
        .await??;

        let hash = cinder_test_support::fixtures::info_hash(1);
        let descriptor = cinder_test_support::fixtures::write_descriptor(
            dir.path(),
            "one.torrent",
            &hash,
            "one",
        )?;
        let added = controller.add_torrent_file(&descriptor, None).await?;
        assert_eq!(added.map(|torrent| torrent.id), Some(hash));

        controller.stop().await;
        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert!(dir.path().join("data").join(STORE_FILE_NAME).exists());
        Ok(())
    }
}
