//! Composition root wiring the lifecycle controller, catalog reconciler,
//! switch coordinator, and directory watcher together.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::api::{SharedClient, WebUiClient};
use crate::checkpoints::{
    CatalogReconciler, CheckpointCatalog, CheckpointRecord, DirectoryWatcher, ReconcileError,
};
use crate::config::LaunchConfig;
use crate::script::{ConsoleBuffer, ScriptController, ScriptError, ScriptState, ScriptStateManager};
use crate::status::{GenerationStatus, ModelLoadState, StatusHub};
use crate::switcher::{ModelSwitchCoordinator, SwitchError};

/// Filesystem events are bursty (a copy emits dozens); wait this long after
/// the first signal and fold the rest into one rescan.
const FS_DEBOUNCE: Duration = Duration::from_millis(200);

/// Owns every moving part of a backend session. One instance per
/// application; construct inside a Tokio runtime.
pub struct Orchestrator {
    state: Arc<ScriptStateManager>,
    status: Arc<StatusHub>,
    console: Arc<Mutex<ConsoleBuffer>>,
    controller: ScriptController,
    reconciler: Arc<CatalogReconciler>,
    switcher: Arc<ModelSwitchCoordinator>,
    client: SharedClient,
    shutdown: CancellationToken,
    watcher: Mutex<Option<DirectoryWatcher>>,
    // Held so the supervisor's receiver never observes a closed channel.
    _fs_tx: mpsc::Sender<()>,
}

impl Orchestrator {
    pub fn new(config: LaunchConfig) -> Self {
        let config = Arc::new(config);
        let state = Arc::new(ScriptStateManager::new());
        let status = Arc::new(StatusHub::new());
        let console = Arc::new(Mutex::new(ConsoleBuffer::default()));
        let controller = ScriptController::new(
            config.clone(),
            state.clone(),
            status.clone(),
            console.clone(),
        );

        let reconciler = Arc::new(CatalogReconciler::new(
            Arc::new(Mutex::new(CheckpointCatalog::new())),
            config.checkpoint_locations(),
        ));
        reconciler.rescan_local();

        let switcher = Arc::new(ModelSwitchCoordinator::new(status.clone()));
        let client: SharedClient = Arc::new(std::sync::RwLock::new(None));
        let shutdown = CancellationToken::new();

        let (fs_tx, fs_rx) = mpsc::channel(1);
        let watcher_dirs: Vec<_> = config
            .checkpoint_locations()
            .into_iter()
            .map(|location| location.dir)
            .collect();
        let watcher = match DirectoryWatcher::start(&watcher_dirs, fs_tx.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("checkpoint directories are not being watched: {}", e);
                None
            }
        };

        spawn_supervisor(
            state.clone(),
            reconciler.clone(),
            switcher.clone(),
            client.clone(),
            shutdown.clone(),
            fs_rx,
        );

        Self {
            state,
            status,
            console,
            controller,
            reconciler,
            switcher,
            client,
            shutdown,
            watcher: Mutex::new(watcher),
            _fs_tx: fs_tx,
        }
    }

    /// Launch the backend script. See [`ScriptController::start`].
    pub async fn start(&self, script_path: &Path) -> Result<(), ScriptError> {
        self.controller.start(script_path).await
    }

    /// Stop the backend. See [`ScriptController::terminate`].
    pub async fn terminate(&self, graceful: bool) -> Result<(), ScriptError> {
        self.controller.terminate(graceful).await
    }

    /// Tear everything down for application exit: stop the supervisor and
    /// the watcher, kill the process without ceremony.
    pub fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.shutdown.cancel();
        if let Some(mut watcher) = self.watcher.lock().unwrap().take() {
            watcher.stop();
        }
        self.controller.shutdown_immediate();
    }

    /// Switch the backend to the checkpoint at the given local path.
    pub async fn switch_to(&self, path: &Path) -> Result<(), SwitchError> {
        let client = self.active_client().ok_or(SwitchError::ServiceNotActive)?;
        let record = self
            .reconciler
            .catalog()
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| SwitchError::UnknownCheckpoint(path.to_path_buf()))?;
        self.switcher.switch(&client, &record).await
    }

    /// Rescan the configured checkpoint directories.
    pub fn rescan(&self) {
        self.reconciler.rescan_local();
    }

    /// Refresh backend metadata for the catalog. Requires an active backend.
    pub async fn refresh(&self) -> Result<(), ReconcileError> {
        let client = self
            .active_client()
            .ok_or(ReconcileError::ServiceNotActive)?;
        self.reconciler.refresh_from_remote(&client).await
    }

    /// The catalog record matching the backend's currently active
    /// checkpoint, queried live.
    pub async fn current_checkpoint(&self) -> Result<Option<CheckpointRecord>, ReconcileError> {
        let client = self
            .active_client()
            .ok_or(ReconcileError::ServiceNotActive)?;
        self.reconciler.current_remote_checkpoint(&client).await
    }

    /// Checkpoint paths that vanished from disk since the last call.
    /// Consumed once; a second call returns nothing until the next removal.
    pub fn take_recently_removed(&self) -> Vec<PathBuf> {
        self.reconciler
            .catalog()
            .lock()
            .unwrap()
            .take_recently_removed()
    }

    /// Snapshot of all known checkpoints, sorted by name.
    pub fn checkpoints(&self) -> Vec<CheckpointRecord> {
        let catalog = self.reconciler.catalog().lock().unwrap();
        let mut records: Vec<_> = catalog.records().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Console lines newer than `cursor`, plus the new cursor.
    pub fn console_tail(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.console.lock().unwrap().tail_after(cursor, limit)
    }

    pub fn script_state(&self) -> ScriptState {
        self.state.current()
    }

    pub fn subscribe_script_state(&self) -> watch::Receiver<ScriptState> {
        self.state.subscribe()
    }

    pub fn generation_status(&self) -> GenerationStatus {
        self.status.generation()
    }

    pub fn subscribe_generation(&self) -> watch::Receiver<GenerationStatus> {
        self.status.subscribe_generation()
    }

    pub fn model_load_state(&self) -> ModelLoadState {
        self.status.model_load()
    }

    pub fn subscribe_model_load(&self) -> watch::Receiver<ModelLoadState> {
        self.status.subscribe_model_load()
    }

    fn active_client(&self) -> Option<Arc<WebUiClient>> {
        self.client.read().unwrap().clone()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Background task reacting to script-state changes and filesystem events.
///
/// On `Active` it installs the session's API client and reconciles the
/// catalog against the fresh backend; on a new launch it clears the stale
/// client. Filesystem signals are debounced into a rescan plus, when the
/// backend is reachable, a metadata refresh.
fn spawn_supervisor(
    state: Arc<ScriptStateManager>,
    reconciler: Arc<CatalogReconciler>,
    switcher: Arc<ModelSwitchCoordinator>,
    client: SharedClient,
    shutdown: CancellationToken,
    mut fs_rx: mpsc::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut state_rx = state.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = state_rx.borrow_and_update().clone();
                    match snapshot {
                        ScriptState::Launching => {
                            client.write().unwrap().take();
                            switcher.reset();
                        }
                        ScriptState::Active { endpoint } => {
                            match WebUiClient::new(&endpoint) {
                                Ok(new_client) => {
                                    let new_client = Arc::new(new_client);
                                    *client.write().unwrap() = Some(new_client.clone());
                                    info!("backend active at {}", new_client.base_url());
                                    reconciler.rescan_local();
                                    if let Err(e) =
                                        reconciler.refresh_from_remote(&new_client).await
                                    {
                                        warn!("initial catalog refresh failed: {}", e);
                                    }
                                }
                                Err(e) => error!("cannot build API client: {}", e),
                            }
                        }
                        _ => {}
                    }
                }

                received = fs_rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                    tokio::time::sleep(FS_DEBOUNCE).await;
                    while fs_rx.try_recv().is_ok() {}

                    reconciler.rescan_local();
                    let maybe_client = client.read().unwrap().clone();
                    if let Some(active) = maybe_client {
                        if let Err(e) = reconciler.refresh_from_remote(&active).await {
                            warn!("catalog refresh after fs change failed: {}", e);
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_requiring_the_backend_fail_when_idle() {
        let orchestrator = Orchestrator::new(LaunchConfig::default());
        assert!(matches!(
            orchestrator.refresh().await,
            Err(ReconcileError::ServiceNotActive)
        ));
        assert!(matches!(
            orchestrator.switch_to(Path::new("/models/a.safetensors")).await,
            Err(SwitchError::ServiceNotActive)
        ));
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn fresh_orchestrator_is_ready_to_start_with_empty_console() {
        let orchestrator = Orchestrator::new(LaunchConfig::default());
        assert_eq!(orchestrator.script_state(), ScriptState::ReadyToStart);
        let (lines, cursor) = orchestrator.console_tail(0, 100);
        assert!(lines.is_empty());
        assert_eq!(cursor, 0);
        orchestrator.shutdown();
    }
}
