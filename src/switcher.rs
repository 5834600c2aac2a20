//! Checkpoint switching.
//!
//! A switch is a long blocking call on the backend, so only one may be in
//! flight at a time; a second request is rejected instead of queued. The
//! coordinator also remembers the last checkpoint it switched to and treats
//! a repeat request as a no-op.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::api::{ApiError, WebUiClient};
use crate::checkpoints::CheckpointRecord;
use crate::status::{ModelLoadState, StatusHub};

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("no checkpoint known at {}", .0.display())]
    UnknownCheckpoint(PathBuf),
    #[error("checkpoint {0:?} has no backend title yet")]
    Unassigned(String),
    #[error("another checkpoint is currently loading")]
    SwitchInFlight,
    #[error("backend is not active")]
    ServiceNotActive,
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Serializes checkpoint switches and mirrors their outcome into the
/// [`StatusHub`].
pub struct ModelSwitchCoordinator {
    status: Arc<StatusHub>,
    in_flight: Arc<Mutex<bool>>,
    last_switched: Mutex<Option<PathBuf>>,
}

impl ModelSwitchCoordinator {
    pub fn new(status: Arc<StatusHub>) -> Self {
        Self {
            status,
            in_flight: Arc::new(Mutex::new(false)),
            last_switched: Mutex::new(None),
        }
    }

    /// Switch the backend to the given checkpoint.
    ///
    /// Rejects checkpoints the backend has not assigned a title to, and
    /// rejects the call outright while another switch is in flight. Asking
    /// for the checkpoint that was last switched to is a successful no-op.
    pub async fn switch(
        &self,
        client: &WebUiClient,
        record: &CheckpointRecord,
    ) -> Result<(), SwitchError> {
        let title = record
            .title()
            .ok_or_else(|| SwitchError::Unassigned(record.name.clone()))?;

        if self.last_switched.lock().unwrap().as_deref() == Some(record.local_path.as_path()) {
            info!("checkpoint {:?} already active, nothing to do", record.name);
            return Ok(());
        }

        let _guard = FlightGuard::acquire(&self.in_flight).ok_or(SwitchError::SwitchInFlight)?;

        info!("switching checkpoint to {title:?}");
        self.status.set_model_load(ModelLoadState::IsLoading);

        match client.set_checkpoint(title).await {
            Ok(()) => {
                *self.last_switched.lock().unwrap() = Some(record.local_path.clone());
                // The output parser usually confirms the load first, with
                // the duration from the log line; only fill in a terminal
                // state if it has not.
                if self.status.model_load() == ModelLoadState::IsLoading {
                    self.status
                        .set_model_load(ModelLoadState::Done { duration_secs: None });
                }
                Ok(())
            }
            Err(e) => {
                warn!("checkpoint switch failed: {}", e);
                // A hardware-incompatibility failure is detected on the log
                // side and will already have been recorded by the parser.
                if !matches!(
                    self.status.model_load(),
                    ModelLoadState::Failed { type_error: true, .. }
                ) {
                    self.status.set_model_load(ModelLoadState::Failed {
                        type_error: false,
                        message: Some(e.to_string()),
                    });
                }
                Err(e.into())
            }
        }
    }

    /// Forget the last switched checkpoint, used when a new backend session
    /// starts and the backend is back on its default model.
    pub fn reset(&self) {
        *self.last_switched.lock().unwrap() = None;
    }
}

/// Marks a switch as in flight for its lifetime.
struct FlightGuard {
    flag: Arc<Mutex<bool>>,
}

impl FlightGuard {
    fn acquire(flag: &Arc<Mutex<bool>>) -> Option<Self> {
        let mut in_flight = flag.lock().unwrap();
        if *in_flight {
            return None;
        }
        *in_flight = true;
        Some(Self { flag: flag.clone() })
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        *self.flag.lock().unwrap() = false;
    }
}
