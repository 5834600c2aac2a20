//! Shared generation and model-load status, observable by the UI layer.
//!
//! Both values live behind `tokio::sync::watch` channels: the controller's
//! output pump and the switch coordinator write them, collaborators read a
//! snapshot or subscribe. Terminal states auto-reset to idle after a fixed
//! delay; an epoch counter guards each delayed reset so a stale timer never
//! clobbers a newer transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::watch;

/// How long a finished generation stays in `Done` before settling to idle.
pub const GENERATION_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// How long a `Done`/`Failed` model load is displayed before resetting.
pub const MODEL_LOAD_RESET_DELAY: Duration = Duration::from_secs(4);

/// Phase of the current image-generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum GenerationPhase {
    #[default]
    Idle,
    PreparingToGenerate,
    Generating,
    FinishingUp,
    Done,
}

/// Generation phase plus a progress fraction in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GenerationStatus {
    pub phase: GenerationPhase,
    pub progress: f32,
}

/// Outcome of the most recent checkpoint load, written by both the switch
/// coordinator (request side) and the output parser (log side).
#[derive(Debug, Clone, PartialEq, Default, strum::Display)]
pub enum ModelLoadState {
    #[default]
    Idle,
    IsLoading,
    Done {
        /// Load duration as reported by the backend log line, when the
        /// confirmation came from the output stream.
        duration_secs: Option<f64>,
    },
    Failed {
        /// Set for the recognized hardware-incompatibility signature,
        /// whose remedy is a configuration change rather than a retry.
        type_error: bool,
        message: Option<String>,
    },
}

impl ModelLoadState {
    fn is_settled(&self) -> bool {
        matches!(self, ModelLoadState::Done { .. } | ModelLoadState::Failed { .. })
    }
}

/// Single owner of the generation and model-load state values.
///
/// Methods that schedule delayed resets must be called from within a Tokio
/// runtime.
pub struct StatusHub {
    generation: watch::Sender<GenerationStatus>,
    model_load: watch::Sender<ModelLoadState>,
    generation_epoch: Arc<AtomicU64>,
    model_load_epoch: Arc<AtomicU64>,
}

impl StatusHub {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(GenerationStatus::default());
        let (model_load, _) = watch::channel(ModelLoadState::default());
        Self {
            generation,
            model_load,
            generation_epoch: Arc::new(AtomicU64::new(0)),
            model_load_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn generation(&self) -> GenerationStatus {
        *self.generation.borrow()
    }

    pub fn subscribe_generation(&self) -> watch::Receiver<GenerationStatus> {
        self.generation.subscribe()
    }

    pub fn model_load(&self) -> ModelLoadState {
        self.model_load.borrow().clone()
    }

    pub fn subscribe_model_load(&self) -> watch::Receiver<ModelLoadState> {
        self.model_load.subscribe()
    }

    /// Apply a progress fraction parsed from the output stream.
    ///
    /// Progress above zero lifts an idle or preparing generation into
    /// `Generating`; a full bar moves it to `FinishingUp`.
    pub fn apply_progress(&self, fraction: f32) {
        self.generation_epoch.fetch_add(1, Ordering::SeqCst);
        self.generation.send_modify(|status| {
            status.progress = fraction.clamp(0.0, 1.0);
            if status.progress >= 1.0 {
                status.phase = GenerationPhase::FinishingUp;
            } else if status.progress > 0.0
                && matches!(
                    status.phase,
                    GenerationPhase::Idle | GenerationPhase::PreparingToGenerate
                )
            {
                status.phase = GenerationPhase::Generating;
            }
        });
    }

    /// Called by the generation client when a request is about to be sent.
    pub fn mark_preparing(&self) {
        self.generation_epoch.fetch_add(1, Ordering::SeqCst);
        self.generation.send_replace(GenerationStatus {
            phase: GenerationPhase::PreparingToGenerate,
            progress: 0.0,
        });
    }

    /// Called by the generation client when a request has completed.
    /// Settles back to idle after [`GENERATION_SETTLE_DELAY`].
    pub fn mark_done(&self) {
        let epoch = self.generation_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.generation.send_modify(|status| {
            status.phase = GenerationPhase::Done;
        });

        let generation = self.generation.clone();
        let epochs = self.generation_epoch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(GENERATION_SETTLE_DELAY).await;
            if epochs.load(Ordering::SeqCst) == epoch {
                debug!("generation settled back to idle");
                generation.send_replace(GenerationStatus::default());
            }
        });
    }

    /// Record a model-load transition. Terminal states are reset to idle
    /// after [`MODEL_LOAD_RESET_DELAY`] unless a newer transition arrives
    /// first.
    pub fn set_model_load(&self, state: ModelLoadState) {
        let epoch = self.model_load_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("model load state: {}", state);
        let settled = state.is_settled();
        self.model_load.send_replace(state);

        if settled {
            let model_load = self.model_load.clone();
            let epochs = self.model_load_epoch.clone();
            tokio::spawn(async move {
                tokio::time::sleep(MODEL_LOAD_RESET_DELAY).await;
                if epochs.load(Ordering::SeqCst) == epoch {
                    debug!("model load state reset to idle");
                    model_load.send_replace(ModelLoadState::Idle);
                }
            });
        }
    }

    /// Reset both values, used when a new backend session starts.
    pub fn reset(&self) {
        self.generation_epoch.fetch_add(1, Ordering::SeqCst);
        self.model_load_epoch.fetch_add(1, Ordering::SeqCst);
        self.generation.send_replace(GenerationStatus::default());
        self.model_load.send_replace(ModelLoadState::Idle);
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn progress_lifts_idle_to_generating() {
        let hub = StatusHub::new();
        hub.apply_progress(0.37);
        let status = hub.generation();
        assert_eq!(status.phase, GenerationPhase::Generating);
        assert!((status.progress - 0.37).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn full_progress_moves_to_finishing_up() {
        let hub = StatusHub::new();
        hub.apply_progress(1.0);
        assert_eq!(hub.generation().phase, GenerationPhase::FinishingUp);
    }

    #[tokio::test]
    async fn progress_does_not_regress_generating_phase() {
        let hub = StatusHub::new();
        hub.apply_progress(0.5);
        hub.apply_progress(0.7);
        assert_eq!(hub.generation().phase, GenerationPhase::Generating);
        assert!((hub.generation().progress - 0.7).abs() < f32::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn done_settles_back_to_idle_after_delay() {
        let hub = StatusHub::new();
        hub.mark_preparing();
        hub.mark_done();
        assert_eq!(hub.generation().phase, GenerationPhase::Done);

        tokio::time::sleep(GENERATION_SETTLE_DELAY + Duration::from_millis(50)).await;
        assert_eq!(hub.generation().phase, GenerationPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn model_load_failure_resets_after_delay() {
        let hub = StatusHub::new();
        hub.set_model_load(ModelLoadState::Failed {
            type_error: true,
            message: None,
        });
        assert!(matches!(
            hub.model_load(),
            ModelLoadState::Failed { type_error: true, .. }
        ));

        tokio::time::sleep(MODEL_LOAD_RESET_DELAY + Duration::from_millis(50)).await;
        assert_eq!(hub.model_load(), ModelLoadState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_transition_cancels_stale_reset() {
        let hub = StatusHub::new();
        hub.set_model_load(ModelLoadState::Done { duration_secs: Some(4.6) });
        tokio::time::sleep(MODEL_LOAD_RESET_DELAY / 2).await;
        hub.set_model_load(ModelLoadState::IsLoading);

        tokio::time::sleep(MODEL_LOAD_RESET_DELAY).await;
        // The reset scheduled by the first transition must not fire.
        assert_eq!(hub.model_load(), ModelLoadState::IsLoading);
    }
}
