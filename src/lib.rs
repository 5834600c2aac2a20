//! SD Cockpit - local service orchestrator for a Stable Diffusion web UI
//! backend.
//!
//! The backend is a third-party Python application launched as a child
//! process. This crate supervises it: spawning and terminating the script,
//! decoding its free-form console output into structured events, keeping a
//! checkpoint catalog reconciled between the local filesystem and the
//! backend's HTTP API, and coordinating model switches.
//!
//! [`Orchestrator`] is the single entry point; everything else is exposed
//! for the UI layer to read state and render it.

mod api;
mod checkpoints;
mod config;
mod error;
mod orchestrator;
mod parser;
mod script;
mod status;
mod switcher;

pub use api::{ApiError, SharedClient, WebUiClient, WebUiOptions};
pub use checkpoints::{
    CatalogReconciler, CheckpointCatalog, CheckpointKind, CheckpointLocation, CheckpointRecord,
    DirectoryWatcher, ReconcileError, RemoteMetadata,
};
pub use config::{LaunchConfig, LaunchFlag};
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use parser::{scan_chunk, scan_line, EndpointPhrasing, OutputEvent};
pub use script::{
    ConsoleBuffer, ScriptController, ScriptError, ScriptEvent, ScriptState, ScriptStateManager,
    TransitionRejection, TransitionResult,
};
pub use status::{
    GenerationPhase, GenerationStatus, ModelLoadState, StatusHub, GENERATION_SETTLE_DELAY,
    MODEL_LOAD_RESET_DELAY,
};
pub use switcher::{ModelSwitchCoordinator, SwitchError};
