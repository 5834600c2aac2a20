use derive_more::From;

use crate::api::ApiError;
use crate::checkpoints::ReconcileError;
use crate::script::ScriptError;
use crate::switcher::SwitchError;

pub type Result<T> = std::result::Result<T, Error>;

/// Umbrella error for orchestrator-level operations.
#[derive(Debug, From)]
pub enum Error {
    #[from]
    Script(ScriptError),

    #[from]
    Api(ApiError),

    #[from]
    Reconcile(ReconcileError),

    #[from]
    Switch(SwitchError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Script(e) => e.fmt(f),
            Error::Api(e) => e.fmt(f),
            Error::Reconcile(e) => e.fmt(f),
            Error::Switch(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Script(e) => Some(e),
            Error::Api(e) => Some(e),
            Error::Reconcile(e) => Some(e),
            Error::Switch(e) => Some(e),
        }
    }
}
