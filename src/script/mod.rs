//! Backend process lifecycle: state machine, console buffer, and the
//! controller that spawns, watches, and terminates the script.

mod console;
mod controller;
mod state_manager;

pub use console::ConsoleBuffer;
pub use controller::{ScriptController, ScriptError, TERMINATED_GRACE_DELAY};
pub use state_manager::{
    ScriptEvent, ScriptState, ScriptStateManager, TransitionRejection, TransitionResult,
};
