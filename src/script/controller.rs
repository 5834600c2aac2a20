use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::LaunchConfig;
use crate::parser::{scan_line, EndpointPhrasing, OutputEvent};
use crate::script::console::ConsoleBuffer;
use crate::script::state_manager::{
    ScriptEvent, ScriptState, ScriptStateManager, TransitionResult,
};
use crate::status::{ModelLoadState, StatusHub};

/// Delay between `Terminated` and `ReadyToStart`, giving the OS time to
/// release process resources before a restart is offered.
pub const TERMINATED_GRACE_DELAY: Duration = Duration::from_secs(2);

/// How long a cooperative terminate waits before escalating to a hard
/// kill, and how long the hard kill is given to take effect.
const TERMINATE_ESCALATION: Duration = Duration::from_secs(10);
const HARD_KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script path is empty")]
    EmptyPath,
    #[error("unable to locate script at {}", .0.display())]
    ScriptNotFound(PathBuf),
    #[error("cannot start the backend from the {0} state")]
    NotStartable(ScriptState),
    #[error("cannot terminate the backend from the {0} state")]
    NotTerminatable(ScriptState),
    #[error("failed to spawn backend process: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// What the controller keeps about the running process. The `Child`
/// itself is moved into the wait task; signalling goes through the pid
/// and, for the broad-spectrum sweep, the executable name.
#[derive(Debug, Clone)]
struct ProcessHandle {
    pid: Option<u32>,
    executable: OsString,
}

/// Owns the backend subprocess lifecycle: spawn with the configured
/// argument vector, pump its combined output through the parser, and
/// terminate it cooperatively or by force.
pub struct ScriptController {
    config: Arc<LaunchConfig>,
    state: Arc<ScriptStateManager>,
    status: Arc<StatusHub>,
    console: Arc<Mutex<ConsoleBuffer>>,
    handle: Arc<Mutex<Option<ProcessHandle>>>,
}

impl ScriptController {
    pub fn new(
        config: Arc<LaunchConfig>,
        state: Arc<ScriptStateManager>,
        status: Arc<StatusHub>,
        console: Arc<Mutex<ConsoleBuffer>>,
    ) -> Self {
        Self {
            config,
            state,
            status,
            console,
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the backend script.
    ///
    /// The script's containing directory becomes the working directory and
    /// its basename the executable; the argument vector comes from the
    /// enumerated launch flags. An empty or unreadable path transitions to
    /// `UnableToLocateScript` and is never retried automatically.
    pub async fn start(&self, script_path: &Path) -> Result<(), ScriptError> {
        if script_path.as_os_str().is_empty() {
            let _ = self.state.transition(ScriptEvent::ScriptMissing);
            return Err(ScriptError::EmptyPath);
        }
        if !script_path.is_file() {
            let _ = self.state.transition(ScriptEvent::ScriptMissing);
            return Err(ScriptError::ScriptNotFound(script_path.to_path_buf()));
        }

        let executable: OsString = script_path
            .file_name()
            .ok_or_else(|| ScriptError::ScriptNotFound(script_path.to_path_buf()))?
            .to_os_string();
        let working_dir = match script_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        self.state
            .transition(ScriptEvent::Start)
            .map_err(|rejection| ScriptError::NotStartable(rejection.current_state))?;

        // A fresh session: the previous endpoint is gone (Launching
        // carries none) and stale progress/model-load state with it.
        self.status.reset();

        let args = self.config.launch_args();
        info!(
            "launching backend: {:?} in {:?} with args {:?}",
            executable, working_dir, args
        );

        let mut child = match Command::new(working_dir.join(&executable))
            .current_dir(&working_dir)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!("failed to spawn backend script: {}", e);
                if let Ok(TransitionResult::Changed { .. }) =
                    self.state.transition(ScriptEvent::ProcessExited)
                {
                    schedule_grace_reset(&self.state);
                }
                return Err(ScriptError::SpawnFailed(e));
            }
        };

        let pid = child.id();
        *self.handle.lock().unwrap() = Some(ProcessHandle {
            pid,
            executable: executable.clone(),
        });
        debug!("backend spawned with pid {:?}", pid);

        let (line_tx, line_rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, line_tx);
        }

        self.spawn_output_pump(line_rx);
        self.spawn_exit_watch(child);

        Ok(())
    }

    /// Ask the backend to stop.
    ///
    /// Sends a termination signal to the owned process; a non-graceful
    /// terminate additionally signals every process matching the script's
    /// executable name, catching worker children the handle does not own.
    /// Escalates to a hard kill if the process lingers, and always ends
    /// in `Terminated` (then `ReadyToStart` after the grace delay).
    pub async fn terminate(&self, graceful: bool) -> Result<(), ScriptError> {
        self.state
            .transition(ScriptEvent::Terminate)
            .map_err(|rejection| ScriptError::NotTerminatable(rejection.current_state))?;

        let handle = self.handle.lock().unwrap().clone();
        if let Some(handle) = &handle {
            let pid = handle.pid;
            let executable = handle.executable.clone();
            let sweep = !graceful;
            tokio::task::spawn_blocking(move || {
                if let Some(pid) = pid {
                    signal_process(pid, Signal::Term);
                }
                if sweep {
                    sweep_matching_processes(&executable, Signal::Term);
                }
            })
            .await
            .ok();
        }

        if self.wait_for_terminated(TERMINATE_ESCALATION).await {
            return Ok(());
        }

        warn!("backend ignored termination signal, escalating to kill");
        if let Some(ProcessHandle { pid: Some(pid), .. }) = &handle {
            let pid = *pid;
            tokio::task::spawn_blocking(move || signal_process(pid, Signal::Kill))
                .await
                .ok();
        }

        if !self.wait_for_terminated(HARD_KILL_WAIT).await {
            // The exit watcher never reported back; declare the process
            // gone so the state machine cannot wedge in IsTerminating.
            if let Ok(TransitionResult::Changed { .. }) =
                self.state.transition(ScriptEvent::ProcessExited)
            {
                schedule_grace_reset(&self.state);
            }
        }
        Ok(())
    }

    /// Best-effort cleanup for application shutdown: kill the process and
    /// any matching strays without the state-machine ceremony or the
    /// grace delay. Never blocks the caller.
    pub fn shutdown_immediate(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            info!("immediate shutdown of backend {:?}", handle.executable);
            std::thread::spawn(move || {
                if let Some(pid) = handle.pid {
                    signal_process(pid, Signal::Kill);
                }
                sweep_matching_processes(&handle.executable, Signal::Kill);
            });
        }
    }

    async fn wait_for_terminated(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                if matches!(
                    *rx.borrow(),
                    ScriptState::Terminated | ScriptState::ReadyToStart
                ) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    fn spawn_output_pump(&self, mut line_rx: mpsc::Receiver<String>) {
        let console = self.console.clone();
        let state = self.state.clone();
        let status = self.status.clone();
        let phrasing = self.config.endpoint_phrasing();
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                handle_output_line(&console, &state, &status, phrasing, line);
            }
            debug!("backend output stream closed");
        });
    }

    fn spawn_exit_watch(&self, mut child: tokio::process::Child) {
        let state = self.state.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(exit) => info!("backend process exited: {}", exit),
                Err(e) => warn!("failed to await backend process: {}", e),
            }
            handle.lock().unwrap().take();
            if let Ok(TransitionResult::Changed { .. }) =
                state.transition(ScriptEvent::ProcessExited)
            {
                schedule_grace_reset(&state);
            }
        });
    }
}

/// Append one output line to the console and apply whatever the parser
/// extracted from it.
fn handle_output_line(
    console: &Mutex<ConsoleBuffer>,
    state: &ScriptStateManager,
    status: &StatusHub,
    phrasing: EndpointPhrasing,
    line: String,
) {
    let event = scan_line(&line, phrasing);
    console.lock().unwrap().push_line(line);

    match event {
        Some(OutputEvent::EndpointDiscovered(endpoint)) => {
            // Latched by the state machine once active.
            let _ = state.transition(ScriptEvent::EndpointDiscovered(endpoint));
        }
        Some(OutputEvent::Progress(fraction)) => status.apply_progress(fraction),
        Some(OutputEvent::ModelLoaded { duration_secs }) => {
            status.set_model_load(ModelLoadState::Done {
                duration_secs: Some(duration_secs),
            });
        }
        Some(OutputEvent::ModelLoadFailed { type_error }) => {
            status.set_model_load(ModelLoadState::Failed {
                type_error,
                message: None,
            });
        }
        None => {}
    }
}

fn spawn_line_reader<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

fn schedule_grace_reset(state: &Arc<ScriptStateManager>) {
    let state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(TERMINATED_GRACE_DELAY).await;
        let _ = state.transition(ScriptEvent::GraceElapsed);
    });
}

fn signal_process(pid: u32, signal: Signal) {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    if let Some(process) = sys.process(pid) {
        if process.kill_with(signal).is_none() {
            // Signal not supported on this platform; fall back to kill.
            process.kill();
        }
    }
}

/// Signal every process whose executable name matches. The backend may
/// fork workers the owned handle cannot track by pid.
fn sweep_matching_processes(executable: &OsStr, signal: Signal) {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    let mut signalled = 0usize;
    for process in sys.processes().values() {
        if process.name() == executable {
            if process.kill_with(signal).is_none() {
                process.kill();
            }
            signalled += 1;
        }
    }
    if signalled > 0 {
        info!("signalled {} processes named {:?}", signalled, executable);
    }
}
