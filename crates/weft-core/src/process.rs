//! The process manager: turns "run this task" into "reaped child with
//! collected outputs".
//!
//! Each accepted request forks a child with stdout, stderr and the engine
//! log descriptor (fd 3) redirected to files under the logs directory.
//! A gatherer task awaits the reap, reads the log files back and posts a
//! [`TaskOutcome`] on the outcome channel. Every spawn is matched by
//! exactly one outcome, and shutdown drains in-flight children before
//! returning so outcomes are never lost.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// How long a SIGTERM'd child gets before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// What to execute.
#[derive(Debug, Clone)]
pub enum TaskCommand {
    /// An executable on disk.
    Binary { path: String },
    /// An inline script body, written out and executed; the interpreter
    /// comes from its shebang.
    Script { body: String },
}

/// A fully resolved execution request.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub attempt_id: u64,
    pub instance_id: i64,
    pub task_index: usize,
    pub command: TaskCommand,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub merge_stderr: bool,
    pub use_agent: bool,
    pub user: Option<String>,
    pub host: Option<String>,
    pub wd: Option<String>,
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
}

impl ExitKind {
    pub fn code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(_) => -1,
        }
    }
}

/// The reaped result of one attempt.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub attempt_id: u64,
    pub instance_id: i64,
    pub task_index: usize,
    pub exit: ExitKind,
    pub stdout: String,
    pub stderr: String,
    pub engine_log: String,
    pub execution_time: Duration,
}

/// Process manager configuration.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Directory for per-attempt stdout/stderr/log files and script bodies.
    pub logs_dir: PathBuf,
    /// Remove log files after gathering them into memory.
    pub logs_delete: bool,
    /// Binary invoked for `use-agent` tasks; receives `user@host` and the
    /// original command line.
    pub agent_path: Option<String>,
}

struct ChildSlot {
    pid: u32,
}

/// The process manager.
pub struct ProcessManager {
    config: ProcessConfig,
    outcome_tx: mpsc::UnboundedSender<TaskOutcome>,
    children: Mutex<HashMap<u64, ChildSlot>>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl ProcessManager {
    /// Build the manager and the outcome channel its gatherers feed.
    pub fn new(config: ProcessConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<TaskOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            config,
            outcome_tx: tx,
            children: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        });
        (manager, rx)
    }

    /// Spawn the child for a request and register its gatherer. Returns the
    /// child pid.
    pub async fn execute(self: &Arc<Self>, request: TaskRequest) -> Result<u32> {
        std::fs::create_dir_all(&self.config.logs_dir)?;

        let attempt = request.attempt_id;
        let stdout_path = self.log_path(attempt, "stdout");
        let stderr_path = self.log_path(attempt, "stderr");
        let engine_log_path = self.log_path(attempt, "log");

        // Resolve the program: scripts are written out first.
        let (program, prepend_args) = match &request.command {
            TaskCommand::Binary { path } => (path.clone(), Vec::new()),
            TaskCommand::Script { body } => {
                let script_path = self.log_path(attempt, "script");
                std::fs::write(&script_path, body)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o700))?;
                }
                (script_path.to_string_lossy().into_owned(), Vec::new())
            }
        };

        // Remote execution runs the agent binary with the target prepended.
        let (program, args) = if request.use_agent {
            let agent = self.config.agent_path.clone().ok_or_else(|| {
                EngineError::invalid_parameter(
                    "ProcessManager",
                    "task requests an agent but no agent binary is configured",
                )
            })?;
            let host = request.host.clone().unwrap_or_default();
            let target = match &request.user {
                Some(user) => format!("{user}@{host}"),
                None => host,
            };
            let mut args = vec![target, program];
            args.extend(prepend_args);
            args.extend(request.args.clone());
            (agent, args)
        } else {
            let mut args = prepend_args;
            args.extend(request.args.clone());
            (program, args)
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args);

        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        if let Some(wd) = &request.wd {
            cmd.current_dir(wd);
        }

        let stdout_file = std::fs::File::create(&stdout_path)?;
        let stderr_file = if request.merge_stderr {
            stdout_file.try_clone()?
        } else {
            std::fs::File::create(&stderr_path)?
        };

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::from(stdout_file));
        cmd.stderr(Stdio::from(stderr_file));

        #[cfg(unix)]
        self.apply_unix_settings(&mut cmd, &request, &engine_log_path)?;

        let started = std::time::Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            EngineError::new(
                "ProcessManager",
                format!("failed to spawn {program:?}: {e}"),
                crate::error::ErrorCode::IoError,
            )
        })?;

        let pid = child.id().ok_or_else(|| {
            EngineError::new(
                "ProcessManager",
                "child has no pid",
                crate::error::ErrorCode::Internal,
            )
        })?;

        self.children
            .lock()
            .unwrap()
            .insert(attempt, ChildSlot { pid });
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        // Write stdin and close it so the child sees EOF.
        let stdin_bytes = request.stdin.clone();
        let mut stdin_pipe = child.stdin.take();

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(mut pipe) = stdin_pipe.take() {
                if let Some(bytes) = stdin_bytes {
                    if let Err(e) = pipe.write_all(bytes.as_bytes()).await {
                        debug!(attempt, error = %e, "failed to write task stdin");
                    }
                }
                drop(pipe);
            }

            let exit = match child.wait().await {
                Ok(status) => exit_kind(status),
                Err(e) => {
                    warn!(attempt, error = %e, "wait failed for child");
                    ExitKind::Exited(-1)
                }
            };

            let stdout = read_log(&stdout_path).await;
            let stderr = if request.merge_stderr {
                String::new()
            } else {
                read_log(&stderr_path).await
            };
            let engine_log = read_log(&engine_log_path).await;

            if manager.config.logs_delete {
                for path in [&stdout_path, &stderr_path, &engine_log_path] {
                    let _ = tokio::fs::remove_file(path).await;
                }
                let _ = tokio::fs::remove_file(manager.log_path(attempt, "script")).await;
            }

            manager.children.lock().unwrap().remove(&attempt);

            let outcome = TaskOutcome {
                attempt_id: attempt,
                instance_id: request.instance_id,
                task_index: request.task_index,
                exit,
                stdout,
                stderr,
                engine_log,
                execution_time: started.elapsed(),
            };
            if manager.outcome_tx.send(outcome).is_err() {
                warn!(attempt, "outcome channel closed, dropping task outcome");
            }

            if manager.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                manager.drained.notify_waiters();
            }
        });

        Ok(pid)
    }

    #[cfg(unix)]
    fn apply_unix_settings(
        &self,
        cmd: &mut Command,
        request: &TaskRequest,
        engine_log_path: &std::path::Path,
    ) -> Result<()> {
        use std::ffi::CString;

        let log_path = CString::new(engine_log_path.to_string_lossy().as_bytes())
            .map_err(|_| EngineError::invalid_parameter("ProcessManager", "bad log path"))?;

        // Resolve the target uid before forking; getpwnam is not
        // async-signal-safe.
        let uid = match &request.user {
            Some(user) => {
                let c_user = CString::new(user.as_str()).map_err(|_| {
                    EngineError::invalid_parameter("ProcessManager", "bad user name")
                })?;
                let pw = unsafe { libc::getpwnam(c_user.as_ptr()) };
                if pw.is_null() {
                    return Err(EngineError::invalid_parameter(
                        "ProcessManager",
                        format!("unknown user {user:?}"),
                    ));
                }
                Some(unsafe { ((*pw).pw_uid, (*pw).pw_gid) })
            }
            None => None,
        };

        unsafe {
            cmd.pre_exec(move || {
                // New session so signals target the whole task group.
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }

                // Engine log channel on fd 3.
                let fd = libc::open(
                    log_path.as_ptr(),
                    libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                    0o644,
                );
                if fd < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if fd != 3 {
                    if libc::dup2(fd, 3) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    libc::close(fd);
                }

                if let Some((uid, gid)) = uid {
                    if libc::setgid(gid) < 0 || libc::setuid(uid) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }

        Ok(())
    }

    /// Signal an attempt's process: SIGTERM now, SIGKILL after a grace
    /// period if it is still alive. Returns false when the attempt has no
    /// registered child.
    pub fn kill(self: &Arc<Self>, attempt_id: u64) -> bool {
        let pid = match self.children.lock().unwrap().get(&attempt_id) {
            Some(slot) => slot.pid,
            None => {
                debug!(attempt_id, "kill requested but no child registered");
                return false;
            }
        };

        #[cfg(unix)]
        {
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid, "SIGTERM failed");
            }
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            let still_running = manager
                .children
                .lock()
                .unwrap()
                .get(&attempt_id)
                .map(|slot| slot.pid)
                == Some(pid);
            if still_running {
                debug!(pid, "child survived SIGTERM, sending SIGKILL");
                #[cfg(unix)]
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
            }
        });

        true
    }

    /// Number of children not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every in-flight child has been reaped and its outcome
    /// posted.
    pub async fn drain(&self) {
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn log_path(&self, attempt: u64, kind: &str) -> PathBuf {
        self.config.logs_dir.join(format!("{attempt}.{kind}"))
    }
}

fn exit_kind(status: std::process::ExitStatus) -> ExitKind {
    if let Some(code) = status.code() {
        return ExitKind::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitKind::Signaled(signal);
        }
    }
    ExitKind::Exited(-1)
}

async fn read_log(path: &std::path::Path) -> String {
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}
