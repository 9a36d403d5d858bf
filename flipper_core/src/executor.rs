use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Exit code reported when the harness itself failed (pipes, fork, wait).
pub const HARNESS_FAILURE_EXIT_CODE: i32 = -1;
/// Exit code reported when the target could not be executed at all.
pub const EXEC_FAILURE_EXIT_CODE: i32 = 127;
/// Signal terminations are reported as `SIGNAL_EXIT_BASE + signal`.
pub const SIGNAL_EXIT_BASE: i32 = 128;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);
const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(100);

/// How a single target execution ended. Exactly one applies per result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The target ran and exited with the given status code.
    Exited(i32),
    /// The target was killed by the given signal.
    Signaled(i32),
    /// The deadline passed and the harness terminated the target.
    TimedOut,
    /// The target could not be launched (missing, not executable, bad format).
    ExecFailure,
    /// The harness failed before or while supervising the target.
    HarnessFailure,
}

/// Everything captured from one target execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    /// Captured standard error, followed by any notes the harness appended
    /// (signal number, stdin write failure, timeout).
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    /// `true` iff `exit_code == 0`.
    pub success: bool,
    pub termination: Termination,
}

impl ExecutionResult {
    fn new(stdout: Vec<u8>, stderr: Vec<u8>, exit_code: i32, termination: Termination) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
            success: exit_code == 0,
            termination,
        }
    }

    pub fn harness_failure(message: impl Into<String>) -> Self {
        Self::new(
            Vec::new(),
            message.into().into_bytes(),
            HARNESS_FAILURE_EXIT_CODE,
            Termination::HarnessFailure,
        )
    }

    pub fn exec_failure(message: impl Into<String>) -> Self {
        Self::new(
            Vec::new(),
            message.into().into_bytes(),
            EXEC_FAILURE_EXIT_CODE,
            Termination::ExecFailure,
        )
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    pub fn timed_out(&self) -> bool {
        self.termination == Termination::TimedOut
    }
}

/// One request to run a target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Path of the executable; bare names are looked up in `PATH`.
    pub program: PathBuf,
    /// Full argument vector. `argv[0]` is passed as-is and never synthesized.
    pub argv: Vec<OsString>,
    /// Bytes written to the target's standard input before it is closed.
    pub stdin: Vec<u8>,
    /// When present and non-empty, replaces the target's whole environment.
    pub env: Option<BTreeMap<String, String>>,
}

impl Invocation {
    pub fn new<P, I, S>(program: P, argv: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            argv: argv.into_iter().map(Into::into).collect(),
            stdin: Vec::new(),
            env: None,
        }
    }

    pub fn with_stdin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.stdin = payload.into();
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }
}

/// Runs targets. `CommandExecutor` is the real implementation; tests of the
/// fuzz loop substitute a fake that never spawns anything.
pub trait Executor {
    /// Runs the invocation to completion. Every failure is folded into the
    /// returned result; nothing here is fatal to the caller.
    fn execute(&mut self, invocation: &Invocation) -> ExecutionResult;
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    /// Per-execution deadline. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Time between SIGTERM and SIGKILL once the deadline has passed.
    pub kill_grace: Duration,
    pub working_dir: Option<PathBuf>,
}

impl Default for CommandExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            kill_grace: DEFAULT_KILL_GRACE,
            working_dir: None,
        }
    }
}

/// Spawns the target with all three standard streams piped.
///
/// The stdin payload is written on its own thread while stdout and stderr
/// are drained on two more, so a target that fills one pipe while the harness
/// is busy with another cannot stall the run. The target is placed in its own
/// process group so a timeout also reaches anything it spawned.
#[derive(Debug, Default)]
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandExecutorConfig {
        &self.config
    }

    fn build_command(&self, invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&invocation.program);
        if let Some((arg0, rest)) = invocation.argv.split_first() {
            cmd.arg0(arg0);
            cmd.args(rest);
        }
        if let Some(env) = invocation.env.as_ref().filter(|env| !env.is_empty()) {
            cmd.env_clear();
            cmd.envs(env);
        }
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        cmd
    }

    /// Waits for the child until `deadline`, then escalates SIGTERM to
    /// SIGKILL against its process group. Returns the exit status and the
    /// last signal the harness sent, if it had to step in.
    fn wait_with_deadline(
        &self,
        child: &mut Child,
        deadline: Option<Instant>,
    ) -> io::Result<(ExitStatus, Option<Signal>)> {
        let Some(deadline) = deadline else {
            return child.wait().map(|status| (status, None));
        };

        if let Some(status) = poll_until(deadline, || child.try_wait())? {
            return Ok((status, None));
        }

        warn!(
            "Target {} exceeded {:?}, sending SIGTERM",
            child.id(),
            self.config.timeout.unwrap_or_default()
        );
        signal_group(child, Signal::SIGTERM);
        let grace = Instant::now() + self.config.kill_grace;
        if let Some(status) = poll_until(grace, || child.try_wait())? {
            return Ok((status, Some(Signal::SIGTERM)));
        }

        warn!("Target {} ignored SIGTERM, sending SIGKILL", child.id());
        signal_group(child, Signal::SIGKILL);
        if let Err(e) = child.kill() {
            debug!("Direct kill of {} failed: {e}", child.id());
        }
        child.wait().map(|status| (status, Some(Signal::SIGKILL)))
    }

    /// The target is reaped, but processes left in its group may still hold
    /// the pipes. Past `deadline` the group is terminated so the drains reach
    /// end-of-stream. Returns the last signal sent.
    fn settle_group(
        &self,
        child: &Child,
        deadline: Option<Instant>,
        settled: impl Fn() -> bool,
    ) -> Option<Signal> {
        let deadline = deadline?;
        if wait_for(deadline, &settled) {
            return None;
        }

        warn!(
            "Target {} exited but its process group still holds the pipes, sending SIGTERM",
            child.id()
        );
        signal_group(child, Signal::SIGTERM);
        if wait_for(Instant::now() + self.config.kill_grace, &settled) {
            return Some(Signal::SIGTERM);
        }

        warn!("Process group {} ignored SIGTERM, sending SIGKILL", child.id());
        signal_group(child, Signal::SIGKILL);
        Some(Signal::SIGKILL)
    }
}

impl Executor for CommandExecutor {
    fn execute(&mut self, invocation: &Invocation) -> ExecutionResult {
        let mut cmd = self.build_command(invocation);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return spawn_failure(&invocation.program, &e),
        };
        debug!(
            "Spawned {:?} as pid {} ({} stdin bytes)",
            invocation.program,
            child.id(),
            invocation.stdin.len()
        );

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let payload = invocation.stdin.as_slice();

        let (
            waited,
            straggler_signal,
            write_result,
            (stdout, stdout_err),
            (mut stderr, stderr_err),
        ) = thread::scope(|scope| {
            let writer = scope.spawn(move || feed_stdin(stdin, payload));
            let out_reader = scope.spawn(move || drain(stdout));
            let err_reader = scope.spawn(move || drain(stderr));

            let deadline = self.config.timeout.map(|timeout| Instant::now() + timeout);
            let waited = self.wait_with_deadline(&mut child, deadline);
            let settled =
                || writer.is_finished() && out_reader.is_finished() && err_reader.is_finished();
            let straggler_signal = match &waited {
                // Once the target itself was signaled, the rest of the group
                // gets one grace period to go away.
                Ok((_, Some(_))) => self.settle_group(
                    &child,
                    Some(Instant::now() + self.config.kill_grace),
                    settled,
                ),
                Ok((_, None)) => self.settle_group(&child, deadline, settled),
                Err(_) => {
                    // Unblock the drains before joining them.
                    signal_group(&child, Signal::SIGKILL);
                    let _ = child.kill();
                    let _ = child.wait();
                    None
                }
            };

            let write_result = writer
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));
            let stdout = out_reader
                .join()
                .unwrap_or_else(|_| (Vec::new(), Some(io::Error::other("reader panicked"))));
            let stderr = err_reader
                .join()
                .unwrap_or_else(|_| (Vec::new(), Some(io::Error::other("reader panicked"))));
            (waited, straggler_signal, write_result, stdout, stderr)
        });

        if let Err(e) = write_result {
            warn!("Error writing to child stdin: {e}");
            append_note(&mut stderr, &format!("Error writing to child stdin: {e}"));
        }
        for (stream, error) in [("stdout", stdout_err), ("stderr", stderr_err)] {
            if let Some(e) = error {
                warn!("Error reading child {stream}: {e}");
                append_note(&mut stderr, &format!("Error reading child {stream}: {e}"));
            }
        }

        let (status, sent_signal) = match waited {
            Ok(waited) => waited,
            Err(e) => {
                warn!("Error waiting for child process: {e}");
                append_note(&mut stderr, &format!("Error waiting for child: {e}"));
                return ExecutionResult::new(
                    stdout,
                    stderr,
                    HARNESS_FAILURE_EXIT_CODE,
                    Termination::HarnessFailure,
                );
            }
        };

        let (exit_code, termination) = decode_status(
            status,
            sent_signal.or(straggler_signal),
            &mut stderr,
            self.config.timeout,
        );
        trace!("stdout: {}", String::from_utf8_lossy(&stdout));
        trace!("stderr: {}", String::from_utf8_lossy(&stderr));
        debug!("Target finished: {termination:?}, exit code {exit_code}");

        ExecutionResult::new(stdout, stderr, exit_code, termination)
    }
}

/// Runs `path` once with no deadline and the default configuration.
pub fn execute(
    path: impl AsRef<Path>,
    argv: &[&str],
    stdin_payload: &[u8],
    env_overrides: Option<&BTreeMap<String, String>>,
) -> ExecutionResult {
    let mut invocation = Invocation::new(path.as_ref(), argv.iter().copied())
        .with_stdin(stdin_payload);
    invocation.env = env_overrides.cloned();
    CommandExecutor::default().execute(&invocation)
}

fn feed_stdin(stdin: Option<ChildStdin>, payload: &[u8]) -> io::Result<()> {
    let Some(mut pipe) = stdin else {
        return Ok(());
    };
    if !payload.is_empty() {
        pipe.write_all(payload)?;
    }
    // Dropping the pipe closes it, which is the target's end-of-input.
    Ok(())
}

fn drain<R: Read>(pipe: Option<R>) -> (Vec<u8>, Option<io::Error>) {
    let mut captured = Vec::new();
    let error = match pipe {
        Some(mut pipe) => pipe.read_to_end(&mut captured).err(),
        None => None,
    };
    (captured, error)
}

fn poll_until<T>(
    deadline: Instant,
    mut probe: impl FnMut() -> io::Result<Option<T>>,
) -> io::Result<Option<T>> {
    loop {
        if let Some(value) = probe()? {
            return Ok(Some(value));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL_INTERVAL.min(deadline - now));
    }
}

fn wait_for(deadline: Instant, done: impl Fn() -> bool) -> bool {
    matches!(
        poll_until(deadline, || Ok::<_, io::Error>(done().then_some(()))),
        Ok(Some(()))
    )
}

fn signal_group(child: &Child, signal: Signal) {
    let Ok(raw) = i32::try_from(child.id()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        debug!("killpg({raw}, {signal:?}) failed: {e}");
    }
}

/// Spawn errors raised by `execve` itself mean the target could not be run;
/// anything else (descriptor or process exhaustion) is the harness's fault.
fn spawn_failure(program: &Path, error: &io::Error) -> ExecutionResult {
    let exec_class = matches!(
        error.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    ) || error.raw_os_error().map(Errno::from_raw).is_some_and(|errno| {
        matches!(
            errno,
            Errno::ENOEXEC
                | Errno::E2BIG
                | Errno::ENOTDIR
                | Errno::ELOOP
                | Errno::ENAMETOOLONG
                | Errno::ETXTBSY
                | Errno::EISDIR
        )
    });

    if exec_class {
        warn!("Failed to execute {program:?}: {error}");
        ExecutionResult::exec_failure(format!("Failed to execute {program:?}: {error}\n"))
    } else {
        warn!("Failed to spawn {program:?}: {error}");
        ExecutionResult::harness_failure(format!("Failed to spawn {program:?}: {error}\n"))
    }
}

/// `intervention` is the last signal the harness sent after the deadline. It
/// turns the result into a timeout whose exit code is `128 + signal`, even if
/// the target caught the signal and exited on its own.
fn decode_status(
    status: ExitStatus,
    intervention: Option<Signal>,
    stderr: &mut Vec<u8>,
    timeout: Option<Duration>,
) -> (i32, Termination) {
    let exit_code = match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => {
            append_note(stderr, &format!("Process terminated by signal: {signal}"));
            SIGNAL_EXIT_BASE + signal
        }
        (None, None) => {
            append_note(stderr, "Process terminated abnormally.");
            return (HARNESS_FAILURE_EXIT_CODE, Termination::HarnessFailure);
        }
    };

    if let Some(sent) = intervention {
        let limit = timeout.map(|t| t.as_millis()).unwrap_or_default();
        append_note(stderr, &format!("Process timed out after {limit} ms"));
        let exit_code = match status.signal() {
            Some(_) => exit_code,
            None => SIGNAL_EXIT_BASE + sent as i32,
        };
        return (exit_code, Termination::TimedOut);
    }

    match status.signal() {
        Some(signal) => (exit_code, Termination::Signaled(signal)),
        None => (exit_code, Termination::Exited(exit_code)),
    }
}

fn append_note(stderr: &mut Vec<u8>, note: &str) {
    stderr.extend_from_slice(note.as_bytes());
    stderr.push(b'\n');
}
