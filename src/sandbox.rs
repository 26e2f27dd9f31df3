//! Core sandbox execution logic.
//!
//! [`run`] launches a child process, streams its stdout/stderr to an
//! [`OutputSink`] chunk by chunk, optionally hands the caller an
//! [`InputSink`] feeding the child's stdin, and enforces a wall-clock limit
//! through a pluggable [`Terminator`].

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

/// How long a terminated process may take to actually go away before the
/// host-side handle is killed as well.
const KILL_SETTLE: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 8 * 1024;

/// What to launch.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub time_limit: Duration,
    /// Address-space rlimit applied to the child before exec, in bytes.
    pub rlimit_as: Option<u64>,
    /// Open file descriptor rlimit applied to the child before exec.
    pub rlimit_nofile: Option<u64>,
    /// Run the child in its own process group. The whole group is killed once
    /// the leader exits, so no descendant outlives the run.
    pub own_process_group: bool,
}

impl RunSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, time_limit: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            time_limit,
            rlimit_as: None,
            rlimit_nofile: None,
            own_process_group: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process ended on its own. Signalled processes report `128 + signal`.
    Exited(i32),
    /// The time limit fired and the process was forcibly terminated.
    TimedOut,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Exited(code) => write!(f, "exited with code {}", code),
            RunOutcome::TimedOut => f.write_str("timed out"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("error running {program}: {source}")]
    Launch { program: String, source: io::Error },
    #[error("error on {stream} of {program}: {source}")]
    Stream {
        program: String,
        stream: &'static str,
        source: io::Error,
    },
    #[error("error killing {program} after timeout: {source}")]
    Termination { program: String, source: io::Error },
}

/// Receives process output as soon as it is read.
pub trait OutputSink: Send {
    fn on_stdout(&mut self, chunk: &[u8]);
    fn on_stderr(&mut self, chunk: &[u8]);
}

/// Collects stdout and stderr interleaved in arrival order.
#[derive(Debug, Default)]
pub struct CombinedOutput(pub Vec<u8>);

impl OutputSink for CombinedOutput {
    fn on_stdout(&mut self, chunk: &[u8]) {
        self.0.extend_from_slice(chunk);
    }

    fn on_stderr(&mut self, chunk: &[u8]) {
        self.0.extend_from_slice(chunk);
    }
}

/// Writable handle on a running process's stdin.
///
/// Writes are queued and pumped in order. Dropping every clone closes stdin.
#[derive(Debug, Clone)]
pub struct InputSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl InputSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` once the process side is gone.
    pub fn write(&self, bytes: &[u8]) -> bool {
        self.tx.send(bytes.to_vec()).is_ok()
    }
}

/// Forceful termination strategy invoked when the time limit fires.
#[async_trait]
pub trait Terminator: Send + Sync {
    async fn terminate(&self, child: &mut Child) -> io::Result<()>;
}

pub type InputSetup = Box<dyn FnOnce(InputSink) + Send>;

/// Run `spec` to completion.
///
/// `provide_input`, when given, is called once right after spawn, before any
/// output is read.
pub async fn run(
    spec: &RunSpec,
    terminator: &dyn Terminator,
    sink: &mut dyn OutputSink,
    provide_input: Option<InputSetup>,
) -> Result<RunOutcome, RunError> {
    info!(program = %spec.program, args = ?spec.args, cwd = %spec.cwd.display(), "Spawning command");

    let mut child = command_for(spec, provide_input.is_some())
        .spawn()
        .map_err(|source| RunError::Launch {
            program: spec.program.clone(),
            source,
        })?;

    let mut pump = match (provide_input, child.stdin.take()) {
        (Some(setup), Some(stdin)) => {
            let (input, rx) = InputSink::channel();
            setup(input);
            Some(tokio::spawn(pump_stdin(stdin, rx)))
        }
        _ => None,
    };

    let result = supervise(spec, terminator, sink, &mut child, &mut pump).await;
    if let Some(pump) = pump {
        pump.abort();
    }

    match &result {
        Ok(outcome) => {
            info!(program = %spec.program, args = ?spec.args, outcome = %outcome, "Command resolved")
        }
        Err(e) => warn!(program = %spec.program, args = ?spec.args, error = %e, "Command failed"),
    }
    result
}

/// Run without input and return the outcome with stdout/stderr combined.
pub async fn run_collect(
    spec: &RunSpec,
    terminator: &dyn Terminator,
) -> Result<(RunOutcome, Vec<u8>), RunError> {
    let mut output = CombinedOutput::default();
    let outcome = run(spec, terminator, &mut output, None).await?;
    Ok((outcome, output.0))
}

fn command_for(spec: &RunSpec, interactive: bool) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(if interactive {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if spec.own_process_group {
        cmd.process_group(0);
    }
    if spec.rlimit_as.is_some() || spec.rlimit_nofile.is_some() {
        let (address_space, nofile) = (spec.rlimit_as, spec.rlimit_nofile);
        // SAFETY: setrlimit is async-signal-safe and only touches the child.
        unsafe {
            cmd.pre_exec(move || {
                use nix::sys::resource::{setrlimit, Resource};
                if let Some(bytes) = address_space {
                    setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
                }
                if let Some(files) = nofile {
                    setrlimit(Resource::RLIMIT_NOFILE, files, files)?;
                }
                setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
                Ok(())
            });
        }
    }
    cmd
}

async fn pump_stdin(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> io::Result<()> {
    while let Some(chunk) = rx.recv().await {
        let written = match stdin.write_all(&chunk).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {}
            // The program closed its stdin or exited; further input has nowhere to go.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn wait_pump(pump: &mut Option<JoinHandle<io::Result<()>>>) -> io::Result<()> {
    match pump {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(join) => Err(io::Error::other(join)),
        },
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clock {
    Armed,
    Terminated,
    Expired,
}

async fn supervise(
    spec: &RunSpec,
    terminator: &dyn Terminator,
    sink: &mut dyn OutputSink,
    child: &mut Child,
    pump: &mut Option<JoinHandle<io::Result<()>>>,
) -> Result<RunOutcome, RunError> {
    let stream_err = |stream: &'static str, source: io::Error| RunError::Stream {
        program: spec.program.clone(),
        stream,
        source,
    };
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| stream_err("stdout", io::ErrorKind::BrokenPipe.into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| stream_err("stderr", io::ErrorKind::BrokenPipe.into()))?;

    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut status: Option<ExitStatus> = None;
    let mut clock = Clock::Armed;
    // Captured up front: the id is gone once the leader is reaped.
    let group = if spec.own_process_group { child.id() } else { None };

    let deadline = sleep(spec.time_limit);
    tokio::pin!(deadline);

    while status.is_none() || stdout_open || stderr_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if stdout_open => match read {
                Ok(0) => stdout_open = false,
                Ok(n) => sink.on_stdout(&out_buf[..n]),
                Err(e) => return Err(abandon(spec, terminator, child, stream_err("stdout", e)).await),
            },
            read = stderr.read(&mut err_buf), if stderr_open => match read {
                Ok(0) => stderr_open = false,
                Ok(n) => sink.on_stderr(&err_buf[..n]),
                Err(e) => return Err(abandon(spec, terminator, child, stream_err("stderr", e)).await),
            },
            waited = child.wait(), if status.is_none() => {
                status = Some(waited.map_err(|e| stream_err("wait", e))?);
                if let Some(pgid) = group {
                    kill_group(spec, pgid);
                }
            },
            pumped = wait_pump(pump), if pump.is_some() => {
                *pump = None;
                if let Err(e) = pumped {
                    return Err(abandon(spec, terminator, child, stream_err("stdin", e)).await);
                }
            },
            _ = &mut deadline, if clock != Clock::Expired => {
                if status.is_some() {
                    // Exited on its own but something still holds the pipes open.
                    break;
                }
                match clock {
                    Clock::Armed => {
                        warn!(program = %spec.program, args = ?spec.args, "Killing process due to timeout");
                        if let Err(source) = terminator.terminate(child).await {
                            error!(program = %spec.program, args = ?spec.args, error = %source,
                                   "Forced termination failed; sandboxed process may still be running");
                            let _ = child.start_kill();
                            return Err(RunError::Termination { program: spec.program.clone(), source });
                        }
                        clock = Clock::Terminated;
                        deadline.as_mut().reset(Instant::now() + KILL_SETTLE);
                    }
                    Clock::Terminated => {
                        warn!(program = %spec.program, "Process outlived termination; killing host handle");
                        let _ = child.start_kill();
                        clock = Clock::Expired;
                    }
                    Clock::Expired => {}
                }
            },
        }
    }

    if clock != Clock::Armed {
        return Ok(RunOutcome::TimedOut);
    }
    match status {
        Some(status) => Ok(RunOutcome::Exited(exit_code(status))),
        None => Err(stream_err("wait", io::ErrorKind::UnexpectedEof.into())),
    }
}

/// Kills whatever is left of the leader's process group.
fn kill_group(spec: &RunSpec, pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => info!(program = %spec.program, pgid, "Killed leftover process group"),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => error!(program = %spec.program, pgid, error = %e, "Failed to kill leftover process group"),
    }
}

/// Best-effort teardown before surfacing a stream failure.
async fn abandon(
    spec: &RunSpec,
    terminator: &dyn Terminator,
    child: &mut Child,
    err: RunError,
) -> RunError {
    if let Err(e) = terminator.terminate(child).await {
        error!(program = %spec.program, error = %e, "Failed to stop process after stream error");
    }
    let _ = child.start_kill();
    err
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct KillHandle;

    #[async_trait]
    impl Terminator for KillHandle {
        async fn terminate(&self, child: &mut Child) -> io::Result<()> {
            child.start_kill()
        }
    }

    struct Refuses(Arc<AtomicUsize>);

    #[async_trait]
    impl Terminator for Refuses {
        async fn terminate(&self, _child: &mut Child) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::other("backend unavailable"))
        }
    }

    #[derive(Default)]
    struct Split {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    }

    impl OutputSink for Split {
        fn on_stdout(&mut self, chunk: &[u8]) {
            self.stdout.extend_from_slice(chunk);
        }
        fn on_stderr(&mut self, chunk: &[u8]) {
            self.stderr.extend_from_slice(chunk);
        }
    }

    fn sh(script: &str, limit: Duration) -> RunSpec {
        RunSpec::new("sh", std::env::temp_dir(), limit).args(["-c", script])
    }

    #[tokio::test]
    async fn streams_both_pipes_and_reports_exit_code() {
        let spec = sh("echo out; echo err >&2; exit 3", Duration::from_secs(5));
        let mut sink = Split::default();
        let outcome = run(&spec, &KillHandle, &mut sink, None).await.unwrap();
        assert_eq!(outcome, RunOutcome::Exited(3));
        assert_eq!(sink.stdout, b"out\n");
        assert_eq!(sink.stderr, b"err\n");
    }

    #[tokio::test]
    async fn timeout_is_distinct_from_nonzero_exit() {
        let spec = sh("while :; do :; done", Duration::from_millis(300));
        let started = std::time::Instant::now();
        let outcome = run(&spec, &KillHandle, &mut CombinedOutput::default(), None)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));

        let spec = sh("exit 137", Duration::from_secs(5));
        let outcome = run(&spec, &KillHandle, &mut CombinedOutput::default(), None)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Exited(137));
    }

    #[tokio::test]
    async fn failed_termination_is_reported_as_termination_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let spec = sh("sleep 10", Duration::from_millis(100));
        let err = run(&spec, &Refuses(calls.clone()), &mut CombinedOutput::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Termination { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_failure() {
        let spec = RunSpec::new(
            "/nonexistent/definitely-not-here",
            std::env::temp_dir(),
            Duration::from_secs(1),
        );
        let err = run_collect(&spec, &KillHandle).await.unwrap_err();
        assert!(matches!(err, RunError::Launch { .. }));
    }

    #[tokio::test]
    async fn input_sink_is_provided_before_output_and_feeds_stdin() {
        let spec = sh("read line; echo \"got $line\"", Duration::from_secs(5));
        let mut sink = Split::default();
        let setup: InputSetup = Box::new(|input: InputSink| {
            assert!(input.write(b"hello\n"));
        });
        let outcome = run(&spec, &KillHandle, &mut sink, Some(setup)).await.unwrap();
        assert_eq!(outcome, RunOutcome::Exited(0));
        assert_eq!(sink.stdout, b"got hello\n");
    }

    #[tokio::test]
    async fn dropping_the_input_sink_closes_stdin() {
        let spec = sh("cat; echo done", Duration::from_secs(5));
        let mut sink = Split::default();
        let setup: InputSetup = Box::new(|input: InputSink| {
            input.write(b"abc");
            drop(input);
        });
        let outcome = run(&spec, &KillHandle, &mut sink, Some(setup)).await.unwrap();
        assert_eq!(outcome, RunOutcome::Exited(0));
        assert_eq!(sink.stdout, b"abcdone\n");
    }

    #[tokio::test]
    async fn collects_combined_output() {
        let spec = sh("printf a; printf b >&2", Duration::from_secs(5));
        let (outcome, output) = run_collect(&spec, &KillHandle).await.unwrap();
        assert_eq!(outcome, RunOutcome::Exited(0));
        assert_eq!(output.len(), 2);
    }

    #[test]
    fn signalled_status_maps_above_128() {
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code(ExitStatus::from_raw(2 << 8)), 2);
    }
}
