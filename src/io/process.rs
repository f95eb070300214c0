//! Child processes with a hard deadline and bounded output capture.
//!
//! Every child runs in its own process group so a timeout can take down the
//! whole tree: SIGTERM to the group, a grace interval, then SIGKILL.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// How long readers may keep draining pipes after the child is gone.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
}

impl ProcessSpec {
    pub fn new(program: impl Into<OsString>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn display(&self) -> String {
        let mut out = self.program.to_string_lossy().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited { code: Option<i32>, success: bool },
    TimedOut,
    /// Stopped by the caller's abort token.
    Aborted,
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub exit: ProcessExit,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn stdout_text(&self) -> String {
        with_truncation_notice(&self.stdout, self.stdout_truncated)
    }

    pub fn stderr_text(&self) -> String {
        with_truncation_notice(&self.stderr, self.stderr_truncated)
    }

    pub fn truncated(&self) -> bool {
        self.stdout_truncated > 0 || self.stderr_truncated > 0
    }
}

fn with_truncation_notice(bytes: &[u8], truncated: usize) -> String {
    let mut text = String::from_utf8_lossy(bytes).to_string();
    if truncated > 0 {
        text.push_str(&format!("\n[output truncated: {} bytes omitted]", truncated));
    }
    text
}

#[derive(Debug)]
struct Capture {
    buf: Vec<u8>,
    limit: usize,
    truncated: usize,
}

impl Capture {
    fn shared(limit: usize) -> Arc<Mutex<Capture>> {
        Arc::new(Mutex::new(Capture {
            buf: Vec::new(),
            limit,
            truncated: 0,
        }))
    }

    fn extend(&mut self, chunk: &[u8]) {
        let remaining = self.limit.saturating_sub(self.buf.len());
        let keep = chunk.len().min(remaining);
        self.buf.extend_from_slice(&chunk[..keep]);
        self.truncated += chunk.len() - keep;
    }
}

enum Waited {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Aborted,
}

/// Runs `spec` to completion, timeout, or abort.
///
/// A spawn failure is returned as `Err` untouched so the caller can tell a
/// missing executable from a transient launch race. Every other outcome is
/// an `Ok(ProcessOutput)`; by the time it returns the child has been reaped.
#[instrument(skip_all, fields(program = %spec.program.to_string_lossy(), timeout_secs = limits.timeout.as_secs()))]
pub async fn run_bounded(
    spec: &ProcessSpec,
    limits: &ProcessLimits,
    abort: &CancellationToken,
) -> io::Result<ProcessOutput> {
    let mut std_cmd = std::process::Command::new(&spec.program);
    std_cmd
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }
    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(true);

    let started = Instant::now();
    let mut child = cmd.spawn()?;
    // `Child::id` goes away once the child is reaped; the group id doesn't.
    let pgid = child.id();
    debug!(pid = ?pgid, "child spawned");

    let stdout_capture = Capture::shared(limits.output_limit_bytes);
    let stderr_capture = Capture::shared(limits.output_limit_bytes);
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(stdout, stdout_capture.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(stderr, stderr_capture.clone())));
    }

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = tokio::time::sleep(limits.timeout) => Waited::TimedOut,
        _ = abort.cancelled() => Waited::Aborted,
    };

    let exit = match waited {
        Waited::Exited(Ok(status)) => {
            // Background grandchildren die with the leader.
            #[cfg(unix)]
            if let Some(pid) = pgid {
                signal_group(pid, nix::sys::signal::Signal::SIGKILL);
            }
            ProcessExit::Exited {
                code: status.code(),
                success: status.success(),
            }
        }
        Waited::Exited(Err(e)) => {
            warn!(error = %e, "wait on child failed; killing");
            terminate(&mut child, Duration::ZERO).await;
            ProcessExit::Exited {
                code: None,
                success: false,
            }
        }
        Waited::TimedOut => {
            warn!(timeout_secs = limits.timeout.as_secs(), "child timed out, terminating");
            terminate(&mut child, limits.kill_grace).await;
            ProcessExit::TimedOut
        }
        Waited::Aborted => {
            warn!("child aborted by caller, terminating");
            terminate(&mut child, limits.kill_grace).await;
            ProcessExit::Aborted
        }
    };

    drain_pumps(pumps).await;
    let duration = started.elapsed();

    let (stdout, stdout_truncated) = take_capture(&stdout_capture);
    let (stderr, stderr_truncated) = take_capture(&stderr_capture);
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }
    debug!(?exit, duration_ms = duration.as_millis() as u64, "child finished");

    Ok(ProcessOutput {
        exit,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        duration,
    })
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, sink: Arc<Mutex<Capture>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut capture) = sink.lock() {
                    capture.extend(&chunk[..n]);
                }
            }
        }
    }
}

/// A grandchild that escaped the process group can hold a pipe open
/// forever; whatever was captured by then is kept.
async fn drain_pumps(pumps: Vec<JoinHandle<()>>) {
    let deadline = tokio::time::Instant::now() + PIPE_DRAIN_TIMEOUT;
    for mut handle in pumps {
        if tokio::time::timeout_at(deadline, &mut handle)
            .await
            .is_err()
        {
            warn!("output pipe still open after exit; abandoning reader");
            handle.abort();
        }
    }
}

fn take_capture(capture: &Arc<Mutex<Capture>>) -> (Vec<u8>, usize) {
    match capture.lock() {
        Ok(mut c) => (std::mem::take(&mut c.buf), c.truncated),
        Err(_) => (Vec::new(), 0),
    }
}

/// Terminates the child's process group: SIGTERM, up to `grace` for it to
/// exit, then SIGKILL. Always reaps the direct child before returning.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::Signal;

        signal_group(pid, Signal::SIGTERM);
        if !grace.is_zero() && tokio::time::timeout(grace, child.wait()).await.is_ok() {
            // Leader is gone; sweep anything left in its group.
            signal_group(pid, Signal::SIGKILL);
            return;
        }
        signal_group(pid, Signal::SIGKILL);
    }

    if let Err(e) = child.start_kill() {
        debug!(error = %e, "start_kill after group kill");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap child");
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        // ESRCH: the group already exited
        debug!(pid, ?signal, error = %e, "killpg");
    }
}
