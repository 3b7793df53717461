//! Child processes with timeouts and bounded output.
//!
//! Both the sandbox backend and the subprocess model client run through
//! [`run_bounded`], so every external program the agent touches is killed on timeout
//! and can never buffer unbounded output in memory.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, with signal deaths and timeouts reported as `-1`.
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            return -1;
        }
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&truncation_notice("stdout", self.stdout_truncated));
        text
    }

    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        text.push_str(&truncation_notice("stderr", self.stderr_truncated));
        text
    }
}

fn truncation_notice(stream: &str, truncated: usize) -> String {
    if truncated > 0 {
        format!("\n[{stream} truncated {truncated} bytes]\n")
    } else {
        String::new()
    }
}

/// How long to keep draining output after the child has exited.
///
/// Background processes started by the child inherit its pipes and may hold them
/// open indefinitely; whatever was captured by then is returned.
const OUTPUT_GRACE: Duration = Duration::from_millis(250);

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// The child runs in its own process group, which is killed as a whole on timeout.
/// Stdin is fed and output is drained on helper threads; bytes beyond
/// `output_limit_bytes` per stream are discarded and counted.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_bounded(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let (done_tx, done_rx) = mpsc::channel();
    let stdout_sink = spawn_reader(stdout, output_limit_bytes, done_tx.clone());
    let stderr_sink = spawn_reader(stderr, output_limit_bytes, done_tx);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Children may exit without reading stdin; the exit status reports that.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                debug!(err = %e, "child closed stdin early");
            }
        });
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_process_group(&mut child);
            child.wait().context("wait command after kill")?
        }
    };

    let deadline = Instant::now() + OUTPUT_GRACE;
    let mut drained = 0;
    while drained < 2 {
        let left = deadline.saturating_duration_since(Instant::now());
        match done_rx.recv_timeout(left) {
            Ok(()) => drained += 1,
            Err(_) => {
                warn!("output pipes still held open after exit; returning captured output");
                break;
            }
        }
    }

    let (stdout, stdout_truncated) = stdout_sink.take();
    let (stderr, stderr_truncated) = stderr_sink.take();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Kill the child and everything it started.
fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        // The shell builtin works where no standalone `kill` binary is installed.
        let script = format!("kill -KILL -- -{}", child.id());
        match Command::new("sh")
            .args(["-c", &script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(?status, "kill process group failed"),
            Err(e) => warn!(err = %e, "kill process group failed"),
        }
    }
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill child");
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

/// Output captured so far by a reader thread.
#[derive(Debug, Clone, Default)]
struct OutputSink(Arc<Mutex<Captured>>);

impl OutputSink {
    fn push(&self, chunk: &[u8], limit: usize) {
        let mut captured = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = limit.saturating_sub(captured.bytes.len());
        let keep = chunk.len().min(remaining);
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += chunk.len() - keep;
    }

    fn take(&self) -> (Vec<u8>, usize) {
        let mut captured = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        (std::mem::take(&mut captured.bytes), captured.truncated)
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut reader: R,
    limit: usize,
    done: mpsc::Sender<()>,
) -> OutputSink {
    let sink = OutputSink::default();
    let writer = sink.clone();
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => writer.push(&chunk[..n], limit),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(err = %e, "read output");
                    break;
                }
            }
        }
        let _ = done.send(());
    });
    sink
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_streams_and_exit_code() {
        let output = run_bounded(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert_eq!(output.exit_code(), 3);
        assert_eq!(output.stdout_text(), "out\n");
        assert_eq!(output.stderr_text(), "err\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn feeds_stdin() {
        let output =
            run_bounded(sh("cat"), Some(b"hello".as_slice()), Duration::from_secs(10), 1024).expect("run");
        assert_eq!(output.stdout, b"hello");
    }

    #[test]
    fn truncates_output_past_limit() {
        let output = run_bounded(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.stdout_text().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn kills_on_timeout() {
        let output =
            run_bounded(sh("sleep 2"), None, Duration::from_millis(100), 1024).expect("run");
        assert!(output.timed_out);
        assert_eq!(output.exit_code(), -1);
    }

    #[test]
    fn background_child_does_not_hold_the_call_open() {
        let started = Instant::now();
        let output = run_bounded(
            sh("sleep 6 & echo started"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(output.exit_code(), 0);
        assert_eq!(output.stdout, b"started\n");
    }

    #[test]
    fn unread_stdin_does_not_outlive_timeout() {
        let input = vec![b'x'; 200_000];
        let started = Instant::now();
        let output = run_bounded(
            sh("sleep 5"),
            Some(input.as_slice()),
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(output.timed_out);
    }

    #[test]
    fn timeout_kills_grandchildren() {
        let started = Instant::now();
        let output = run_bounded(
            sh("sleep 6; echo late"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(output.timed_out);
        assert!(output.stdout.is_empty());
    }
}
