mod docker_runner;
mod runner;
mod simple_runner;

// Re-export the trait and common types
pub use docker_runner::DockerRunner;
pub use runner::SandboxRunner;
pub use simple_runner::SimpleRunner;

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::config::{DockerConfig, RunnerKind};

/// How long pipes may stay open after the process exited
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Ceilings for a single execution
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub time_limit: Duration,
    pub memory_limit: u64,
    pub cpus: f64,
    pub pids_limit: u32,
}

/// What came back from the sandboxed process, before interpretation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRunResult {
    /// `None` when the process was killed for exceeding its deadline
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl RawRunResult {
    fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Default::default()
        }
    }
}

/// Creates the sandbox runner selected by configuration
///
/// `Auto` picks the docker runner when the docker binary is on `PATH`, and
/// otherwise falls back to a SimpleRunner that provides timeouts but no
/// isolation.
pub fn create_sandbox_runner(
    kind: RunnerKind,
    docker: &DockerConfig,
    capture_limit: usize,
    shutdown: CancellationToken,
) -> Result<Box<dyn SandboxRunner>> {
    let kind = match kind {
        RunnerKind::Auto if docker_available(&docker.binary) => RunnerKind::Docker,
        RunnerKind::Auto => RunnerKind::Simple,
        other => other,
    };

    match kind {
        RunnerKind::Docker => {
            log::info!("Creating DockerRunner (container isolation)");
            Ok(Box::new(DockerRunner::new(docker, capture_limit, shutdown)))
        }
        RunnerKind::Simple => {
            log::info!("Creating SimpleRunner (no isolation)");
            Ok(Box::new(SimpleRunner::new(capture_limit, shutdown)))
        }
        RunnerKind::Auto => bail!("runner kind was not resolved"),
    }
}

fn docker_available(binary: &str) -> bool {
    std::process::Command::new("which")
        .arg(binary)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Exit status and bounded stream contents of a finished process
#[derive(Debug)]
struct Captured {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

#[derive(Debug)]
enum Supervised {
    Finished(Captured),
    TimedOut,
    Cancelled,
}

/// Waits for the child under a wall-clock deadline while draining its pipes.
///
/// The run ends when the child exits, not when its pipes close. `on_exit` runs
/// right after the exit so the caller can kill leftover descendants; pipes
/// still open after that are drained for [`PIPE_DRAIN_GRACE`] at most.
///
/// On `TimedOut` or `Cancelled` the child is still running; the caller is
/// responsible for tearing it down.
async fn supervise(
    child: &mut Child,
    deadline: Duration,
    capture_limit: usize,
    shutdown: &CancellationToken,
    on_exit: impl FnOnce(),
) -> io::Result<Supervised> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut captured_stdout = Vec::new();
    let mut captured_stderr = Vec::new();

    let status = {
        let drain = async {
            tokio::try_join!(
                read_bounded(stdout, capture_limit, &mut captured_stdout),
                read_bounded(stderr, capture_limit, &mut captured_stderr),
            )
            .map(|_| ())
        };
        tokio::pin!(drain);
        let mut drained = false;

        let expired = tokio::time::sleep(deadline);
        tokio::pin!(expired);

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                res = &mut drain, if !drained => {
                    res?;
                    drained = true;
                }
                _ = &mut expired => return Ok(Supervised::TimedOut),
                _ = shutdown.cancelled() => return Ok(Supervised::Cancelled),
            }
        };

        on_exit();
        if !drained && tokio::time::timeout(PIPE_DRAIN_GRACE, &mut drain).await.is_err() {
            log::debug!("Pipes still open {PIPE_DRAIN_GRACE:?} after exit, keeping partial output");
        }
        status
    };

    Ok(Supervised::Finished(Captured {
        exit_code: exit_code(status),
        stdout: captured_stdout,
        stderr: captured_stderr,
    }))
}

/// Appends the first `limit` bytes of `reader` to `buf` and discards the rest,
/// so a chatty program can neither exhaust memory nor stall on a full pipe.
/// Whatever was read survives if the future is dropped.
async fn read_bounded<R>(reader: Option<R>, limit: usize, buf: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(room)]);
    }
}

/// Shell convention: death by signal N reports as 128 + N
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_bounded_truncates_and_drains() {
        let data = vec![b'x'; 100_000];
        let mut reader = &data[..];
        let mut out = Vec::new();
        read_bounded(Some(&mut reader), 100, &mut out).await.unwrap();
        assert_eq!(out.len(), 100);
        assert!(reader.is_empty());

        let none: Option<&[u8]> = None;
        let mut out = Vec::new();
        read_bounded(none, 100, &mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_simple_runner_selected_explicitly() {
        let runner = create_sandbox_runner(
            RunnerKind::Simple,
            &DockerConfig::default(),
            1024,
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(runner.name(), "simple");
    }

    #[test]
    fn test_auto_falls_back_without_docker() {
        let docker = DockerConfig {
            binary: "definitely-not-a-container-engine".to_string(),
            ..Default::default()
        };
        let runner =
            create_sandbox_runner(RunnerKind::Auto, &docker, 1024, CancellationToken::new())
                .unwrap();
        assert_eq!(runner.name(), "simple");
    }
}
