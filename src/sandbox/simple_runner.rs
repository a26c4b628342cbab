use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::SandboxError;
use crate::language::LanguageProfile;
use crate::workspace::Workspace;

use super::{RawRunResult, ResourceLimits, SandboxRunner, Supervised, supervise};

const SHELL: &str = "/bin/sh";
const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A simple runner that executes code without sandboxing
///
/// SimpleRunner runs the profile command with the host's `/bin/sh` inside the
/// workspace directory. It enforces the wall-clock limit, and kills the whole
/// process group when a run ends, but applies no memory, filesystem, network
/// or permission controls and ignores the profile's image. This is intended
/// for development/testing environments where security isolation is not
/// critical.
pub struct SimpleRunner {
    capture_limit: usize,
    shutdown: CancellationToken,
}

impl SimpleRunner {
    pub fn new(capture_limit: usize, shutdown: CancellationToken) -> Self {
        log::warn!(
            "SimpleRunner provides NO security isolation - use only in trusted environments"
        );
        Self {
            capture_limit,
            shutdown,
        }
    }
}

#[async_trait]
impl SandboxRunner for SimpleRunner {
    fn name(&self) -> &'static str {
        "simple"
    }

    async fn run(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        limits: &ResourceLimits,
    ) -> Result<RawRunResult, SandboxError> {
        let mut child = Command::new(SHELL)
            .arg("-c")
            .arg(profile.render_command())
            .current_dir(workspace.path())
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                program: SHELL.to_string(),
                source,
            })?;
        let mut group = ProcessGroup(child.id());

        let supervised = supervise(
            &mut child,
            limits.time_limit,
            self.capture_limit,
            &self.shutdown,
            || group.kill(),
        )
        .await?;
        group.kill();
        if !matches!(supervised, Supervised::Finished(_)) {
            let _ = child.kill().await;
        }

        match supervised {
            Supervised::Finished(captured) => Ok(RawRunResult {
                exit_code: Some(captured.exit_code),
                stdout: captured.stdout,
                stderr: captured.stderr,
                timed_out: false,
            }),
            Supervised::TimedOut => {
                log::debug!(
                    "Workspace {} exceeded {:?}, process group killed",
                    workspace.id(),
                    limits.time_limit
                );
                Ok(RawRunResult::timed_out())
            }
            Supervised::Cancelled => Err(SandboxError::Cancelled),
        }
    }

    async fn health_check(&self) -> Result<(), SandboxError> {
        if std::path::Path::new(SHELL).exists() {
            Ok(())
        } else {
            Err(SandboxError::Unavailable(format!("{SHELL} not found")))
        }
    }
}

/// The process group led by the spawned shell
///
/// Killing the group also takes down anything the program forked, including
/// background processes that outlive the shell.
struct ProcessGroup(Option<u32>);

impl ProcessGroup {
    fn kill(&mut self) {
        let Some(pgid) = self.0.take().and_then(|id| libc::pid_t::try_from(id).ok()) else {
            return;
        };
        // SAFETY: killpg takes no pointers; a stale group id yields ESRCH
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}
