use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DockerConfig;
use crate::error::SandboxError;
use crate::language::LanguageProfile;
use crate::workspace::Workspace;

use super::{Captured, RawRunResult, ResourceLimits, SandboxRunner, Supervised, supervise};

/// Mount point of the workspace inside every container
pub const CONTAINER_WORKDIR: &str = "/sandbox";

const NOBODY: &str = "65534:65534";
const ENGINE_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const PULL_TIMEOUT: Duration = Duration::from_secs(600);

/// Runs each execution in a fresh, networkless container
///
/// The workspace is bind-mounted read-write at [`CONTAINER_WORKDIR`]; the rest
/// of the container filesystem is read-only apart from a small `/tmp`. Every
/// argument goes to the engine as a separate argv entry.
///
/// A run is `docker create` followed by `docker start --attach`, so engine
/// failures never mix with the exit code of the user's program. The exit code
/// and run time are then read from the container state and the container is
/// removed.
pub struct DockerRunner {
    binary: String,
    user: String,
    launch_overhead: Duration,
    tmpfs_size: u64,
    container_prefix: String,
    capture_limit: usize,
    shutdown: CancellationToken,
}

impl DockerRunner {
    pub fn new(config: &DockerConfig, capture_limit: usize, shutdown: CancellationToken) -> Self {
        let user = config.run_as_user.clone().unwrap_or_else(default_user);
        log::info!("DockerRunner will run sandboxes as user {user}");

        Self {
            binary: config.binary.clone(),
            user,
            launch_overhead: config.launch_overhead.as_duration(),
            tmpfs_size: config.tmpfs_size.0,
            container_prefix: config.container_prefix.clone(),
            capture_limit,
            shutdown,
        }
    }

    /// Builds the full `docker create` argument list
    pub fn build_create_args(
        &self,
        container_name: &str,
        workspace_path: &Path,
        profile: &LanguageProfile,
        limits: &ResourceLimits,
    ) -> Vec<String> {
        let mount = format!("{}:{CONTAINER_WORKDIR}:rw", workspace_path.display());
        let tmpfs = format!("/tmp:rw,nosuid,size={}", self.tmpfs_size);
        let memory = limits.memory_limit.to_string();
        let cpus = limits.cpus.to_string();
        let pids = limits.pids_limit.to_string();

        let fixed: &[&str] = &[
            "create",
            "--init",
            "--name",
            container_name,
            "--pull",
            "never",
            "--network",
            "none",
            "--memory",
            &memory,
            "--memory-swap",
            &memory,
            "--cpus",
            &cpus,
            "--pids-limit",
            &pids,
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
            "--read-only",
            "--tmpfs",
            &tmpfs,
            "--user",
            &self.user,
            "--volume",
            &mount,
            "--workdir",
            CONTAINER_WORKDIR,
        ];

        let mut args: Vec<String> = fixed.iter().map(|s| s.to_string()).collect();
        args.push(profile.image.clone());
        args.extend(["/bin/sh".to_string(), "-c".to_string(), profile.render_command()]);
        args
    }

    /// Force-removes a container, which kills every process inside it
    async fn remove_container(&self, name: &str) {
        let result = tokio::time::timeout(
            ENGINE_COMMAND_TIMEOUT,
            Command::new(&self.binary)
                .args(["rm", "--force", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await;

        match result {
            Ok(Ok(status)) if status.success() => log::debug!("Container {name} removed"),
            Ok(Ok(status)) => log::warn!("Removing container {name} exited with {status}"),
            Ok(Err(e)) => log::warn!("Failed to remove container {name}: {e}"),
            Err(_) => log::warn!("Timed out removing container {name}"),
        }
    }

    async fn inspect(&self, name: &str) -> Result<ContainerState, SandboxError> {
        let output = self
            .engine_output(
                &["inspect", "--format", "{{json .State}}", name],
                ENGINE_COMMAND_TIMEOUT,
            )
            .await?;
        if !output.status.success() {
            return Err(SandboxError::Engine {
                code: output.status.code().unwrap_or(-1),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| SandboxError::InvalidState(e.to_string()))
    }

    async fn engine_output<S: AsRef<str>>(
        &self,
        args: &[S],
        timeout: Duration,
    ) -> Result<std::process::Output, SandboxError> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, output).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(SandboxError::Spawn {
                program: self.binary.clone(),
                source,
            }),
            Err(_) => Err(SandboxError::Unavailable(format!(
                "`{} {}` did not finish within {}s",
                self.binary,
                args.first().copied().unwrap_or_default(),
                timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl SandboxRunner for DockerRunner {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        limits: &ResourceLimits,
    ) -> Result<RawRunResult, SandboxError> {
        let container_name = format!("{}-{}", self.container_prefix, Uuid::new_v4().simple());
        let args = self.build_create_args(&container_name, workspace.path(), profile, limits);
        let mut guard = ContainerGuard::new(&self.binary, &container_name);

        let created = self.engine_output(&args[..], ENGINE_COMMAND_TIMEOUT).await?;
        if !created.status.success() {
            guard.disarm();
            return Err(SandboxError::Engine {
                code: created.status.code().unwrap_or(-1),
                message: String::from_utf8_lossy(&created.stderr).trim().to_string(),
            });
        }

        let mut child = Command::new(&self.binary)
            .args(["start", "--attach", &container_name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                program: self.binary.clone(),
                source,
            })?;
        log::debug!(
            "Started container {container_name} ({}) for workspace {}",
            profile.image,
            workspace.id()
        );

        let deadline = limits.time_limit + self.launch_overhead;
        let supervised =
            supervise(&mut child, deadline, self.capture_limit, &self.shutdown, || {}).await?;

        match supervised {
            Supervised::Finished(captured) => {
                let state = self.inspect(&container_name).await;
                self.remove_container(&container_name).await;
                guard.disarm();
                judge_container(state?, captured, limits.time_limit)
            }
            Supervised::TimedOut => {
                log::debug!("Container {container_name} still running after {deadline:?}, removing");
                self.remove_container(&container_name).await;
                let _ = child.kill().await;
                guard.disarm();
                Ok(RawRunResult::timed_out())
            }
            Supervised::Cancelled => {
                self.remove_container(&container_name).await;
                let _ = child.kill().await;
                guard.disarm();
                Err(SandboxError::Cancelled)
            }
        }
    }

    async fn health_check(&self) -> Result<(), SandboxError> {
        let output = self
            .engine_output(
                &["version", "--format", "{{.Server.Version}}"],
                ENGINE_COMMAND_TIMEOUT,
            )
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Pulls every image that is not present locally; runs never pull
    async fn prepare(&self, profiles: &[Arc<LanguageProfile>]) -> Result<(), SandboxError> {
        let images: BTreeSet<&str> = profiles.iter().map(|p| p.image.as_str()).collect();
        let mut failed = Vec::new();
        let mut code = 0;

        for image in images {
            let present = self
                .engine_output(&["image", "inspect", image], ENGINE_COMMAND_TIMEOUT)
                .await?;
            if present.status.success() {
                log::debug!("Image {image} already present");
                continue;
            }

            log::info!("Pulling image {image}");
            let pulled = self.engine_output(&["pull", image], PULL_TIMEOUT).await?;
            if pulled.status.success() {
                log::info!("Pulled image {image}");
            } else {
                log::warn!(
                    "Failed to pull image {image}: {}",
                    String::from_utf8_lossy(&pulled.stderr).trim()
                );
                code = pulled.status.code().unwrap_or(-1);
                failed.push(image);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::Engine {
                code,
                message: format!("unable to pull {}", failed.join(", ")),
            })
        }
    }
}

/// The part of `docker inspect` output that decides a run
#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    exit_code: i32,
    #[serde(default)]
    error: String,
    #[serde(rename = "OOMKilled", default)]
    oom_killed: bool,
    started_at: String,
    finished_at: String,
}

impl ContainerState {
    /// Time between the container's own start and exit; `None` if it never
    /// started
    fn run_time(&self) -> Option<Duration> {
        let started = DateTime::parse_from_rfc3339(&self.started_at).ok()?;
        let finished = DateTime::parse_from_rfc3339(&self.finished_at).ok()?;
        // docker reports 0001-01-01T00:00:00Z for a container that never ran
        if started.timestamp() <= 0 {
            return None;
        }
        (finished - started).to_std().ok()
    }
}

/// Turns the state of an exited container into the runner's result
fn judge_container(
    state: ContainerState,
    captured: Captured,
    time_limit: Duration,
) -> Result<RawRunResult, SandboxError> {
    let run_time = match state.run_time() {
        Some(run_time) if state.error.is_empty() => run_time,
        _ => {
            let message = if state.error.is_empty() {
                String::from_utf8_lossy(&captured.stderr).trim().to_string()
            } else {
                state.error
            };
            return Err(SandboxError::Engine {
                code: captured.exit_code,
                message,
            });
        }
    };

    if run_time > time_limit {
        log::debug!("Container ran {run_time:?}, over the {time_limit:?} limit");
        return Ok(RawRunResult::timed_out());
    }
    if state.oom_killed {
        log::debug!("Container was killed for exceeding its memory limit");
    }

    Ok(RawRunResult {
        exit_code: Some(state.exit_code),
        stdout: captured.stdout,
        stderr: captured.stderr,
        timed_out: false,
    })
}

/// Removes the container if the run future is dropped before it finished
struct ContainerGuard {
    binary: String,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(binary: &str, name: &str) -> Self {
        Self {
            binary: binary.to_string(),
            name: name.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::warn!("Run abandoned, removing container {}", self.name);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut cmd = Command::new(&self.binary);
        cmd.args(["rm", "--force", &self.name])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        handle.spawn(async move {
            let _ = cmd.status().await;
        });
    }
}

/// The server's own identity, or `nobody` if the server runs as root
fn default_user() -> String {
    // SAFETY: getuid and getgid always succeed and touch no memory
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    if uid == 0 {
        NOBODY.to_string()
    } else {
        format!("{uid}:{gid}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::LanguageRegistry;
    use crate::workspace::WorkspaceManager;
    use pretty_assertions::assert_eq;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            time_limit: Duration::from_secs(2),
            memory_limit: 128 * 1024 * 1024,
            cpus: 0.5,
            pids_limit: 32,
        }
    }

    fn runner() -> DockerRunner {
        let config = DockerConfig {
            run_as_user: Some("1000:1000".to_string()),
            ..Default::default()
        };
        DockerRunner::new(&config, 4096, CancellationToken::new())
    }

    fn flag_value<'a>(args: &'a [String], flag: &str) -> &'a str {
        let idx = args.iter().position(|a| a == flag).unwrap();
        &args[idx + 1]
    }

    fn state(json: &str) -> ContainerState {
        serde_json::from_str(json).unwrap()
    }

    fn captured(exit_code: i32, stderr: &[u8]) -> Captured {
        Captured {
            exit_code,
            stdout: Vec::new(),
            stderr: stderr.to_vec(),
        }
    }

    #[test]
    fn test_create_args_apply_isolation_and_limits() {
        let profile = LanguageRegistry::builtin().resolve("python").unwrap();
        let args = runner().build_create_args(
            "oj-run-test",
            Path::new("/var/cache/ws-abc"),
            &profile,
            &limits(),
        );

        assert_eq!(args[0], "create");
        assert!(!args.contains(&"--rm".to_string()));
        assert!(args.contains(&"--init".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        assert_eq!(flag_value(&args, "--name"), "oj-run-test");
        assert_eq!(flag_value(&args, "--pull"), "never");
        assert_eq!(flag_value(&args, "--network"), "none");
        assert_eq!(flag_value(&args, "--memory"), "134217728");
        assert_eq!(flag_value(&args, "--memory-swap"), "134217728");
        assert_eq!(flag_value(&args, "--cpus"), "0.5");
        assert_eq!(flag_value(&args, "--pids-limit"), "32");
        assert_eq!(flag_value(&args, "--cap-drop"), "ALL");
        assert_eq!(flag_value(&args, "--user"), "1000:1000");
        assert_eq!(flag_value(&args, "--volume"), "/var/cache/ws-abc:/sandbox:rw");
        assert_eq!(flag_value(&args, "--workdir"), CONTAINER_WORKDIR);

        let tail = &args[args.len() - 4..];
        assert_eq!(
            tail,
            [
                "python:3.12-slim",
                "/bin/sh",
                "-c",
                "python3 Main.py < input.txt > output.txt"
            ]
        );
    }

    #[tokio::test]
    async fn test_shell_command_never_contains_workspace_path() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path()).unwrap();
        let registry = LanguageRegistry::builtin();

        for profile in registry.list() {
            let ws = manager.acquire(&profile).await.unwrap();
            let args = runner().build_create_args("oj-run-test", ws.path(), &profile, &limits());
            let shell_command = args.last().unwrap();
            assert!(!shell_command.contains(ws.id()));
            assert!(!shell_command.contains(&*dir.path().to_string_lossy()));
            ws.release().await.unwrap();
        }
    }

    #[test]
    fn test_container_state_run_time() {
        let finished = state(
            r#"{"Status":"exited","Running":false,"OOMKilled":false,"Pid":0,"ExitCode":0,
                "Error":"","StartedAt":"2025-03-01T10:00:00.250000000Z",
                "FinishedAt":"2025-03-01T10:00:01.750000000Z"}"#,
        );
        assert_eq!(finished.run_time(), Some(Duration::from_millis(1500)));

        let never_started = state(
            r#"{"ExitCode":127,"Error":"exec: \"/bin/sh\": not found",
                "StartedAt":"0001-01-01T00:00:00Z","FinishedAt":"0001-01-01T00:00:00Z"}"#,
        );
        assert_eq!(never_started.run_time(), None);
    }

    #[test]
    fn test_user_exit_125_is_not_an_engine_failure() {
        let exited = state(
            r#"{"ExitCode":125,"Error":"","StartedAt":"2025-03-01T10:00:00Z",
                "FinishedAt":"2025-03-01T10:00:00.100Z"}"#,
        );
        let result =
            judge_container(exited, captured(125, b"bye\n"), Duration::from_secs(1)).unwrap();
        assert_eq!(result.exit_code, Some(125));
        assert_eq!(result.stderr, b"bye\n");
        assert!(!result.timed_out);
    }

    #[test]
    fn test_run_over_limit_is_timed_out() {
        let slow = state(
            r#"{"ExitCode":0,"Error":"","StartedAt":"2025-03-01T10:00:00Z",
                "FinishedAt":"2025-03-01T10:00:02.500Z"}"#,
        );
        let result = judge_container(slow, captured(0, b""), Duration::from_secs(1)).unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);

        let in_time = state(
            r#"{"ExitCode":0,"Error":"","StartedAt":"2025-03-01T10:00:00Z",
                "FinishedAt":"2025-03-01T10:00:00.900Z"}"#,
        );
        let result = judge_container(in_time, captured(0, b""), Duration::from_secs(1)).unwrap();
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, Some(0));
    }

    #[test]
    fn test_container_that_never_started_is_engine_failure() {
        let broken = state(
            r#"{"ExitCode":128,"Error":"error mounting /sandbox: permission denied",
                "StartedAt":"0001-01-01T00:00:00Z","FinishedAt":"0001-01-01T00:00:00Z"}"#,
        );
        let err = judge_container(broken, captured(1, b"Error response"), Duration::from_secs(1))
            .unwrap_err();
        match err {
            SandboxError::Engine { message, .. } => assert!(message.contains("error mounting")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_default_user_is_never_root() {
        assert!(!default_user().starts_with("0:"));
    }

    fn docker_enabled() -> bool {
        std::env::var_os("OJ_DOCKER_TEST").is_some()
    }

    fn containers_named(prefix: &str) -> Vec<String> {
        let output = std::process::Command::new("docker")
            .args(["ps", "--all", "--quiet", "--filter"])
            .arg(format!("name={prefix}"))
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn isolated_runner() -> (DockerRunner, String) {
        let prefix = format!("oj-test-{}", Uuid::new_v4().simple());
        let config = DockerConfig {
            container_prefix: prefix.clone(),
            ..Default::default()
        };
        (DockerRunner::new(&config, 4096, CancellationToken::new()), prefix)
    }

    // Needs a reachable docker daemon; set OJ_DOCKER_TEST=1 to enable
    #[tokio::test]
    async fn test_docker_run_python() {
        if !docker_enabled() {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path()).unwrap();
        let profile = LanguageRegistry::builtin().resolve("python").unwrap();
        let (runner, prefix) = isolated_runner();
        runner.prepare(&[profile.clone()]).await.unwrap();

        let ws = manager.acquire(&profile).await.unwrap();
        ws.write_source(b"print(int(input()) * 2)").await.unwrap();
        ws.write_input(b"21\n").await.unwrap();

        let result = runner.run(&ws, &profile, &limits()).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.timed_out);
        assert_eq!(ws.read_output(1024).await.unwrap(), b"42\n");
        assert!(containers_named(&prefix).is_empty());
        ws.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_docker_timeout_removes_container() {
        if !docker_enabled() {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path()).unwrap();
        let profile = LanguageRegistry::builtin().resolve("python").unwrap();
        let (runner, prefix) = isolated_runner();
        runner.prepare(&[profile.clone()]).await.unwrap();

        let ws = manager.acquire(&profile).await.unwrap();
        ws.write_source(b"while True: pass").await.unwrap();
        ws.write_input(b"").await.unwrap();

        let limits = ResourceLimits {
            time_limit: Duration::from_secs(1),
            ..limits()
        };
        let result = runner.run(&ws, &profile, &limits).await.unwrap();
        assert!(result.timed_out);
        assert!(containers_named(&prefix).is_empty());
        ws.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_docker_abandoned_run_removes_container() {
        if !docker_enabled() {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path()).unwrap();
        let profile = LanguageRegistry::builtin().resolve("python").unwrap();
        let (runner, prefix) = isolated_runner();
        runner.prepare(&[profile.clone()]).await.unwrap();

        let ws = manager.acquire(&profile).await.unwrap();
        ws.write_source(b"import time\ntime.sleep(60)").await.unwrap();
        ws.write_input(b"").await.unwrap();

        let limits = ResourceLimits {
            time_limit: Duration::from_secs(20),
            ..limits()
        };
        let abandoned =
            tokio::time::timeout(Duration::from_secs(3), runner.run(&ws, &profile, &limits)).await;
        assert!(abandoned.is_err());

        let mut remaining = containers_named(&prefix);
        for _ in 0..50 {
            if remaining.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            remaining = containers_named(&prefix);
        }
        assert!(remaining.is_empty(), "containers left behind: {remaining:?}");
        ws.release().await.unwrap();
    }
}
