use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::{ByteSize, Config, LimitsConfig, MaxLimitsConfig, MicroSecond};
use crate::error::{SandboxError, ValidationError, WorkspaceError};
use crate::language::{LanguageProfile, LanguageRegistry};
use crate::sandbox::{RawRunResult, ResourceLimits, SandboxRunner};
use crate::workspace::{Workspace, WorkspaceManager};

// docker refuses smaller memory ceilings
const MIN_MEMORY_LIMIT: ByteSize = ByteSize::mib(6);
const TRUNCATION_MARKER: &str = "\n... (truncated)";
// 128 + SIGKILL
const KILLED_EXIT_CODE: i32 = 137;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecutionRequest {
    pub source_code: String,
    pub language: String,
    #[serde(default)]
    pub stdin: String,
    pub time_limit: Option<MicroSecond>,
    pub memory_limit: Option<ByteSize>,
}

impl ExecutionRequest {
    pub fn new(language: &str, source_code: &str, stdin: &str) -> Self {
        Self {
            source_code: source_code.to_string(),
            language: language.to_string(),
            stdin: stdin.to_string(),
            time_limit: None,
            memory_limit: None,
        }
    }
}

/// The closed set of results an execution can produce
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success {
        output: String,
    },
    CompileOrRuntimeError {
        diagnostics: String,
        exit_code: Option<i32>,
    },
    Timeout,
    /// The sandbox could not judge the code; safe to retry
    InternalError {
        diagnostics: String,
    },
}

impl Outcome {
    fn internal(diagnostics: impl Into<String>) -> Self {
        Self::InternalError {
            diagnostics: diagnostics.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::CompileOrRuntimeError { .. } => "compile_or_runtime_error",
            Self::Timeout => "timeout",
            Self::InternalError { .. } => "internal_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    /// Id of the workspace the code ran in; `None` if none was created
    pub execution_id: Option<String>,
    pub elapsed: Duration,
}

/// Settings of the executor, taken from the configuration file
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub limits: LimitsConfig,
    pub max_limits: MaxLimitsConfig,
    pub max_concurrent_executions: usize,
    pub admission_timeout: Duration,
    pub max_source_size: ByteSize,
    pub max_input_size: ByteSize,
    pub max_output_size: ByteSize,
    pub max_diagnostics_size: ByteSize,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        let execution = &config.execution;
        Self {
            limits: config.limits.clone(),
            max_limits: config.max_limits.clone(),
            max_concurrent_executions: execution.max_concurrent_executions,
            admission_timeout: execution.admission_timeout.as_duration(),
            max_source_size: execution.max_source_size,
            max_input_size: execution.max_input_size,
            max_output_size: execution.max_output_size,
            max_diagnostics_size: execution.max_diagnostics_size,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Entry point for running untrusted code
///
/// Every call gets its own workspace, created and destroyed here and nowhere
/// else, and at most `max_concurrent_executions` calls run a sandbox at once.
pub struct Executor {
    registry: Arc<LanguageRegistry>,
    workspaces: WorkspaceManager,
    runner: Box<dyn SandboxRunner>,
    permits: Semaphore,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        workspaces: WorkspaceManager,
        runner: Box<dyn SandboxRunner>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            registry,
            workspaces,
            runner,
            permits: Semaphore::new(settings.max_concurrent_executions),
            settings,
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &dyn SandboxRunner {
        self.runner.as_ref()
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Runs one request to completion.
    ///
    /// `Err` means the request itself is unacceptable and nothing was run.
    /// Everything that happens after validation, including faults of the
    /// sandbox, is reported as an [`Outcome`].
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ValidationError> {
        let (profile, limits) = self.validate(request)?;
        let started = Instant::now();

        let Some(_permit) = self.admit().await else {
            log::warn!(
                "No execution slot freed within {:?}, rejecting {} request",
                self.settings.admission_timeout,
                profile.name
            );
            return Ok(ExecutionResult {
                outcome: Outcome::internal("execution capacity exhausted, try again later"),
                execution_id: None,
                elapsed: started.elapsed(),
            });
        };

        let workspace = match self.workspaces.acquire(&profile).await {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Failed to acquire workspace: {e}");
                return Ok(ExecutionResult {
                    outcome: Outcome::internal(format!("failed to prepare execution: {e}")),
                    execution_id: None,
                    elapsed: started.elapsed(),
                });
            }
        };
        let execution_id = workspace.id().to_string();
        log::debug!("Executing {} code in workspace {execution_id}", profile.name);

        let mut outcome = self
            .run_in_workspace(&workspace, &profile, &limits, request)
            .await;

        if let Err(e) = workspace.release().await {
            log::error!("Failed to release workspace {execution_id}: {e}");
            outcome = Outcome::internal(format!("failed to clean up execution: {e}"));
        }

        let elapsed = started.elapsed();
        log::info!(
            "Execution {execution_id} ({}) finished: {} in {} ms",
            profile.name,
            outcome.kind(),
            elapsed.as_millis()
        );
        Ok(ExecutionResult {
            outcome,
            execution_id: Some(execution_id),
            elapsed,
        })
    }

    /// Resolves the language and the effective limits of a request
    pub fn validate(
        &self,
        request: &ExecutionRequest,
    ) -> Result<(Arc<LanguageProfile>, ResourceLimits), ValidationError> {
        let profile = self.registry.resolve(&request.language)?;
        check_size("source_code", request.source_code.len(), self.settings.max_source_size)?;
        check_size("stdin", request.stdin.len(), self.settings.max_input_size)?;

        let defaults = &self.settings.limits;
        let max = &self.settings.max_limits;

        let time_limit = match request.time_limit {
            None => defaults.time_limit,
            Some(MicroSecond(0)) => {
                return Err(ValidationError::InvalidLimit {
                    field: "time_limit",
                    reason: "must be positive".to_string(),
                });
            }
            Some(t) if t > max.time_limit => {
                return Err(ValidationError::InvalidLimit {
                    field: "time_limit",
                    reason: format!("must not exceed {} microseconds", max.time_limit.0),
                });
            }
            Some(t) => t,
        };

        let memory_limit = match request.memory_limit {
            None => defaults.memory_limit,
            Some(m) if m < MIN_MEMORY_LIMIT => {
                return Err(ValidationError::InvalidLimit {
                    field: "memory_limit",
                    reason: format!("must be at least {} bytes", MIN_MEMORY_LIMIT.0),
                });
            }
            Some(m) if m > max.memory_limit => {
                return Err(ValidationError::InvalidLimit {
                    field: "memory_limit",
                    reason: format!("must not exceed {} bytes", max.memory_limit.0),
                });
            }
            Some(m) => m,
        };

        Ok((
            profile,
            ResourceLimits {
                time_limit: time_limit.as_duration(),
                memory_limit: memory_limit.0,
                cpus: defaults.cpus,
                pids_limit: defaults.pids_limit,
            },
        ))
    }

    async fn admit(&self) -> Option<SemaphorePermit<'_>> {
        tokio::time::timeout(self.settings.admission_timeout, self.permits.acquire())
            .await
            .ok()?
            .ok()
    }

    async fn run_in_workspace(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        limits: &ResourceLimits,
        request: &ExecutionRequest,
    ) -> Outcome {
        let written = async {
            workspace.write_source(request.source_code.as_bytes()).await?;
            workspace.write_input(request.stdin.as_bytes()).await
        };
        if let Err(e) = written.await {
            log::error!("Failed to populate workspace {}: {e}", workspace.id());
            return Outcome::internal(format!("failed to prepare execution: {e}"));
        }

        match self.runner.run(workspace, profile, limits).await {
            Ok(raw) => self.interpret(workspace, raw).await,
            Err(SandboxError::Cancelled) => {
                log::warn!("Execution {} aborted by shutdown", workspace.id());
                Outcome::internal(SandboxError::Cancelled.to_string())
            }
            Err(e) => {
                log::error!("Sandbox failure in workspace {}: {e}", workspace.id());
                Outcome::internal(e.to_string())
            }
        }
    }

    async fn interpret(&self, workspace: &Workspace, raw: RawRunResult) -> Outcome {
        if raw.timed_out {
            return Outcome::Timeout;
        }

        if raw.exit_code != Some(0) || !raw.stderr.is_empty() {
            return Outcome::CompileOrRuntimeError {
                diagnostics: self.truncate(describe_failure(&raw)),
                exit_code: raw.exit_code,
            };
        }

        match workspace
            .read_output(self.settings.max_output_size.as_usize())
            .await
        {
            Ok(output) => Outcome::Success {
                output: String::from_utf8_lossy(&output).trim().to_string(),
            },
            Err(WorkspaceError::OutputMissing) => {
                Outcome::internal("program exited cleanly but produced no output file")
            }
            Err(e @ WorkspaceError::OutputNotRegular) => Outcome::CompileOrRuntimeError {
                diagnostics: e.to_string(),
                exit_code: raw.exit_code,
            },
            Err(e) => {
                log::error!("Failed to collect output of {}: {e}", workspace.id());
                Outcome::internal(e.to_string())
            }
        }
    }

    fn truncate(&self, text: String) -> String {
        truncate_utf8(text, self.settings.max_diagnostics_size.as_usize())
    }
}

fn check_size(field: &'static str, size: usize, limit: ByteSize) -> Result<(), ValidationError> {
    if size as u64 > limit.0 {
        return Err(ValidationError::PayloadTooLarge {
            field,
            size,
            limit: limit.0,
        });
    }
    Ok(())
}

/// Picks the most useful text describing a failed run
fn describe_failure(raw: &RawRunResult) -> String {
    let stream = if raw.stderr.is_empty() {
        &raw.stdout
    } else {
        &raw.stderr
    };
    let text = String::from_utf8_lossy(stream).trim_end().to_string();
    if !text.is_empty() {
        return text;
    }

    match raw.exit_code {
        Some(KILLED_EXIT_CODE) => format!(
            "process exited with code {KILLED_EXIT_CODE} (killed, possibly for exceeding the memory limit)"
        ),
        Some(code) => format!("process exited with code {code}"),
        None => "process terminated abnormally".to_string(),
    }
}

/// Cuts `text` to at most `limit` bytes on a char boundary, marking the cut
fn truncate_utf8(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    // no room for the marker
    let marker = if limit < TRUNCATION_MARKER.len() {
        ""
    } else {
        TRUNCATION_MARKER
    };
    let mut end = limit - marker.len();
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str(marker);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn executor(root: &std::path::Path) -> Executor {
        let runner = crate::sandbox::SimpleRunner::new(1024, Default::default());
        Executor::new(
            Arc::new(LanguageRegistry::builtin()),
            WorkspaceManager::new(root).unwrap(),
            Box::new(runner),
            ExecutorSettings::default(),
        )
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_utf8("short".to_string(), 100), "short");

        let long = "é".repeat(100);
        let cut = truncate_utf8(long, 40);
        assert!(cut.len() <= 40);
        assert!(cut.ends_with(TRUNCATION_MARKER));
        assert!(cut.starts_with("éé"));
    }

    #[test]
    fn test_truncate_below_marker_length_stays_within_limit() {
        let cut = truncate_utf8("é".repeat(100), 5);
        assert_eq!(cut, "éé");

        assert_eq!(truncate_utf8("abcdef".to_string(), 0), "");
        assert_eq!(truncate_utf8("a".repeat(100), 16), TRUNCATION_MARKER);
    }

    #[test]
    fn test_describe_failure_prefers_stderr() {
        let raw = RawRunResult {
            exit_code: Some(1),
            stdout: b"partial".to_vec(),
            stderr: b"Traceback\n".to_vec(),
            timed_out: false,
        };
        assert_eq!(describe_failure(&raw), "Traceback");

        let raw = RawRunResult {
            exit_code: Some(1),
            stdout: b"error: expected ';'\n".to_vec(),
            ..Default::default()
        };
        assert_eq!(describe_failure(&raw), "error: expected ';'");

        let raw = RawRunResult {
            exit_code: Some(KILLED_EXIT_CODE),
            ..Default::default()
        };
        assert!(describe_failure(&raw).contains("memory limit"));
    }

    #[test]
    fn test_validate_applies_defaults_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());

        let mut request = ExecutionRequest::new("python", "print(1)", "");
        let (profile, limits) = executor.validate(&request).unwrap();
        assert_eq!(profile.name, "python");
        assert_eq!(limits.time_limit, Duration::from_secs(10));
        assert_eq!(limits.memory_limit, ByteSize::mib(256).0);

        request.time_limit = Some(MicroSecond(500_000));
        request.memory_limit = Some(ByteSize::mib(64));
        let (_, limits) = executor.validate(&request).unwrap();
        assert_eq!(limits.time_limit, Duration::from_millis(500));
        assert_eq!(limits.memory_limit, ByteSize::mib(64).0);
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());

        let unknown = ExecutionRequest::new("brainfuck", "+", "");
        assert!(matches!(
            executor.validate(&unknown),
            Err(ValidationError::UnknownLanguage(_))
        ));

        let oversized = ExecutionRequest::new("python", &"#".repeat(65537), "");
        assert!(matches!(
            executor.validate(&oversized),
            Err(ValidationError::PayloadTooLarge { field: "source_code", .. })
        ));

        let mut too_long = ExecutionRequest::new("python", "print(1)", "");
        too_long.time_limit = Some(MicroSecond::from_secs(3600));
        assert!(matches!(
            executor.validate(&too_long),
            Err(ValidationError::InvalidLimit { field: "time_limit", .. })
        ));

        let mut too_small = ExecutionRequest::new("python", "print(1)", "");
        too_small.memory_limit = Some(ByteSize::kib(1));
        assert!(matches!(
            executor.validate(&too_small),
            Err(ValidationError::InvalidLimit { field: "memory_limit", .. })
        ));
    }
}
