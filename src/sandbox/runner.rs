use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SandboxError;
use crate::language::LanguageProfile;
use crate::workspace::Workspace;

use super::{RawRunResult, ResourceLimits};

/// Trait for different sandbox execution implementations
///
/// A runner takes a populated workspace and a language profile, runs the
/// profile's command against the workspace files, and reports what happened.
/// Runners stay language-agnostic: everything language specific comes from
/// the profile.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Short identifier for logs and health reports
    fn name(&self) -> &'static str;

    /// Runs one execution under the given limits.
    ///
    /// A non-zero exit of the user's program is an `Ok` result; `Err` is
    /// reserved for faults of the sandbox itself.
    async fn run(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        limits: &ResourceLimits,
    ) -> Result<RawRunResult, SandboxError>;

    /// Checks that the runner can currently launch sandboxes
    async fn health_check(&self) -> Result<(), SandboxError>;

    /// Warms up whatever the profiles need before the first request
    async fn prepare(&self, _profiles: &[Arc<LanguageProfile>]) -> Result<(), SandboxError> {
        Ok(())
    }
}
