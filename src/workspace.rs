use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::anyhow;
use chrono::Local;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::error::WorkspaceError;
use crate::language::{INPUT_FILE, LanguageProfile, OUTPUT_FILE};

// Only the server may list the workspace root
const ROOT_DIR_PERMISSIONS: u32 = 0o700;
// The sandboxed user may differ from the server's
const WORKSPACE_PERMISSIONS: u32 = 0o777;
const WORKSPACE_PREFIX: &str = "ws-";

/// Hands out one private directory per execution
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let root = root.into();
        let create = |source| WorkspaceError::Create {
            path: root.clone(),
            source,
        };
        fs::create_dir_all(&root).map_err(create)?;
        fs::set_permissions(&root, fs::Permissions::from_mode(ROOT_DIR_PERMISSIONS))
            .map_err(create)?;

        Ok(Self { root })
    }

    /// Default location under the user's cache directory
    pub fn default_root() -> anyhow::Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "oj-runner")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;
        Ok(proj_dirs.cache_dir().join("workspaces"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a fresh workspace laid out for the given language.
    ///
    /// The directory name comes from a timestamp and a random token, never
    /// from the request. Either a complete workspace is returned or nothing
    /// is left on disk.
    pub async fn acquire(&self, profile: &LanguageProfile) -> Result<Workspace, WorkspaceError> {
        let id = format!(
            "{WORKSPACE_PREFIX}{}-{}",
            Local::now().format("%y%m%d-%H%M%S"),
            Uuid::new_v4().simple()
        );
        let path = self.root.join(&id);

        // `create_dir` fails on an existing path, so two workspaces can never share one
        tokio::fs::create_dir(&path)
            .await
            .map_err(|source| WorkspaceError::Create {
                path: path.clone(),
                source,
            })?;

        let permissions = fs::Permissions::from_mode(WORKSPACE_PERMISSIONS);
        if let Err(source) = tokio::fs::set_permissions(&path, permissions).await {
            let _ = tokio::fs::remove_dir(&path).await;
            return Err(WorkspaceError::Create { path, source });
        }

        log::debug!("Acquired workspace {id}");
        Ok(Workspace {
            source: path.join(profile.source_file_name()),
            input: path.join(INPUT_FILE),
            output: path.join(OUTPUT_FILE),
            id,
            path,
            released: false,
        })
    }

    /// Removes workspaces older than `max_age` left behind by a previous
    /// process. Returns how many were removed.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Unable to scan {}: {e}", self.root.display());
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            if !entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Failed to remove stale workspace {}: {e}", entry.path().display()),
            }
        }

        if removed > 0 {
            log::info!("Removed {removed} stale workspace(s) from {}", self.root.display());
        }
        removed
    }
}

/// One execution's directory, holding its source, input and output files.
///
/// Release it with [`Workspace::release`]; dropping an unreleased workspace
/// removes the directory as a fallback.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    path: PathBuf,
    source: PathBuf,
    input: PathBuf,
    output: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_path(&self) -> &Path {
        &self.source
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    pub async fn write_source(&self, content: &[u8]) -> Result<(), WorkspaceError> {
        write_file(&self.source, content).await
    }

    pub async fn write_input(&self, content: &[u8]) -> Result<(), WorkspaceError> {
        write_file(&self.input, content).await
    }

    /// Reads at most `limit` bytes of the output artifact.
    ///
    /// The sandboxed program owns the directory, so the artifact is opened
    /// without following symlinks or blocking on a FIFO, and must be a
    /// regular file.
    pub async fn read_output(&self, limit: usize) -> Result<Vec<u8>, WorkspaceError> {
        let read_error = |source| WorkspaceError::Read {
            path: self.output.clone(),
            source,
        };

        let opened = tokio::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
            .open(&self.output)
            .await;
        let file = match opened {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(WorkspaceError::OutputMissing),
            Err(e) if e.raw_os_error() == Some(libc::ELOOP) => {
                log::warn!("Output of workspace {} is a symlink", self.id);
                return Err(WorkspaceError::OutputNotRegular);
            }
            Err(e) => return Err(read_error(e)),
        };

        let metadata = file.metadata().await.map_err(read_error)?;
        if !metadata.is_file() {
            log::warn!("Output of workspace {} is not a regular file", self.id);
            return Err(WorkspaceError::OutputNotRegular);
        }

        let mut output = Vec::new();
        file.take(limit as u64)
            .read_to_end(&mut output)
            .await
            .map_err(read_error)?;

        if output.len() == limit {
            log::warn!("Output of workspace {} truncated to {limit} bytes", self.id);
        }
        Ok(output)
    }

    /// Recursively deletes the workspace
    pub async fn release(mut self) -> Result<(), WorkspaceError> {
        self.released = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                log::debug!("Released workspace {}", self.id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(WorkspaceError::Release {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => log::debug!("Workspace {} removed on drop", self.id),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove workspace {} on drop: {e}", self.id),
        }
    }
}

async fn write_file(path: &Path, content: &[u8]) -> Result<(), WorkspaceError> {
    tokio::fs::write(path, content)
        .await
        .map_err(|source| WorkspaceError::Write {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::language::LanguageRegistry;
    use pretty_assertions::assert_eq;

    fn python() -> std::sync::Arc<LanguageProfile> {
        LanguageRegistry::builtin().resolve("python").unwrap()
    }

    #[tokio::test]
    async fn test_acquire_creates_unique_directories() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path().join("ws")).unwrap();
        let profile = python();

        let mut ids = HashSet::new();
        let mut workspaces = Vec::new();
        for _ in 0..32 {
            let ws = manager.acquire(&profile).await.unwrap();
            assert!(ws.path().is_dir());
            assert!(ws.path().starts_with(manager.root()));
            assert!(ids.insert(ws.id().to_string()));
            workspaces.push(ws);
        }

        let mode = fs::metadata(workspaces[0].path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, WORKSPACE_PERMISSIONS);
        assert_eq!(workspaces[0].source_path().file_name().unwrap(), "Main.py");
    }

    #[tokio::test]
    async fn test_write_and_read_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path()).unwrap();
        let ws = manager.acquire(&python()).await.unwrap();

        ws.write_source(b"print(1)").await.unwrap();
        ws.write_input(b"").await.unwrap();
        assert_eq!(fs::read(ws.source_path()).unwrap(), b"print(1)");
        assert_eq!(fs::read(ws.input_path()).unwrap(), b"");

        assert!(matches!(
            ws.read_output(1024).await,
            Err(WorkspaceError::OutputMissing)
        ));

        fs::write(ws.output_path(), b"hello world").unwrap();
        assert_eq!(ws.read_output(1024).await.unwrap(), b"hello world");
        assert_eq!(ws.read_output(5).await.unwrap(), b"hello");

        ws.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_output_rejects_links_and_special_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path().join("ws")).unwrap();
        let secret = dir.path().join("secret");
        fs::write(&secret, b"HOST-SECRET").unwrap();

        let ws = manager.acquire(&python()).await.unwrap();
        std::os::unix::fs::symlink(&secret, ws.output_path()).unwrap();
        assert!(matches!(
            ws.read_output(1024).await,
            Err(WorkspaceError::OutputNotRegular)
        ));
        ws.release().await.unwrap();
        assert!(secret.exists());

        let ws = manager.acquire(&python()).await.unwrap();
        fs::create_dir(ws.output_path()).unwrap();
        assert!(matches!(
            ws.read_output(1024).await,
            Err(WorkspaceError::OutputNotRegular)
        ));
        ws.release().await.unwrap();

        let ws = manager.acquire(&python()).await.unwrap();
        let fifo = std::ffi::CString::new(ws.output_path().as_os_str().as_encoded_bytes()).unwrap();
        // SAFETY: `fifo` is a valid NUL-terminated path
        assert_eq!(unsafe { libc::mkfifo(fifo.as_ptr(), 0o666) }, 0);
        assert!(matches!(
            ws.read_output(1024).await,
            Err(WorkspaceError::OutputNotRegular)
        ));
        ws.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_and_drop_remove_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path()).unwrap();

        let ws = manager.acquire(&python()).await.unwrap();
        ws.write_source(b"x").await.unwrap();
        let path = ws.path().to_path_buf();
        ws.release().await.unwrap();
        assert!(!path.exists());

        let ws = manager.acquire(&python()).await.unwrap();
        fs::create_dir(ws.path().join("nested")).unwrap();
        fs::write(ws.path().join("nested/file"), b"x").unwrap();
        let path = ws.path().to_path_buf();
        drop(ws);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_acquire_fails_cleanly_without_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("gone");
        let manager = WorkspaceManager::new(&root).unwrap();
        fs::remove_dir(&root).unwrap();

        let err = manager.acquire(&python()).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Create { .. }));
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_sweep_stale_only_removes_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path()).unwrap();
        let ws = manager.acquire(&python()).await.unwrap();
        let leaked = ws.path().to_path_buf();
        std::mem::forget(ws);
        fs::write(dir.path().join("keep.txt"), b"x").unwrap();

        assert_eq!(manager.sweep_stale(Duration::from_secs(3600)), 0);
        assert!(leaked.exists());

        assert_eq!(manager.sweep_stale(Duration::ZERO), 1);
        assert!(!leaked.exists());
        assert!(dir.path().join("keep.txt").exists());
    }
}
