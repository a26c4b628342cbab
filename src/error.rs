use std::path::PathBuf;

use thiserror::Error;

/// Request rejected before any workspace or container is touched
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unsupported language: {0}")]
    UnknownLanguage(String),

    #[error("{field} is {size} bytes, exceeding the limit of {limit} bytes")]
    PayloadTooLarge {
        field: &'static str,
        size: usize,
        limit: u64,
    },

    #[error("invalid {field}: {reason}")]
    InvalidLimit { field: &'static str, reason: String },
}

/// Problems found while building the language table
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("language entry #{index} has an empty name")]
    EmptyName { index: usize },

    #[error("language {name} is declared more than once")]
    Duplicate { name: String },

    #[error("language {name}: {reason}")]
    InvalidProfile { name: String, reason: &'static str },
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("program produced no output file")]
    OutputMissing,

    #[error("output file was replaced by something other than a regular file")]
    OutputNotRegular,

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove workspace {}: {source}", path.display())]
    Release {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Infrastructure faults raised by a sandbox runner. A non-zero exit of the
/// user's program is never one of these.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lost contact with sandboxed process: {0}")]
    Io(#[from] std::io::Error),

    #[error("container engine failed (exit code {code}): {message}")]
    Engine { code: i32, message: String },

    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    #[error("unreadable container state: {0}")]
    InvalidState(String),

    #[error("execution aborted by shutdown")]
    Cancelled,
}
