// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CA store at {path} is corrupt: {reason}\nRemove both CA files to regenerate (previously trusted roots will stop working).")]
    CorruptStore { path: PathBuf, reason: String },

    #[error("Certificate generation failed: {0}")]
    CertGen(#[from] rcgen::Error),

    #[error("Failed to issue certificate for '{domain}': {reason}")]
    Issuance { domain: String, reason: String },

    #[error("No route configured for '{domain}'")]
    NoRoute { domain: String },

    #[error("Backend {backend} unavailable: {reason}")]
    Backend { backend: String, reason: String },

    #[error("{operation} requires elevated privileges.\n{hint}")]
    Privilege { operation: String, hint: String },

    #[error("Invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    #[error("Invalid port '{port}': must be a number between 1 and 65535")]
    InvalidPort { port: String },

    #[error("Invalid path (non-UTF8): {0}")]
    InvalidPath(PathBuf),

    #[error("Failed to bind to {addr}: {reason}\nIs another process using this port?")]
    BindFailed { addr: String, reason: String },

    #[error("Trust store operation failed: {0}")]
    TrustStore(String),

    #[error("Trust store operation timed out after {seconds} seconds.\nThe sudo prompt may have been ignored or the operation is hanging.\nTry running: sudo blast init")]
    TrustStoreTimeout { seconds: u64 },

    #[error("Sudo authentication failed or was cancelled.\nTrust store installation requires elevated privileges.\nRun: sudo blast init")]
    SudoFailed,

    #[error("Command '{command}' not found.\n{hint}")]
    CommandNotFound { command: String, hint: String },

    #[error("Command failed: {command}\n{stderr}")]
    Command { command: String, stderr: String },

    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse certificate: {0}")]
    CertParse(String),
}

impl Error {
    /// Map an I/O failure to a privilege error when the OS refused access.
    pub(crate) fn from_io(
        operation: &str,
        path: &std::path::Path,
        source: std::io::Error,
        write: bool,
    ) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return Error::Privilege {
                operation: format!("{} ({})", operation, path.display()),
                hint: privilege_hint().to_string(),
            };
        }
        if write {
            Error::WriteFile {
                path: path.to_path_buf(),
                source,
            }
        } else {
            Error::ReadFile {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Platform-specific advice for privilege failures.
pub fn privilege_hint() -> &'static str {
    if cfg!(windows) {
        "Please run as Administrator."
    } else {
        "Please run with sudo."
    }
}

pub type Result<T> = std::result::Result<T, Error>;
