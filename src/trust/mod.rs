// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Installing the root certificate into the operating system's trust store.
//!
//! One implementation per platform, chosen at build time by
//! [`get_trust_store`]. Callers only ever see the [`TrustStore`] trait.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(windows)]
mod windows;

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound for any trust store command, including a sudo prompt.
const COMMAND_TIMEOUT_SECS: u64 = 30;

pub trait TrustStore {
    /// Trust the certificate at `cert_path` as a root authority.
    fn install(&self, cert_path: &Path) -> Result<()>;

    fn has_elevated_privileges(&self) -> bool {
        has_elevated_privileges()
    }

    fn name(&self) -> &'static str;
}

/// Whether this process runs as root (unix) or Administrator (windows).
pub fn has_elevated_privileges() -> bool {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    #[cfg(windows)]
    {
        // `net session` is refused to non-admin tokens.
        Command::new("net")
            .arg("session")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

/// Validate a path for use in trust store commands.
/// Rejects anything a shell or option parser could misread.
pub fn validate_cert_path(path: &Path) -> Result<PathBuf> {
    if !path.is_file() {
        return Err(Error::TrustStore(format!(
            "Certificate not found or not a regular file: {}",
            path.display()
        )));
    }

    let canonical = path.canonicalize().map_err(|e| Error::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let path_str = canonical
        .to_str()
        .ok_or_else(|| Error::InvalidPath(canonical.clone()))?;

    const DANGEROUS_CHARS: &[char] = &[
        ';', '&', '|', '$', '`', '(', ')', '{', '}', '[', ']', '<', '>', '!', '*', '?', '\n', '\r',
        '\0',
    ];
    if let Some(c) = path_str.chars().find(|c| DANGEROUS_CHARS.contains(c)) {
        return Err(Error::TrustStore(format!(
            "Path contains dangerous character '{}': {}",
            c,
            path.display()
        )));
    }
    if path_str.starts_with('-') {
        return Err(Error::TrustStore(format!(
            "Path cannot start with dash: {}",
            path.display()
        )));
    }

    Ok(canonical)
}

/// The trust store for the platform this binary was built for.
pub fn get_trust_store() -> Box<dyn TrustStore> {
    #[cfg(target_os = "macos")]
    {
        Box::new(macos::MacOsTrustStore)
    }

    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxTrustStore::detect())
    }

    #[cfg(windows)]
    {
        Box::new(windows::WindowsTrustStore)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
    {
        Box::new(NullTrustStore)
    }
}

/// Fallback for platforms without automated trust installation.
pub struct NullTrustStore;

impl TrustStore for NullTrustStore {
    fn install(&self, cert_path: &Path) -> Result<()> {
        warn!(
            path = %cert_path.display(),
            "automatic trust installation is not supported on this platform; add the certificate manually"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Unsupported"
    }
}

/// Run a command, killing it if it outlives `timeout_secs`.
pub(crate) fn run_command_with_timeout(
    command: &str,
    args: &[&str],
    timeout_secs: u64,
) -> Result<std::process::Output> {
    debug!(command, ?args, "running trust store command");

    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::inherit()) // sudo may prompt
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CommandNotFound {
                    command: command.to_string(),
                    hint: install_hint(command),
                }
            } else {
                Error::Command {
                    command: command.to_string(),
                    stderr: e.to_string(),
                }
            }
        })?;

    let timeout = Duration::from_secs(timeout_secs);
    let start = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(_)) => {
                return child.wait_with_output().map_err(|e| Error::Command {
                    command: command.to_string(),
                    stderr: e.to_string(),
                });
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::TrustStoreTimeout {
                        seconds: timeout_secs,
                    });
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(Error::Command {
                    command: command.to_string(),
                    stderr: e.to_string(),
                });
            }
        }
    }
}

/// Run a command and turn a non-zero exit into [`Error::Command`].
pub(crate) fn run_checked(command: &str, args: &[&str]) -> Result<()> {
    let output = run_command_with_timeout(command, args, COMMAND_TIMEOUT_SECS)?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if command == "sudo" && is_sudo_auth_failure(&stderr) {
        return Err(Error::SudoFailed);
    }
    Err(Error::Command {
        command: std::iter::once(command)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" "),
        stderr,
    })
}

fn install_hint(command: &str) -> String {
    match command {
        "sudo" => "Sudo is required for trust store operations. Install sudo or run as root."
            .to_string(),
        "update-ca-certificates" => {
            "Install the ca-certificates package: sudo apt install ca-certificates".to_string()
        }
        "update-ca-trust" => {
            "Install the ca-certificates package: sudo dnf install ca-certificates".to_string()
        }
        "trust" => "Install the p11-kit package: sudo pacman -S p11-kit".to_string(),
        _ => format!("Please install the '{}' command", command),
    }
}

fn is_sudo_auth_failure(stderr: &str) -> bool {
    stderr.contains("sudo: no password was provided")
        || stderr.contains("sudo: a password is required")
        || stderr.contains("Sorry, try again")
        || stderr.contains("incorrect password attempts")
        || stderr.contains("Authentication failure")
}
