// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn path_to_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))
}

/// Sibling temp path in the same directory, so the final rename stays on one filesystem.
fn temp_sibling(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?;
    let suffix: u64 = rand::Rng::random(&mut rand::rng());
    Ok(parent.join(format!(".tmp-{:x}", suffix)))
}

fn rename_into_place(temp_path: &Path, path: &Path) -> Result<()> {
    fs::rename(temp_path, path).map_err(|e| {
        if temp_path.exists() {
            let _ = fs::remove_file(temp_path);
        }
        Error::WriteFile {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

/// Write `contents` to a temp file and rename it over `path`.
/// Readers never observe a half-written file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = temp_sibling(path)?;

    let mut file = fs::File::create(&temp_path).map_err(|e| Error::WriteFile {
        path: temp_path.clone(),
        source: e,
    })?;
    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .map_err(|e| Error::WriteFile {
            path: temp_path.clone(),
            source: e,
        })?;
    drop(file);

    rename_into_place(&temp_path, path)
}

/// Same as [`atomic_write`], but the file is only readable by the current user.
pub fn atomic_write_secret(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = temp_sibling(path)?;
    write_secret_file(&temp_path, contents)?;
    rename_into_place(&temp_path, path)
}

#[cfg(unix)]
pub fn write_secret_file(path: &Path, contents: &[u8]) -> Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| Error::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })?;

    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .map_err(|e| Error::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })
}

#[cfg(windows)]
pub fn write_secret_file(path: &Path, contents: &[u8]) -> Result<()> {
    use std::process::Command;

    fs::write(path, contents).map_err(|e| Error::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let username = std::env::var("USERNAME")
        .map_err(|_| Error::Config("Cannot determine current user for file permissions".into()))?;

    let output = Command::new("icacls")
        .args([
            path_to_str(path)?,
            "/inheritance:r",
            "/grant:r",
            &format!("{}:F", username),
        ])
        .output()
        .map_err(|e| Error::Command {
            command: "icacls".into(),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        // Never leave a world-readable key behind.
        let _ = fs::remove_file(path);
        return Err(Error::Command {
            command: "icacls".into(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

#[cfg(not(any(unix, windows)))]
pub fn write_secret_file(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).map_err(|e| Error::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| Error::CreateDir {
        path: dir.to_path_buf(),
        source: e,
    })
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Remove {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("file.txt");

        atomic_write(&path, b"first").expect("first write should succeed");
        atomic_write(&path, b"second").expect("second write should succeed");

        assert_eq!(fs::read(&path).expect("file should be readable"), b"second");
        // No temp files left behind
        let entries = fs::read_dir(dir.path()).expect("dir should be readable").count();
        assert_eq!(entries, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_atomic_write_secret_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("secret.key");
        atomic_write_secret(&path, b"key").expect("secret write should succeed");

        let mode = fs::metadata(&path)
            .expect("metadata should be readable")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_remove_if_exists_missing_is_ok() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        assert!(remove_if_exists(&dir.path().join("missing")).is_ok());
    }
}
