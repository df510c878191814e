// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Hosts file entries for proxied domains.
//!
//! Only lines carrying [`HOSTS_MARKER`] are ever touched. Both operations are
//! idempotent.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Trailing tag on every line this tool owns.
pub const HOSTS_MARKER: &str = "# blast-proxy";

const LOOPBACK: &str = "127.0.0.1";

#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    /// The operating system's hosts file.
    pub fn system() -> Self {
        let path = if cfg!(windows) {
            PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
        } else {
            PathBuf::from("/etc/hosts")
        };
        Self { path }
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Map `domain` to the loopback address.
    pub fn add_entry(&self, domain: &str) -> Result<()> {
        let mut content = self.read()?;
        if content.lines().any(|line| owned_entry_for(line, domain)) {
            debug!(domain, "hosts entry already present");
            return Ok(());
        }

        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format!("{} {} {}\n", LOOPBACK, domain, HOSTS_MARKER));
        self.write(&content)?;

        info!(domain, path = %self.path.display(), "added hosts entry");
        Ok(())
    }

    /// Drop the entry for `domain`. Missing entries are not an error.
    pub fn remove_entry(&self, domain: &str) -> Result<()> {
        let content = self.read()?;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| !owned_entry_for(line, domain))
            .collect();

        if kept.len() == content.lines().count() {
            debug!(domain, "no hosts entry to remove");
            return Ok(());
        }

        let mut updated = kept.join("\n");
        if !updated.is_empty() {
            updated.push('\n');
        }
        self.write(&updated)?;

        info!(domain, path = %self.path.display(), "removed hosts entry");
        Ok(())
    }

    /// Domains on lines owned by this tool, in file order.
    pub fn entries(&self) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .lines()
            .filter(|line| line.trim_end().ends_with(HOSTS_MARKER))
            .filter_map(|line| line.split_whitespace().nth(1).map(String::from))
            .collect())
    }

    fn read(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(Error::from_io("Reading the hosts file", &self.path, e, false)),
        }
    }

    // Written in place: the hosts file is often a bind mount that cannot be replaced by rename.
    fn write(&self, content: &str) -> Result<()> {
        std::fs::write(&self.path, content)
            .map_err(|e| Error::from_io("Editing the hosts file", &self.path, e, true))
    }
}

/// A marked line whose host names include `domain` exactly.
fn owned_entry_for(line: &str, domain: &str) -> bool {
    let Some((entry, tag)) = line.split_once('#') else {
        return false;
    };
    if format!("#{}", tag).trim_end() != HOSTS_MARKER {
        return false;
    }
    entry
        .split_whitespace()
        .skip(1)
        .any(|name| name.eq_ignore_ascii_case(domain))
}
