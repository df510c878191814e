// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::fs::path_to_str;
use crate::trust::{has_elevated_privileges, run_checked, validate_cert_path, TrustStore};
use std::path::{Path, PathBuf};
use tracing::info;

const TRUST_STORE_CERT_NAME: &str = "blast-ca.crt";

pub struct LinuxTrustStore {
    distro: LinuxDistro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinuxDistro {
    Debian, // Ubuntu, Mint, Pop!_OS, etc.
    Fedora, // RHEL, CentOS, Rocky, Alma
    Arch,   // Manjaro, EndeavourOS
    Unknown,
}

impl LinuxDistro {
    fn anchors_dir(&self) -> Option<&'static Path> {
        match self {
            LinuxDistro::Debian => Some(Path::new("/usr/local/share/ca-certificates")),
            LinuxDistro::Fedora => Some(Path::new("/etc/pki/ca-trust/source/anchors")),
            LinuxDistro::Arch => Some(Path::new("/etc/ca-certificates/trust-source/anchors")),
            LinuxDistro::Unknown => None,
        }
    }

    fn cert_path(&self) -> Option<PathBuf> {
        self.anchors_dir().map(|dir| dir.join(TRUST_STORE_CERT_NAME))
    }

    fn update_command(&self) -> Option<&'static [&'static str]> {
        match self {
            LinuxDistro::Debian => Some(&["update-ca-certificates"]),
            LinuxDistro::Fedora => Some(&["update-ca-trust", "extract"]),
            LinuxDistro::Arch => Some(&["trust", "extract-compat"]),
            LinuxDistro::Unknown => None,
        }
    }

    fn from_os_release(content: &str) -> Self {
        let content = content.to_lowercase();
        let any = |names: &[&str]| names.iter().any(|n| content.contains(n));

        if any(&["debian", "ubuntu", "mint", "pop!_os"]) {
            LinuxDistro::Debian
        } else if any(&["fedora", "rhel", "centos", "rocky", "alma"]) {
            LinuxDistro::Fedora
        } else if any(&["arch", "manjaro", "endeavour"]) {
            LinuxDistro::Arch
        } else {
            LinuxDistro::Unknown
        }
    }
}

impl LinuxTrustStore {
    pub fn detect() -> Self {
        Self {
            distro: detect_distro(),
        }
    }
}

impl TrustStore for LinuxTrustStore {
    fn install(&self, cert_path: &Path) -> Result<()> {
        let source = validate_cert_path(cert_path)?;

        let (dest, update) = match (self.distro.cert_path(), self.distro.update_command()) {
            (Some(dest), Some(update)) => (dest, update),
            _ => {
                return Err(Error::TrustStore(format!(
                    "Unknown Linux distribution. Copy {} into your system's CA anchors directory manually.",
                    source.display()
                )))
            }
        };

        let source_str = path_to_str(&source)?;
        let dest_str = path_to_str(&dest)?;
        privileged(&["cp", source_str, dest_str])?;
        privileged(update)?;

        info!(path = %dest.display(), store = self.name(), "installed root certificate");
        Ok(())
    }

    fn name(&self) -> &'static str {
        match self.distro {
            LinuxDistro::Debian => "Debian/Ubuntu ca-certificates",
            LinuxDistro::Fedora => "Fedora/RHEL ca-trust",
            LinuxDistro::Arch => "Arch trust",
            LinuxDistro::Unknown => "Linux (unknown)",
        }
    }
}

/// Run directly when already root, through sudo otherwise.
fn privileged(args: &[&str]) -> Result<()> {
    let Some((cmd, rest)) = args.split_first() else {
        return Err(Error::TrustStore("No command provided".into()));
    };
    if has_elevated_privileges() {
        run_checked(cmd, rest)
    } else {
        run_checked("sudo", args)
    }
}

fn detect_distro() -> LinuxDistro {
    if let Ok(content) = std::fs::read_to_string("/etc/os-release") {
        let distro = LinuxDistro::from_os_release(&content);
        if distro != LinuxDistro::Unknown {
            return distro;
        }
    }

    // Fall back to whichever update tool is installed
    if Path::new("/usr/sbin/update-ca-certificates").exists() {
        return LinuxDistro::Debian;
    }
    if Path::new("/usr/bin/update-ca-trust").exists() {
        return LinuxDistro::Fedora;
    }
    if Path::new("/usr/bin/trust").exists() {
        return LinuxDistro::Arch;
    }

    LinuxDistro::Unknown
}
