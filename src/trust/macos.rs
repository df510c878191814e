// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::ca::CA_COMMON_NAME;
use crate::error::{Error, Result};
use crate::fs::path_to_str;
use crate::trust::{run_checked, validate_cert_path, TrustStore};
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

const SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

pub struct MacOsTrustStore;

impl TrustStore for MacOsTrustStore {
    fn install(&self, cert_path: &Path) -> Result<()> {
        let safe_cert_path = validate_cert_path(cert_path)?;
        let cert_path_str = path_to_str(&safe_cert_path)?;

        // Replace any root left over from an earlier install; absence is fine.
        match Command::new("security")
            .args(["delete-certificate", "-c", CA_COMMON_NAME, SYSTEM_KEYCHAIN])
            .output()
        {
            Ok(output) if output.status.success() => debug!("removed previous root from keychain"),
            _ => debug!("no previous root in keychain"),
        }

        run_checked(
            "security",
            &[
                "add-trusted-cert",
                "-d", // admin cert store
                "-r",
                "trustRoot",
                "-k",
                SYSTEM_KEYCHAIN,
                cert_path_str,
            ],
        )
        .map_err(|e| match e {
            Error::Command { stderr, .. } => Error::TrustStore(format!(
                "Failed to add certificate to the System keychain: {}",
                stderr
            )),
            other => other,
        })?;

        info!(keychain = SYSTEM_KEYCHAIN, "installed root certificate");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "macOS System Keychain"
    }
}
