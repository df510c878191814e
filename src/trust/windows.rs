// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::fs::path_to_str;
use crate::trust::{run_checked, validate_cert_path, TrustStore};
use std::path::Path;
use tracing::info;

pub struct WindowsTrustStore;

impl TrustStore for WindowsTrustStore {
    fn install(&self, cert_path: &Path) -> Result<()> {
        let safe_cert_path = validate_cert_path(cert_path)?;
        let cert_path_str = path_to_str(&safe_cert_path)?;

        // Trusted Root Certification Authorities
        run_checked("certutil", &["-addstore", "-f", "ROOT", cert_path_str]).map_err(|e| match e {
            Error::Command { stderr, .. } => Error::TrustStore(format!(
                "Failed to add certificate to Windows trust store: {}",
                stderr
            )),
            other => other,
        })?;

        info!("installed root certificate into the ROOT store");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Windows Certificate Store"
    }
}
