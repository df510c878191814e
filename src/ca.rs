// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! The machine-wide root authority.
//!
//! Generated once per machine, then loaded byte-for-byte on every start:
//! regenerating it would invalidate the trusted root and every issued leaf.

use crate::config::Paths;
use crate::error::{Error, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PublicKeyData, SerialNumber,
};
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, info};
use zeroize::Zeroizing;

pub const CA_COMMON_NAME: &str = "BlastProxy Root CA";
pub const CA_ORG_NAME: &str = "BlastProxy";
pub const CA_COUNTRY: &str = "US";

const CA_VALIDITY_YEARS: i32 = 10;
/// Intermediates allowed below the root.
const CA_MAX_PATH_LEN: u8 = 2;

/// Uniformly random 128-bit certificate serial.
pub(crate) fn random_serial() -> SerialNumber {
    let bytes: [u8; 16] = rand::random();
    SerialNumber::from_slice(&bytes)
}

/// `now` shifted by whole calendar years (Feb 29 falls back to Feb 28).
pub(crate) fn years_after(now: OffsetDateTime, years: i32) -> OffsetDateTime {
    let target = now.year() + years;
    now.replace_year(target).unwrap_or_else(|_| {
        (now - time::Duration::days(1))
            .replace_year(target)
            .unwrap_or(now + time::Duration::days(365 * years as i64))
    })
}

/// Self-signed root used to sign every leaf certificate.
pub struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    key_pem: Zeroizing<String>,
    cert_der: Vec<u8>,
    cert_path: PathBuf,
}

impl std::fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootAuthority")
            .field("cert_path", &self.cert_path)
            .finish_non_exhaustive()
    }
}

impl RootAuthority {
    /// Load the root from `paths`, generating and persisting it on first use.
    ///
    /// Both files present loads them; neither present generates a new root.
    /// A store holding only one of the two is reported as corrupt rather than
    /// silently overwritten.
    pub fn ensure(paths: &Paths) -> Result<Self> {
        let cert_present = file_present(&paths.ca_cert)?;
        let key_present = file_present(&paths.ca_key)?;

        match (cert_present, key_present) {
            (true, true) => Self::load(paths),
            (false, false) => {
                Self::generate(paths)?;
                Self::load(paths)
            }
            (true, false) => Err(Error::CorruptStore {
                path: paths.ca_key.clone(),
                reason: "certificate present but private key missing".into(),
            }),
            (false, true) => Err(Error::CorruptStore {
                path: paths.ca_cert.clone(),
                reason: "private key present but certificate missing".into(),
            }),
        }
    }

    /// Load an existing root. Fails if either file is missing or unreadable.
    pub fn load(paths: &Paths) -> Result<Self> {
        let cert_pem = fs::read_to_string(&paths.ca_cert).map_err(|e| Error::ReadFile {
            path: paths.ca_cert.clone(),
            source: e,
        })?;
        let key_pem = Zeroizing::new(fs::read_to_string(&paths.ca_key).map_err(|e| {
            Error::ReadFile {
                path: paths.ca_key.clone(),
                source: e,
            }
        })?);

        let corrupt = |path: &Path, reason: String| Error::CorruptStore {
            path: path.to_path_buf(),
            reason,
        };

        let cert_der = crate::x509::pem_to_der(&cert_pem)
            .map_err(|e| corrupt(&paths.ca_cert, e.to_string()))?;
        let info = crate::x509::parse_cert_der(&cert_der)
            .map_err(|e| corrupt(&paths.ca_cert, e.to_string()))?;
        if !info.is_ca || !info.self_signed {
            return Err(corrupt(
                &paths.ca_cert,
                "certificate is not a self-signed certificate authority".into(),
            ));
        }

        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| corrupt(&paths.ca_key, format!("unreadable private key: {}", e)))?;
        if key_pair.der_bytes() != info.public_key.as_slice() {
            return Err(corrupt(
                &paths.ca_key,
                "private key does not match the root certificate".into(),
            ));
        }

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| corrupt(&paths.ca_cert, format!("unusable as issuer: {}", e)))?;

        debug!(path = %paths.ca_cert.display(), serial = %info.serial_hex, "loaded root authority");

        Ok(Self {
            issuer,
            cert_pem,
            key_pem,
            cert_der,
            cert_path: paths.ca_cert.clone(),
        })
    }

    fn generate(paths: &Paths) -> Result<()> {
        paths.ensure_dir()?;

        let key_pair = KeyPair::generate()?;
        let cert = Self::create_ca_cert(&key_pair)?;

        // Key first: a crash in between leaves a key-only store, which is reported, never reused.
        crate::fs::atomic_write_secret(&paths.ca_key, key_pair.serialize_pem().as_bytes())?;
        crate::fs::atomic_write(&paths.ca_cert, cert.pem().as_bytes())?;

        info!(path = %paths.ca_cert.display(), "generated new root authority");
        Ok(())
    }

    fn create_ca_cert(key_pair: &KeyPair) -> Result<Certificate> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, CA_ORG_NAME);
        params.distinguished_name.push(DnType::CountryName, CA_COUNTRY);
        params.serial_number = Some(random_serial());
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(CA_MAX_PATH_LEN));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = years_after(now, CA_VALIDITY_YEARS);

        Ok(params.self_signed(key_pair)?)
    }

    /// Signing handle for leaf issuance, built once at load.
    pub fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    /// Where the exported root certificate lives (fed to the trust store).
    pub fn certificate_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }
}

fn file_present(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.is_file()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::ReadFile {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x509::parse_cert_pem;

    fn temp_paths() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let paths = Paths::with_base(dir.path().join("store"));
        (dir, paths)
    }

    #[test]
    fn test_ensure_generates_and_persists() {
        let (_dir, paths) = temp_paths();
        let root = RootAuthority::ensure(&paths).expect("root should be generated");

        assert!(paths.ca_cert.exists());
        assert!(paths.ca_key.exists());
        assert_eq!(root.certificate_path(), paths.ca_cert.as_path());
        assert!(root.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(root.key_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let (_dir, paths) = temp_paths();
        let first = RootAuthority::ensure(&paths).expect("root should be generated");
        let second = RootAuthority::ensure(&paths).expect("root should be loaded");
        let third = RootAuthority::ensure(&paths).expect("root should be loaded again");

        assert_eq!(first.cert_pem(), second.cert_pem());
        assert_eq!(first.key_pem(), second.key_pem());
        assert_eq!(second.cert_der(), third.cert_der());
        assert_eq!(
            fs::read_to_string(&paths.ca_cert).expect("cert should be readable"),
            third.cert_pem()
        );
    }

    #[test]
    fn test_root_certificate_profile() {
        let (_dir, paths) = temp_paths();
        let root = RootAuthority::ensure(&paths).expect("root should be generated");
        let info = parse_cert_pem(root.cert_pem()).expect("root should parse");

        assert!(info.self_signed);
        assert!(info.is_ca);
        assert_eq!(info.path_len, Some(2));
        assert!(info.key_cert_sign && info.crl_sign);
        assert_eq!(info.common_name.as_deref(), Some(CA_COMMON_NAME));
        assert!(info.serial_bits > 0 && info.serial_bits <= 128);
        // Ten calendar years, give or take leap days
        assert!((3650..=3653).contains(&info.validity_days()));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, paths) = temp_paths();
        RootAuthority::ensure(&paths).expect("root should be generated");
        let mode = fs::metadata(&paths.ca_key)
            .expect("key metadata should be readable")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_partial_store_is_corrupt() {
        let (_dir, paths) = temp_paths();
        RootAuthority::ensure(&paths).expect("root should be generated");
        let cert_before = fs::read(&paths.ca_cert).expect("cert should be readable");
        fs::remove_file(&paths.ca_key).expect("key should be removable");

        let err = RootAuthority::ensure(&paths).expect_err("partial store must not load");
        assert!(matches!(err, Error::CorruptStore { .. }));
        // The surviving half is left alone
        assert_eq!(fs::read(&paths.ca_cert).expect("cert should remain"), cert_before);
        assert!(!paths.ca_key.exists());
    }

    #[test]
    fn test_key_only_store_is_corrupt() {
        let (_dir, paths) = temp_paths();
        RootAuthority::ensure(&paths).expect("root should be generated");
        fs::remove_file(&paths.ca_cert).expect("cert should be removable");

        assert!(matches!(
            RootAuthority::ensure(&paths),
            Err(Error::CorruptStore { .. })
        ));
    }

    #[test]
    fn test_garbage_store_is_corrupt() {
        let (_dir, paths) = temp_paths();
        paths.ensure_dir().expect("dir should be created");
        fs::write(&paths.ca_cert, "garbage").expect("write should succeed");
        fs::write(&paths.ca_key, "garbage").expect("write should succeed");

        assert!(matches!(
            RootAuthority::ensure(&paths),
            Err(Error::CorruptStore { .. })
        ));
        // Never regenerated over the top
        assert_eq!(fs::read_to_string(&paths.ca_cert).expect("readable"), "garbage");
    }

    #[test]
    fn test_mismatched_key_is_corrupt() {
        let (_dir, paths) = temp_paths();
        let (_other_dir, other_paths) = temp_paths();
        RootAuthority::ensure(&paths).expect("root should be generated");
        RootAuthority::ensure(&other_paths).expect("other root should be generated");
        fs::copy(&other_paths.ca_key, &paths.ca_key).expect("copy should succeed");

        assert!(matches!(
            RootAuthority::ensure(&paths),
            Err(Error::CorruptStore { .. })
        ));
    }

    #[test]
    fn test_years_after_leap_day() {
        let leap = time::macros::datetime!(2024-02-29 12:00 UTC);
        let shifted = years_after(leap, 10);
        assert_eq!(shifted.year(), 2034);
        assert_eq!(shifted.month(), time::Month::February);
        assert_eq!(shifted.day(), 28);
    }

    #[test]
    fn test_issuance_uses_key_loaded_once() {
        let (_dir, paths) = temp_paths();
        let root = RootAuthority::ensure(&paths).expect("root should be generated");

        // Issuing never goes back to the store
        fs::remove_file(&paths.ca_key).expect("key should be removable");
        fs::remove_file(&paths.ca_cert).expect("cert should be removable");

        for domain in ["api.blast", "web.blast"] {
            let leaf = crate::issuer::issue(&root, domain).expect("leaf should be issued");
            assert!(crate::x509::verify_issued_by(leaf.chain()[0].as_ref(), root.cert_der())
                .expect("verification should run"));
        }
    }

    #[test]
    fn test_random_serials_differ() {
        assert_ne!(random_serial(), random_serial());
    }
}
