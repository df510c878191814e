// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Leaf certificate issuance.
//!
//! Leaves live only in memory: one per route, recreated on every add and
//! dropped with the route.

use crate::ca::{random_serial, years_after, RootAuthority};
use crate::error::{Error, Result};
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;
use zeroize::Zeroizing;

const LEAF_VALIDITY_YEARS: i32 = 1;

/// A serving credential for one domain: leaf + root chain and the leaf key.
pub struct LeafCredential {
    domain: String,
    cert_pem: String,
    key_pem: Zeroizing<String>,
    chain: Vec<CertificateDer<'static>>,
    certified_key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for LeafCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCredential")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl LeafCredential {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The leaf certificate alone.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Full chain as presented in the handshake: `[leaf, root]`.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Ready-to-serve rustls credential.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }
}

/// Issue a fresh server certificate for `domain`, signed by `root`.
///
/// Every failure comes back as [`Error::Issuance`] so callers can abort the
/// enclosing operation without partial state.
pub fn issue(root: &RootAuthority, domain: &str) -> Result<LeafCredential> {
    let fail = |reason: String| Error::Issuance {
        domain: domain.to_string(),
        reason,
    };

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::OrganizationName, crate::ca::CA_ORG_NAME);
    params.distinguished_name.push(DnType::CommonName, domain);
    params.subject_alt_names = vec![SanType::DnsName(
        domain
            .to_string()
            .try_into()
            .map_err(|_| fail("not a valid DNS name".into()))?,
    )];
    params.serial_number = Some(random_serial());
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = years_after(now, LEAF_VALIDITY_YEARS);

    let key_pair = KeyPair::generate().map_err(|e| fail(format!("key generation: {}", e)))?;
    let cert = params
        .signed_by(&key_pair, root.issuer())
        .map_err(|e| fail(format!("signing: {}", e)))?;

    let chain = vec![
        cert.der().clone(),
        CertificateDer::from(root.cert_der().to_vec()),
    ];
    let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&private_key)
        .map_err(|e| fail(format!("unusable serving key: {}", e)))?;

    debug!(domain, "issued leaf certificate");

    Ok(LeafCredential {
        domain: domain.to_string(),
        cert_pem: cert.pem(),
        key_pem: Zeroizing::new(key_pair.serialize_pem()),
        certified_key: Arc::new(CertifiedKey::new(chain.clone(), signing_key)),
        chain,
    })
}
