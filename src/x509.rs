// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Parse X.509 certificates without shelling out to openssl.

use crate::error::{Error, Result};
use x509_parser::prelude::*;

/// The fields blast cares about when inspecting a root or leaf certificate.
#[derive(Debug, Clone)]
pub struct CertInfo {
    /// Serial number as lowercase hex of its DER encoding, no separators.
    pub serial_hex: String,
    /// Significant bits of the serial as an unsigned integer.
    pub serial_bits: u64,
    pub not_before_timestamp: i64,
    pub not_after_timestamp: i64,
    pub common_name: Option<String>,
    pub issuer_common_name: Option<String>,
    pub subject_alt_names: Vec<String>,
    pub self_signed: bool,
    pub is_ca: bool,
    pub path_len: Option<u32>,
    pub key_cert_sign: bool,
    pub crl_sign: bool,
    pub digital_signature: bool,
    pub key_encipherment: bool,
    pub server_auth: bool,
    /// Raw subject public key bits.
    pub public_key: Vec<u8>,
}

impl CertInfo {
    pub fn expiry_string(&self) -> String {
        match ::time::OffsetDateTime::from_unix_timestamp(self.not_after_timestamp) {
            Ok(dt) => format!("{}-{:02}-{:02}", dt.year(), dt.month() as u8, dt.day()),
            Err(_) => "Invalid date".to_string(),
        }
    }

    pub fn days_remaining(&self) -> i64 {
        let now = ::time::OffsetDateTime::now_utc();
        match ::time::OffsetDateTime::from_unix_timestamp(self.not_after_timestamp) {
            Ok(expiry) => (expiry - now).whole_days(),
            Err(_) => -1,
        }
    }

    /// Length of the validity window in whole days.
    pub fn validity_days(&self) -> i64 {
        (self.not_after_timestamp - self.not_before_timestamp) / 86_400
    }

    pub fn is_expired(&self) -> bool {
        self.days_remaining() < 0
    }
}

/// Decode the first PEM block of `pem_str`, which must be a certificate.
pub fn pem_to_der(pem_str: &str) -> Result<Vec<u8>> {
    let pem = ::pem::parse(pem_str)
        .map_err(|e| Error::CertParse(format!("Failed to parse PEM: {}", e)))?;

    if pem.tag() != "CERTIFICATE" {
        return Err(Error::CertParse(format!(
            "Expected CERTIFICATE, got {}",
            pem.tag()
        )));
    }
    Ok(pem.into_contents())
}

pub fn parse_cert_pem(pem_str: &str) -> Result<CertInfo> {
    parse_cert_der(&pem_to_der(pem_str)?)
}

pub fn parse_cert_der(der: &[u8]) -> Result<CertInfo> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::CertParse(format!("Invalid X.509: {}", e)))?;

    let first_cn = |name: &X509Name<'_>| {
        name.iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(String::from)
    };

    let mut info = CertInfo {
        serial_hex: cert
            .raw_serial()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect(),
        serial_bits: cert.tbs_certificate.serial.bits(),
        not_before_timestamp: cert.validity().not_before.timestamp(),
        not_after_timestamp: cert.validity().not_after.timestamp(),
        common_name: first_cn(cert.subject()),
        issuer_common_name: first_cn(cert.issuer()),
        subject_alt_names: Vec::new(),
        self_signed: cert.subject().as_raw() == cert.issuer().as_raw(),
        is_ca: false,
        path_len: None,
        key_cert_sign: false,
        crl_sign: false,
        digital_signature: false,
        key_encipherment: false,
        server_auth: false,
        public_key: cert.public_key().subject_public_key.data.to_vec(),
    };

    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::SubjectAlternativeName(san) => {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        info.subject_alt_names.push(dns.to_string());
                    }
                }
            }
            ParsedExtension::BasicConstraints(bc) => {
                info.is_ca = bc.ca;
                info.path_len = bc.path_len_constraint;
            }
            ParsedExtension::KeyUsage(ku) => {
                info.key_cert_sign = ku.key_cert_sign();
                info.crl_sign = ku.crl_sign();
                info.digital_signature = ku.digital_signature();
                info.key_encipherment = ku.key_encipherment();
            }
            ParsedExtension::ExtendedKeyUsage(eku) => {
                info.server_auth = eku.server_auth;
            }
            _ => {}
        }
    }

    Ok(info)
}

/// Check that `cert_der` carries a valid signature made by the key in `issuer_der`.
pub fn verify_issued_by(cert_der: &[u8], issuer_der: &[u8]) -> Result<bool> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| Error::CertParse(format!("Invalid X.509: {}", e)))?;
    let (_, issuer) = X509Certificate::from_der(issuer_der)
        .map_err(|e| Error::CertParse(format!("Invalid issuer X.509: {}", e)))?;

    if cert.issuer().as_raw() != issuer.subject().as_raw() {
        return Ok(false);
    }
    Ok(cert.verify_signature(Some(issuer.public_key())).is_ok())
}
