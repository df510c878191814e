// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Local HTTPS domains for development.
//!
//! A machine-wide root CA signs an in-memory leaf certificate for every
//! routed domain; a TLS listener picks the leaf by SNI and forwards each
//! request to `localhost:<port>`.
//!
//! ```rust,no_run
//! use blast::{full_domain, Paths, ProxyServer, RootAuthority, RouteTable};
//! use std::sync::Arc;
//!
//! # async fn demo() -> blast::Result<()> {
//! let paths = Paths::new()?;
//! let root = Arc::new(RootAuthority::ensure(&paths)?);
//! let routes = Arc::new(RouteTable::new(root));
//! routes.add_route(&full_domain("api"), "3000")?;
//!
//! let proxy = ProxyServer::new(Arc::clone(&routes), "0.0.0.0:443".parse().unwrap())
//!     .start()
//!     .await?;
//! // ...
//! proxy.stop().await;
//! # Ok(())
//! # }
//! ```

/// Root certificate authority.
pub mod ca;
/// Configuration handling.
pub mod config;
/// Background daemon.
pub mod daemon;
/// Error types.
pub mod error;
/// Filesystem utilities.
pub mod fs;
/// Hosts file editing.
pub mod hosts;
/// Leaf certificate issuance.
pub mod issuer;
/// HTTPS proxy server.
pub mod proxy;
/// Routing table.
pub mod routes;
/// System trust store management.
pub mod trust;
/// X.509 certificate parsing.
pub mod x509;

pub use ca::{RootAuthority, CA_COMMON_NAME, CA_ORG_NAME};
pub use config::{full_domain, Config, Paths, ProxyMapping, DOMAIN_SUFFIX};
pub use error::{Error, Result};
pub use hosts::{HostsFile, HOSTS_MARKER};
pub use issuer::{issue, LeafCredential};
pub use proxy::{Forwarder, ProxyHandle, ProxyServer, ResolveBackend, RouteResolver};
pub use routes::{normalize_domain, Backend, Route, RouteTable};
pub use trust::{get_trust_store, has_elevated_privileges, TrustStore};
pub use x509::{parse_cert_der, parse_cert_pem, CertInfo};
