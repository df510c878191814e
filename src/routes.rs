// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! The routing table shared by certificate selection and request forwarding.
//!
//! Entries move straight from absent to active and back. Leaf issuance runs
//! before the write lock is taken, so readers only ever see complete routes.

use crate::ca::RootAuthority;
use crate::error::{Error, Result};
use crate::issuer::{self, LeafCredential};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

const MAX_DOMAIN_LEN: usize = 253;

/// Lowercase and validate a DNS name used as a routing key.
pub fn normalize_domain(domain: &str) -> Result<String> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let invalid = |reason: &str| Error::InvalidDomain {
        domain: domain.clone(),
        reason: reason.to_string(),
    };

    if domain.is_empty() {
        return Err(invalid("cannot be empty"));
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid("longer than 253 characters"));
    }
    if domain.starts_with('.') || domain.contains("..") {
        return Err(invalid("empty label"));
    }
    if let Some(c) = domain
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '.' || *c == '-'))
    {
        return Err(invalid(&format!("character '{}' not allowed", c)));
    }
    if domain
        .split('.')
        .any(|label| label.len() > 63 || label.starts_with('-') || label.ends_with('-'))
    {
        return Err(invalid("labels must be 1-63 characters and not start or end with '-'"));
    }

    Ok(domain)
}

/// Routing key for an HTTP `Host` value: port stripped, case folded.
pub fn host_key(host: &str) -> String {
    let host = host.trim();
    let name = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// A local backend, always reached at `localhost:<port>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backend {
    port: u16,
}

impl Backend {
    pub fn parse(port: &str) -> Result<Self> {
        match port.trim().parse::<u16>() {
            Ok(p) if p != 0 => Ok(Self { port: p }),
            _ => Err(Error::InvalidPort {
                port: port.to_string(),
            }),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `localhost:<port>`, the authority used on the outbound request.
    pub fn authority(&self) -> String {
        format!("localhost:{}", self.port)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "localhost:{}", self.port)
    }
}

/// One active mapping. Immutable once published.
#[derive(Debug)]
pub struct Route {
    domain: String,
    backend: Backend,
    credential: LeafCredential,
}

impl Route {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn credential(&self) -> &LeafCredential {
        &self.credential
    }
}

/// Concurrent domain -> route map.
pub struct RouteTable {
    root: Arc<RootAuthority>,
    routes: RwLock<HashMap<String, Arc<Route>>>,
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.domains())
            .finish_non_exhaustive()
    }
}

impl RouteTable {
    pub fn new(root: Arc<RootAuthority>) -> Self {
        Self {
            root,
            routes: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &RootAuthority {
        &self.root
    }

    // A panicking writer never leaves a half-written entry (inserts are single
    // map operations), so a poisoned lock is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Route>>> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Route>>> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a credential for `domain` and publish it, replacing any previous route.
    ///
    /// On failure the table is left exactly as it was.
    pub fn add_route(&self, domain: &str, port: &str) -> Result<Arc<Route>> {
        let route = Arc::new(self.build_route(domain, port)?);
        let domain = route.domain.clone();
        let backend = route.backend;
        let previous = self.write().insert(domain.clone(), Arc::clone(&route));

        match previous {
            Some(old) => info!(%domain, from = %old.backend, to = %backend, "route replaced"),
            None => info!(%domain, %backend, "route added"),
        }
        Ok(route)
    }

    /// Rebuild the whole table from `(domain, port)` pairs in a single write.
    ///
    /// Every leaf is issued before the lock is taken, so a domain present both
    /// before and after never disappears from lookups. Pairs that fail are
    /// skipped and returned with their error.
    pub fn replace_routes<'a, I>(&self, mappings: I) -> Vec<(String, Error)>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut fresh = HashMap::new();
        let mut failed = Vec::new();
        for (domain, port) in mappings {
            match self.build_route(domain, port) {
                Ok(route) => {
                    fresh.insert(route.domain.clone(), Arc::new(route));
                }
                Err(e) => failed.push((domain.to_string(), e)),
            }
        }

        let count = fresh.len();
        let old = std::mem::replace(&mut *self.write(), fresh);
        info!(routes = count, previous = old.len(), "route table replaced");
        failed
    }

    fn build_route(&self, domain: &str, port: &str) -> Result<Route> {
        let domain = normalize_domain(domain)?;
        let backend = Backend::parse(port)?;
        let credential = issuer::issue(&self.root, &domain)?;
        Ok(Route {
            domain,
            backend,
            credential,
        })
    }

    /// Drop the route for `domain`. Absent domains are ignored.
    pub fn remove_route(&self, domain: &str) -> Option<Arc<Route>> {
        let key = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        let removed = self.write().remove(&key);
        if removed.is_some() {
            info!(domain = %key, "route removed");
        } else {
            debug!(domain = %key, "remove ignored, no such route");
        }
        removed
    }

    pub fn clear_routes(&self) {
        let old = std::mem::take(&mut *self.write());
        debug!(count = old.len(), "routes cleared");
    }

    pub fn lookup(&self, domain: &str) -> Option<Arc<Route>> {
        let routes = self.read();
        routes.get(domain).cloned().or_else(|| {
            let key = domain.trim_end_matches('.').to_ascii_lowercase();
            routes.get(&key).cloned()
        })
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Active domains, sorted.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.read().keys().cloned().collect();
        domains.sort();
        domains
    }
}
