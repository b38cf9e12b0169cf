//! Host name resolution for the device manager
//!
//! The device manager connects to storage by address, so the host is resolved
//! in user space before mounting.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{DyskError, Result};

/// Resolves a host name to a single address
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<IpAddr>;
}

fn lookup_failed(host: &str) -> DyskError {
    DyskError::Validation(format!("Failed to lookup ip for host:{}", host))
}

/// Resolver backed by the system resolver. IPv4 addresses are preferred.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 443))
            .await
            .map_err(|e| {
                debug!(host, error = %e, "host lookup failed");
                lookup_failed(host)
            })?
            .map(|addr| addr.ip())
            .collect();

        addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| lookup_failed(host))
    }
}

/// Resolver with a fixed host table.
///
/// Useful for tests and for hosts that must not go through DNS.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, IpAddr>,
    fallback: Option<IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every host to `ip`
    pub fn always(ip: IpAddr) -> Self {
        Self {
            hosts: HashMap::new(),
            fallback: Some(ip),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.hosts.insert(host.into(), ip);
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr> {
        self.hosts
            .get(host)
            .copied()
            .or(self.fallback)
            .ok_or_else(|| lookup_failed(host))
    }
}
