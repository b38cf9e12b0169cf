//! Device record validation
//!
//! A record is checked field by field, in a fixed order, stopping at the
//! first failure. The last two steps reach out of process: the storage host
//! is resolved and the lease is proven live against the blob service.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::device::{limits, DeviceRecord};
use crate::error::{DyskError, Result};
use crate::lease::LeaseManager;
use crate::resolve::HostResolver;
use crate::store::azure::DEFAULT_DOMAIN;
use crate::store::BlobRef;

/// Device names: a letter followed by letters and digits
static DEVICE_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]*$").unwrap());

/// Names accepted for lookups; anything the device manager may list
static LOOKUP_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9.]+$").unwrap());

fn invalid(msg: impl Into<String>) -> DyskError {
    DyskError::Validation(msg.into())
}

fn check_name_length(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > limits::DEVICE_NAME_LEN {
        return Err(invalid(format!(
            "Invalid name. Only max of({}) chars",
            limits::DEVICE_NAME_LEN
        )));
    }
    Ok(())
}

/// Name rule for new devices
pub fn validate_device_name(name: &str) -> Result<()> {
    check_name_length(name)?;
    if !DEVICE_NAME_PATTERN.is_match(name) {
        return Err(invalid(
            "Invalid device name. alpha+numbers allowed. must start with alpha",
        ));
    }
    Ok(())
}

/// Name rule for get and unmount
pub fn validate_lookup_name(name: &str) -> Result<()> {
    check_name_length(name)?;
    if !LOOKUP_NAME_PATTERN.is_match(name) {
        return Err(invalid(format!(
            "Invalid device name {}. alpha+numbers+dots allowed",
            name
        )));
    }
    Ok(())
}

/// Account key or SAS: bounded length and valid base64
pub fn validate_credential(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > limits::ACCOUNT_KEY_LEN {
        return Err(invalid(format!(
            "Invalid Account Key. Must be <= {}",
            limits::ACCOUNT_KEY_LEN
        )));
    }
    STANDARD.decode(key).map_err(|e| {
        invalid(format!(
            "Invalid account key. Must be a base64 encoded string. Error:{}",
            e
        ))
    })?;
    Ok(())
}

/// Runs the full validation pipeline
pub struct Validator {
    leases: LeaseManager,
    resolver: Arc<dyn HostResolver>,
    domain: String,
}

impl Validator {
    pub fn new(leases: LeaseManager, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            leases,
            resolver,
            domain: DEFAULT_DOMAIN.to_string(),
        }
    }

    /// Storage DNS suffix used when the record has no host
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Local field checks. Fills in the host when it is empty.
    ///
    /// Access mode is a closed enum, so it is valid by construction.
    pub fn check_fields(&self, record: &mut DeviceRecord) -> Result<BlobRef> {
        validate_device_name(&record.name)?;

        if record.sector_count == 0 {
            return Err(invalid("Invalid Sector count."));
        }
        if record.size_gb != 0 && !record.sizes_agree() {
            return Err(invalid(format!(
                "Invalid Sector count. {} sectors do not match {}GB",
                record.sector_count, record.size_gb
            )));
        }

        if record.account_name.is_empty() || record.account_name.len() > limits::ACCOUNT_NAME_LEN
        {
            return Err(invalid(format!(
                "Invalid Account name. Must be <= than {}",
                limits::ACCOUNT_NAME_LEN
            )));
        }

        validate_credential(&record.account_key)?;

        let blob = BlobRef::parse(&record.path)?;

        if record.host.is_empty() {
            record.host = format!("{}.{}", record.account_name, self.domain);
        }
        if record.host.len() > limits::HOST_LEN {
            return Err(invalid(format!(
                "Invalid host. Must be <= {}",
                limits::HOST_LEN
            )));
        }

        if record.lease_id.is_empty() || record.lease_id.len() > limits::LEASE_ID_LEN {
            return Err(invalid(format!(
                "Invalid Lease Id. Must be <= {}",
                limits::LEASE_ID_LEN
            )));
        }

        Ok(blob)
    }

    /// Validate `record`, filling in host and ip.
    ///
    /// The final step proves the lease against the blob service.
    pub async fn validate(&self, record: &mut DeviceRecord) -> Result<()> {
        let blob = self.check_fields(record)?;

        let ip = self.resolver.resolve(&record.host).await?.to_string();
        if ip.len() > limits::IP_LEN {
            return Err(invalid(format!(
                "Invalid IP for host:{}. Must be <= {}",
                record.host,
                limits::IP_LEN
            )));
        }
        debug!(host = %record.host, ip = %ip, "resolved storage host");
        record.ip = ip;

        self.leases
            .verify_writable(&blob, &record.lease_id, record.mode)
            .await?;
        Ok(())
    }
}
