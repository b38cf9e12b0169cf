//! Mount, unmount and query orchestration
//!
//! [`DyskClient`] ties the pieces together: it prepares blobs in storage,
//! validates device records, and drives the device manager over the control
//! channel. Every operation opens its own channel and closes it before
//! returning, on success and on error.

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use scopeguard::ScopeGuard;
use tracing::{debug, info, warn};

use crate::channel::{self, ChannelOpener, Command, ControlChannel};
use crate::device::{AccessMode, DeviceRecord};
use crate::error::{DyskError, Result};
use crate::lease::{CleanupWarning, LeaseManager, Outcome};
use crate::lifecycle::{object_name_for, CreatedObject, Lifecycle};
use crate::resolve::HostResolver;
use crate::size;
use crate::store::azure::DEFAULT_DOMAIN;
use crate::store::{BlobRef, BlobStore, StoreConnector};
use crate::validate::{validate_device_name, validate_lookup_name, Validator};
use crate::wire;

/// Container used when none is given
pub const DEFAULT_CONTAINER: &str = "dysks";

/// Size of new blobs when none is given
pub const DEFAULT_SIZE_GB: u64 = 2;

const RANDOM_NAME_LEN: usize = 20;

/// A random device name: `d` followed by 20 letters and digits
pub fn random_device_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_NAME_LEN)
        .map(char::from)
        .collect();
    format!("d{}", suffix)
}

/// Storage account credentials
#[derive(Clone)]
pub struct Credentials {
    pub account: String,
    pub key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

/// Parameters of a mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Device name; a random one is generated when absent
    pub device_name: Option<String>,
    /// Blob name; defaults to the device name
    pub object_name: Option<String>,
    pub container: String,
    /// Size of the blob to create with `auto_create`
    pub size_gb: u64,
    pub vhd: bool,
    pub read_only: bool,
    pub auto_create: bool,
    pub auto_lease: bool,
    pub break_lease: bool,
    pub lease_id: Option<String>,
}

impl Default for MountRequest {
    fn default() -> Self {
        Self {
            device_name: None,
            object_name: None,
            container: DEFAULT_CONTAINER.to_string(),
            size_gb: DEFAULT_SIZE_GB,
            vhd: true,
            read_only: false,
            auto_create: false,
            auto_lease: true,
            break_lease: false,
            lease_id: None,
        }
    }
}

impl MountRequest {
    pub fn mode(&self) -> AccessMode {
        if self.read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        }
    }
}

/// Parameters of a blob creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Blob name; a random device-style name is used when absent
    pub name: Option<String>,
    pub container: String,
    pub size_gb: u64,
    pub vhd: bool,
    pub lease: bool,
}

impl Default for CreateRequest {
    fn default() -> Self {
        Self {
            name: None,
            container: DEFAULT_CONTAINER.to_string(),
            size_gb: DEFAULT_SIZE_GB,
            vhd: true,
            lease: false,
        }
    }
}

/// Lease handling while mounting a prepared record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseOptions {
    /// Acquire a lease when the record has none
    pub auto_lease: bool,
    /// Break a lease held by someone else while acquiring
    pub break_lease: bool,
}

type ChannelGuard = ScopeGuard<Box<dyn ControlChannel>, fn(Box<dyn ControlChannel>)>;

fn close_channel(channel: Box<dyn ControlChannel>) {
    debug!("closing control channel");
    drop(channel);
}

/// Client for the dysk device manager
pub struct DyskClient {
    credentials: Option<Credentials>,
    connector: Arc<dyn StoreConnector>,
    channels: Arc<dyn ChannelOpener>,
    resolver: Arc<dyn HostResolver>,
    domain: String,
}

impl DyskClient {
    pub fn new(
        channels: Arc<dyn ChannelOpener>,
        connector: Arc<dyn StoreConnector>,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self {
            credentials: None,
            connector,
            channels,
            resolver,
            domain: DEFAULT_DOMAIN.to_string(),
        }
    }

    /// Credentials used for blob operations and for new mounts
    pub fn with_credentials(mut self, account: impl Into<String>, key: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            account: account.into(),
            key: key.into(),
        });
        self
    }

    /// Storage DNS suffix used to derive hosts
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    fn credentials(&self) -> Result<&Credentials> {
        self.credentials.as_ref().ok_or_else(|| {
            DyskError::Config("storage account name and key are required".to_string())
        })
    }

    fn store(&self) -> Result<Arc<dyn BlobStore>> {
        let credentials = self.credentials()?;
        self.connector
            .connect(&credentials.account, &credentials.key)
    }

    fn open_channel(&self) -> Result<ChannelGuard> {
        let channel = self.channels.open()?;
        Ok(scopeguard::guard(channel, close_channel as fn(_)))
    }

    /// Mount a blob as a block device, creating it first with `auto_create`
    pub async fn mount(&self, request: &MountRequest) -> Result<DeviceRecord> {
        let credentials = self.credentials()?.clone();

        let name = request
            .device_name
            .clone()
            .unwrap_or_else(random_device_name);
        validate_device_name(&name)?;

        let object = object_name_for(
            request.object_name.as_deref().unwrap_or(&name),
            request.vhd,
        );
        let mut lease_id = request.lease_id.clone().unwrap_or_default();

        let mut created_lease = false;
        let blob = if request.auto_create {
            let created = Lifecycle::new(self.store()?)
                .create_object(
                    request.size_gb,
                    &request.container,
                    &object,
                    request.vhd,
                    request.auto_lease,
                )
                .await?;
            if let Some(id) = created.lease_id {
                lease_id = id;
                created_lease = true;
            }
            created.blob
        } else {
            BlobRef::new(&request.container, object)
        };

        let mut record = DeviceRecord::new(request.mode(), name, blob.path(), request.vhd);
        record.account_name = credentials.account;
        record.account_key = credentials.key;
        record.lease_id = lease_id;

        let result = self
            .mount_record(
                record,
                LeaseOptions {
                    auto_lease: request.auto_lease,
                    break_lease: request.break_lease,
                },
            )
            .await;

        if result.is_err() && created_lease {
            // The new blob stays; only its lease is released. Failure is logged.
            if let Ok(store) = self.store() {
                LeaseManager::new(store).break_best_effort(&blob).await;
            }
        }
        result
    }

    /// Mount a prepared record.
    ///
    /// The blob is located and sized first, then leased if needed, then the
    /// record is validated, and only then is it sent to the device manager.
    /// Missing credentials on the record are taken from the client.
    pub async fn mount_record(
        &self,
        mut record: DeviceRecord,
        options: LeaseOptions,
    ) -> Result<DeviceRecord> {
        if record.account_name.is_empty() || record.account_key.is_empty() {
            let credentials = self.credentials()?;
            record.account_name = credentials.account.clone();
            record.account_key = credentials.key.clone();
        }

        let mut channel = self.open_channel()?;

        let store = self
            .connector
            .connect(&record.account_name, &record.account_key)?;
        let leases = LeaseManager::new(store);

        let blob = BlobRef::parse(&record.path)?;
        let properties = leases.locate(&blob).await?;
        let blob_size_gb = size::size_gb_from_object(properties.content_length);
        if record.size_gb != 0 && record.size_gb != blob_size_gb {
            return Err(DyskError::Validation(format!(
                "Invalid size. Record has {}GB but blob {} holds {}GB",
                record.size_gb, blob, blob_size_gb
            )));
        }
        record.set_size_gb(blob_size_gb)?;

        let acquired = record.lease_id.is_empty() && options.auto_lease;
        if acquired {
            record.lease_id = leases.acquire(&blob, options.break_lease).await?;
        }

        if let Err(e) = self.submit_mount(&mut **channel, &leases, &mut record).await {
            if acquired {
                // Release the lease taken above; a failed break is logged
                leases.break_best_effort(&blob).await;
            }
            return Err(e);
        }

        info!(
            name = %record.name,
            path = %record.path,
            major = record.major,
            minor = record.minor,
            "mounted device"
        );
        Ok(record)
    }

    /// Validate a leased record and hand it to the device manager
    async fn submit_mount(
        &self,
        channel: &mut dyn ControlChannel,
        leases: &LeaseManager,
        record: &mut DeviceRecord,
    ) -> Result<()> {
        Validator::new(leases.clone(), self.resolver.clone())
            .with_domain(self.domain.clone())
            .validate(record)
            .await?;

        let payload = channel::exchange_buffer(channel, Command::Mount, wire::encode(record)?)?;
        let mounted = wire::decode(&payload)?;
        record.major = mounted.major;
        record.minor = mounted.minor;
        Ok(())
    }

    /// Unmount a device, optionally breaking the lease on its blob afterwards.
    ///
    /// A failed break does not fail the unmount; it is returned as a warning.
    pub async fn unmount(&self, name: &str, break_lease: bool) -> Result<Outcome<()>> {
        validate_lookup_name(name)?;

        let mounted = {
            let mut channel = self.open_channel()?;
            let mounted = if break_lease {
                Some(get_on(&mut **channel, name)?)
            } else {
                None
            };
            channel::exchange(&mut **channel, Command::Unmount, &wire::name_request(name))?;
            mounted
        };
        info!(name, "unmounted device");

        let mut outcome = Outcome::new(());
        if let Some(record) = mounted {
            outcome.push_warning(self.break_record_lease(&record).await);
        }
        Ok(outcome)
    }

    /// Break the lease on a record's blob using the record's own credentials
    async fn break_record_lease(&self, record: &DeviceRecord) -> Option<CleanupWarning> {
        let target = record.path.clone();
        let store = match self
            .connector
            .connect(&record.account_name, &record.account_key)
        {
            Ok(store) => store,
            Err(e) => {
                warn!(path = %target, error = %e, "cannot connect to break lease");
                return Some(CleanupWarning::new("break lease on", target, &e));
            }
        };
        let blob = match BlobRef::parse(&record.path) {
            Ok(blob) => blob,
            Err(e) => return Some(CleanupWarning::new("break lease on", target, &e)),
        };
        LeaseManager::new(store).break_best_effort(&blob).await
    }

    /// Get a mounted device by name
    pub fn get(&self, name: &str) -> Result<DeviceRecord> {
        validate_lookup_name(name)?;
        let mut channel = self.open_channel()?;
        let mut record = get_on(&mut **channel, name)?;
        record.size_from_sectors()?;
        Ok(record)
    }

    /// All mounted devices, in the order the device manager reports them
    pub fn list(&self) -> Result<Vec<DeviceRecord>> {
        let mut channel = self.open_channel()?;
        let payload = channel::exchange(&mut **channel, Command::List, wire::LIST_SENTINEL)?;

        wire::parse_names(&payload)
            .iter()
            .map(|name| {
                let mut record = get_on(&mut **channel, name)?;
                record.size_from_sectors()?;
                Ok(record)
            })
            .collect()
    }

    /// Create a blob without mounting it
    pub async fn create(&self, request: &CreateRequest) -> Result<CreatedObject> {
        let name = request.name.clone().unwrap_or_else(random_device_name);
        Lifecycle::new(self.store()?)
            .create_object(
                request.size_gb,
                &request.container,
                &name,
                request.vhd,
                request.lease,
            )
            .await
    }

    /// Delete a blob, under `lease_id` or after breaking its lease
    pub async fn delete(
        &self,
        container: &str,
        name: &str,
        lease_id: Option<&str>,
        force_break: bool,
    ) -> Result<Outcome<()>> {
        let blob = BlobRef::new(container, name);
        Lifecycle::new(self.store()?)
            .delete_object(&blob, lease_id, force_break)
            .await
    }
}

/// Fetch a record over an already open channel
fn get_on(channel: &mut dyn ControlChannel, name: &str) -> Result<DeviceRecord> {
    let payload = channel::exchange(channel, Command::Get, &wire::name_request(name))?;
    wire::decode(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_device_name_is_valid() {
        for _ in 0..50 {
            let name = random_device_name();
            assert_eq!(name.len(), 21);
            assert!(name.starts_with('d'));
            validate_device_name(&name).unwrap();
        }
        assert_ne!(random_device_name(), random_device_name());
    }

    #[test]
    fn test_mount_request_defaults() {
        let request = MountRequest::default();
        assert_eq!(request.container, "dysks");
        assert_eq!(request.size_gb, 2);
        assert!(request.vhd);
        assert!(request.auto_lease);
        assert!(!request.break_lease);
        assert_eq!(request.mode(), AccessMode::ReadWrite);

        let read_only = MountRequest {
            read_only: true,
            ..Default::default()
        };
        assert_eq!(read_only.mode(), AccessMode::ReadOnly);
    }

    #[test]
    fn test_credentials_debug_hides_key() {
        let credentials = Credentials {
            account: "acct".into(),
            key: "c2VjcmV0".into(),
        };
        assert!(!format!("{:?}", credentials).contains("c2VjcmV0"));
    }
}
