//! dysk: Azure page blobs as local block devices
//!
//! The dysk kernel module exposes block devices whose sectors live in Azure
//! page blobs. This library is the user-space side: it prepares and leases
//! blobs, validates device records, and drives the module over its ioctl
//! control channel.
//!
//! # Architecture
//!
//! - **Control channel**: fixed 2048-byte request/response exchanges with the
//!   device manager (`channel`), carrying newline-delimited records (`wire`).
//! - **Blob store**: the narrow set of page blob capabilities the client needs
//!   (`store`), implemented over the Blob REST API and in memory.
//! - **Leases and lifecycle**: exclusive leases guarding mounted blobs
//!   (`lease`) and blob creation with an optional VHD footer (`lifecycle`).
//! - **Client**: the mount, unmount, get and list orchestration (`client`).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dysk::channel::DeviceFileOpener;
//! use dysk::client::{DyskClient, MountRequest};
//! use dysk::resolve::SystemResolver;
//! use dysk::store::azure::AzureConnector;
//!
//! # async fn example() -> dysk::Result<()> {
//! let client = DyskClient::new(
//!     Arc::new(DeviceFileOpener::default()),
//!     Arc::new(AzureConnector::default()),
//!     Arc::new(SystemResolver),
//! )
//! .with_credentials("myaccount", "c2VjcmV0LWtleQ==");
//!
//! let request = MountRequest {
//!     auto_create: true,
//!     size_gb: 4,
//!     ..Default::default()
//! };
//! let record = client.mount(&request).await?;
//! println!("mounted {} at {}:{}", record.name, record.major, record.minor);
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod device;
pub mod env;
pub mod error;
pub mod lease;
pub mod lifecycle;
pub mod output;
pub mod pv;
pub mod resolve;
pub mod size;
pub mod store;
pub mod validate;
pub mod vhd;
pub mod wire;

pub use error::{DyskError, Result};
