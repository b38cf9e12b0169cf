//! Control channel to the dysk device manager
//!
//! The device manager exposes a single primitive: submit a fixed-size buffer
//! under a command code and read the response back from the same buffer.
//! Each orchestrator operation opens one channel and releases it before
//! returning.

#[cfg(unix)]
pub mod ioctl;

use std::fmt;
use std::io;

use tracing::debug;

use crate::error::{DyskError, Result};
use crate::wire::{self, Buffer, BUFFER_LEN};

#[cfg(unix)]
pub use ioctl::{DeviceFile, DeviceFileOpener};

/// Default path of the device manager endpoint
pub const DEFAULT_DEVICE_PATH: &str = "/dev/dysk";

/// Command codes understood by the device manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Mount,
    Unmount,
    Get,
    List,
}

impl Command {
    pub fn code(&self) -> u32 {
        match self {
            Command::Mount => 9901,
            Command::Unmount => 9902,
            Command::Get => 9903,
            Command::List => 9904,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Mount => "mount",
            Command::Unmount => "unmount",
            Command::Get => "get",
            Command::List => "list",
        };
        f.write_str(name)
    }
}

/// An open handle to the device manager
pub trait ControlChannel: Send {
    /// Submit `buffer` under `command`; the response overwrites the buffer.
    ///
    /// Returns the response length reported by the device manager. Failures
    /// of the primitive itself are returned as `io::Error`, distinct from an
    /// `ERR` response.
    fn submit(&mut self, command: Command, buffer: &mut Buffer) -> io::Result<usize>;
}

/// Opens control channels
pub trait ChannelOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn ControlChannel>>;
}

/// Send `request` and return the success payload.
///
/// An `ERR` envelope becomes [`DyskError::Device`] carrying the payload text.
pub fn exchange(
    channel: &mut dyn ControlChannel,
    command: Command,
    request: &str,
) -> Result<String> {
    exchange_buffer(channel, command, wire::bufferize(request)?)
}

/// Like [`exchange`], for a request already laid out in a buffer
pub fn exchange_buffer(
    channel: &mut dyn ControlChannel,
    command: Command,
    mut buffer: Buffer,
) -> Result<String> {
    debug!(%command, "submitting control request");

    let len = channel
        .submit(command, &mut buffer)
        .map_err(DyskError::Channel)?;

    let response = if len == 0 || len > BUFFER_LEN {
        &buffer[..]
    } else {
        &buffer[..len]
    };
    let envelope = wire::parse_envelope(response);
    debug!(
        %command,
        is_error = envelope.is_error,
        payload_len = envelope.payload.len(),
        "control response"
    );

    if envelope.is_error {
        return Err(DyskError::Device(envelope.payload));
    }
    Ok(envelope.payload)
}
