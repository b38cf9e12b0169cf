//! `/dev/dysk` endpoint driven through `ioctl(2)`

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::channel::{ChannelOpener, Command, ControlChannel, DEFAULT_DEVICE_PATH};
use crate::error::{DyskError, Result};
use crate::wire::Buffer;

/// Opens the device manager's character device
#[derive(Debug, Clone)]
pub struct DeviceFileOpener {
    path: PathBuf,
}

impl DeviceFileOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for DeviceFileOpener {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_PATH)
    }
}

impl ChannelOpener for DeviceFileOpener {
    fn open(&self) -> Result<Box<dyn ControlChannel>> {
        let file = OpenOptions::new().read(true).open(&self.path).map_err(|e| {
            DyskError::Channel(io::Error::new(
                e.kind(),
                format!("failed to open {:?}: {}", self.path, e),
            ))
        })?;
        debug!("Opened control channel {:?}", self.path);
        Ok(Box::new(DeviceFile {
            file,
            path: self.path.clone(),
        }))
    }
}

/// An open `/dev/dysk` handle; closed on drop
pub struct DeviceFile {
    file: File,
    path: PathBuf,
}

impl ControlChannel for DeviceFile {
    fn submit(&mut self, command: Command, buffer: &mut Buffer) -> io::Result<usize> {
        trace!("ioctl {} ({}) on {:?}", command, command.code(), self.path);

        // SAFETY: the device manager reads and writes at most BUFFER_LEN bytes,
        // which is exactly the size of `buffer`.
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                command.code() as _,
                buffer.as_mut_ptr(),
            )
        };

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }
}

impl Drop for DeviceFile {
    fn drop(&mut self) {
        debug!("Closing control channel {:?}", self.path);
    }
}
