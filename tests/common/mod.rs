//! Common test utilities and fixtures
//!
//! [`FakeDeviceManager`] plays the kernel side of the control channel: it
//! speaks the same text protocol over the same fixed buffer, keeps a table of
//! mounted devices, and records every request it sees. [`TestHarness`] wires
//! it to an in-memory blob store and a static resolver.

#![allow(dead_code)]

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use parking_lot::Mutex;

use dysk::channel::{ChannelOpener, Command, ControlChannel};
use dysk::client::DyskClient;
use dysk::device::DeviceRecord;
use dysk::resolve::StaticResolver;
use dysk::store::memory::{MemoryBlobStore, MemoryConnector};
use dysk::wire::{self, Buffer, BUFFER_LEN};
use dysk::Result;

pub const ACCOUNT: &str = "testaccount";
/// base64 of "secret-key"
pub const KEY: &str = "c2VjcmV0LWtleQ==";
pub const HOST: &str = "testaccount.blob.core.windows.net";
pub const HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 4);
pub const MAJOR: i64 = 252;

#[derive(Debug, Default)]
struct DeviceTable {
    /// Mounted devices in mount order
    devices: Vec<DeviceRecord>,
    next_minor: i64,
    requests: Vec<(Command, String)>,
    opened: usize,
}

impl DeviceTable {
    fn handle(&mut self, command: Command, request: &str) -> String {
        match command {
            Command::Mount => match wire::decode(request) {
                Ok(mut record) => {
                    if self.devices.iter().any(|d| d.name == record.name) {
                        return format!(
                            "ERR\nDevice with name:{} already exists",
                            record.name
                        );
                    }
                    record.major = MAJOR;
                    record.minor = self.next_minor;
                    self.next_minor += 16;
                    let response = respond(&record);
                    self.devices.push(record);
                    response
                }
                Err(e) => format!("ERR\nFailed to parse dysk: {}", e),
            },
            Command::Get => {
                let name = request.trim_end_matches('\n');
                match self.devices.iter().find(|d| d.name == name) {
                    Some(record) => respond(record),
                    None => format!(
                        "ERR\nFailed to get dysk, device with name:{} does not exists",
                        name
                    ),
                }
            }
            Command::Unmount => {
                let name = request.trim_end_matches('\n');
                match self.devices.iter().position(|d| d.name == name) {
                    Some(index) => {
                        self.devices.remove(index);
                        "OK\n".to_string()
                    }
                    None => format!(
                        "ERR\nFailed to unmount dysk, device with name:{} does not exists",
                        name
                    ),
                }
            }
            Command::List => {
                let mut response = "OK\n".to_string();
                for device in &self.devices {
                    response.push_str(&device.name);
                    response.push('\n');
                }
                response
            }
        }
    }
}

fn respond(record: &DeviceRecord) -> String {
    match wire::RESPONSE.to_text(record) {
        Ok(text) => format!("OK\n{}", text),
        Err(e) => format!("ERR\n{}", e),
    }
}

/// In-process stand-in for the dysk device manager
#[derive(Debug, Clone, Default)]
pub struct FakeDeviceManager {
    table: Arc<Mutex<DeviceTable>>,
}

impl FakeDeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request seen so far, in order
    pub fn requests(&self) -> Vec<(Command, String)> {
        self.table.lock().requests.clone()
    }

    pub fn requests_for(&self, command: Command) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|(c, _)| *c == command)
            .map(|(_, r)| r)
            .collect()
    }

    pub fn mounted_names(&self) -> Vec<String> {
        self.table
            .lock()
            .devices
            .iter()
            .map(|d| d.name.clone())
            .collect()
    }

    /// Number of channels opened
    pub fn opened(&self) -> usize {
        self.table.lock().opened
    }
}

impl ChannelOpener for FakeDeviceManager {
    fn open(&self) -> Result<Box<dyn ControlChannel>> {
        self.table.lock().opened += 1;
        Ok(Box::new(FakeChannel {
            table: self.table.clone(),
        }))
    }
}

struct FakeChannel {
    table: Arc<Mutex<DeviceTable>>,
}

impl ControlChannel for FakeChannel {
    fn submit(&mut self, command: Command, buffer: &mut Buffer) -> io::Result<usize> {
        let end = buffer.iter().position(|b| *b == 0).unwrap_or(BUFFER_LEN);
        let request = String::from_utf8_lossy(&buffer[..end]).into_owned();

        let response = {
            let mut table = self.table.lock();
            table.requests.push((command, request.clone()));
            table.handle(command, &request)
        };

        let bytes = response.as_bytes();
        if bytes.len() > BUFFER_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "response too large"));
        }
        buffer.fill(0);
        buffer[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }
}

/// Device manager that answers every get with the same text.
///
/// A list reports a single device named after the canned record.
#[derive(Debug, Clone)]
pub struct CannedDeviceManager {
    name: String,
    get_response: String,
}

impl CannedDeviceManager {
    pub fn new(name: &str, get_response: &str) -> Self {
        Self {
            name: name.to_string(),
            get_response: get_response.to_string(),
        }
    }

    /// Client that talks only to this manager
    pub fn client(&self) -> DyskClient {
        DyskClient::new(
            Arc::new(self.clone()),
            Arc::new(MemoryConnector::new()),
            Arc::new(StaticResolver::new()),
        )
        .with_credentials(ACCOUNT, KEY)
    }
}

impl ChannelOpener for CannedDeviceManager {
    fn open(&self) -> Result<Box<dyn ControlChannel>> {
        Ok(Box::new(CannedChannel {
            manager: self.clone(),
        }))
    }
}

struct CannedChannel {
    manager: CannedDeviceManager,
}

impl ControlChannel for CannedChannel {
    fn submit(&mut self, command: Command, buffer: &mut Buffer) -> io::Result<usize> {
        let response = match command {
            Command::List => format!("OK\n{}\n", self.manager.name),
            Command::Get => self.manager.get_response.clone(),
            _ => "ERR\nunsupported".to_string(),
        };
        let bytes = response.as_bytes();
        buffer.fill(0);
        buffer[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }
}

/// Client wired to a fake device manager and an in-memory blob store
pub struct TestHarness {
    pub manager: FakeDeviceManager,
    pub connector: Arc<MemoryConnector>,
    pub client: DyskClient,
}

impl TestHarness {
    pub fn new() -> Self {
        let manager = FakeDeviceManager::new();
        let connector = Arc::new(MemoryConnector::new());
        let resolver = StaticResolver::new().with_host(HOST, IpAddr::V4(HOST_IP));

        let client = DyskClient::new(
            Arc::new(manager.clone()),
            connector.clone(),
            Arc::new(resolver),
        )
        .with_credentials(ACCOUNT, KEY);

        Self {
            manager,
            connector,
            client,
        }
    }

    /// The account's blob store
    pub fn store(&self) -> Arc<MemoryBlobStore> {
        self.connector.store(ACCOUNT)
    }
}

/// Lines of a request or response text, without the trailing terminator
pub fn lines(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    lines
}
