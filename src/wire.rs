//! Text codec for the device manager's control buffer
//!
//! Records travel as newline-terminated fields in a fixed order, zero padded to
//! [`BUFFER_LEN`] bytes. The field order lives in one table per layout so the
//! encoder and decoder cannot drift apart:
//!
//! - [`REQUEST`]: what we send on mount (no major/minor).
//! - [`RESPONSE`]: what the device manager returns on mount and get.
//!
//! Responses are wrapped in an envelope whose first line is `OK` or `ERR`.

use crate::device::{limits, AccessMode, DeviceRecord};
use crate::error::{DyskError, Result};

/// Capacity of the control buffer, shared by request and response
pub const BUFFER_LEN: usize = 2048;

/// First line of a successful response
pub const OK_MARKER: &str = "OK";

/// First line of a failed response
pub const ERR_MARKER: &str = "ERR";

/// Payload of a list request
pub const LIST_SENTINEL: &str = "-";

/// A fixed-size control buffer
pub type Buffer = [u8; BUFFER_LEN];

/// Record fields as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Mode,
    Name,
    SectorCount,
    AccountName,
    AccountKey,
    Path,
    Host,
    Ip,
    LeaseId,
    Major,
    Minor,
    Vhd,
}

impl Field {
    fn label(&self) -> &'static str {
        match self {
            Field::Mode => "read/write flag",
            Field::Name => "device name",
            Field::SectorCount => "sector count",
            Field::AccountName => "account name",
            Field::AccountKey => "account key",
            Field::Path => "path",
            Field::Host => "host",
            Field::Ip => "ip",
            Field::LeaseId => "lease id",
            Field::Major => "major",
            Field::Minor => "minor",
            Field::Vhd => "vhd flag",
        }
    }

    /// Ceiling of the device manager buffer backing this field
    fn max_len(&self) -> Option<usize> {
        match self {
            Field::Name => Some(limits::DEVICE_NAME_LEN),
            Field::AccountName => Some(limits::ACCOUNT_NAME_LEN),
            Field::AccountKey => Some(limits::ACCOUNT_KEY_LEN),
            Field::Path => Some(limits::BLOB_PATH_LEN),
            Field::Host => Some(limits::HOST_LEN),
            Field::Ip => Some(limits::IP_LEN),
            Field::LeaseId => Some(limits::LEASE_ID_LEN),
            _ => None,
        }
    }

    fn render(&self, record: &DeviceRecord) -> String {
        match self {
            Field::Mode => record.mode.as_str().to_string(),
            Field::Name => record.name.clone(),
            Field::SectorCount => record.sector_count.to_string(),
            Field::AccountName => record.account_name.clone(),
            Field::AccountKey => record.account_key.clone(),
            Field::Path => record.path.clone(),
            Field::Host => record.host.clone(),
            Field::Ip => record.ip.clone(),
            Field::LeaseId => record.lease_id.clone(),
            Field::Major => record.major.to_string(),
            Field::Minor => record.minor.to_string(),
            Field::Vhd => (if record.vhd { "1" } else { "0" }).to_string(),
        }
    }

    fn assign(&self, record: &mut DeviceRecord, value: &str) -> Result<()> {
        match self {
            Field::Mode => {
                record.mode = value.parse::<AccessMode>().map_err(|_| self.invalid(value))?;
            }
            Field::Name => record.name = value.to_string(),
            Field::SectorCount => {
                record.sector_count = value.parse().map_err(|_| self.invalid(value))?;
            }
            Field::AccountName => record.account_name = value.to_string(),
            Field::AccountKey => record.account_key = value.to_string(),
            Field::Path => record.path = value.to_string(),
            Field::Host => record.host = value.to_string(),
            Field::Ip => record.ip = value.to_string(),
            Field::LeaseId => record.lease_id = value.to_string(),
            Field::Major => record.major = value.parse().map_err(|_| self.invalid(value))?,
            Field::Minor => record.minor = value.parse().map_err(|_| self.invalid(value))?,
            Field::Vhd => {
                record.vhd = match value {
                    "0" => false,
                    "1" => true,
                    _ => return Err(self.invalid(value)),
                }
            }
        }
        Ok(())
    }

    fn invalid(&self, value: &str) -> DyskError {
        DyskError::Decode(format!("Can't determine {} from '{}'", self.label(), value))
    }
}

/// Ordered field table for one buffer layout
#[derive(Debug)]
pub struct Schema {
    pub version: u32,
    pub fields: &'static [Field],
}

/// Layout of a mount request
pub const REQUEST: Schema = Schema {
    version: 1,
    fields: &[
        Field::Mode,
        Field::Name,
        Field::SectorCount,
        Field::AccountName,
        Field::AccountKey,
        Field::Path,
        Field::Host,
        Field::Ip,
        Field::LeaseId,
        Field::Vhd,
    ],
};

/// Layout of a record returned by the device manager
pub const RESPONSE: Schema = Schema {
    version: 1,
    fields: &[
        Field::Mode,
        Field::Name,
        Field::SectorCount,
        Field::AccountName,
        Field::AccountKey,
        Field::Path,
        Field::Host,
        Field::Ip,
        Field::LeaseId,
        Field::Major,
        Field::Minor,
        Field::Vhd,
    ],
};

impl Schema {
    /// Serialize a record as newline-terminated text
    pub fn to_text(&self, record: &DeviceRecord) -> Result<String> {
        let mut out = String::new();
        for field in self.fields {
            let value = field.render(record);
            if value.contains('\n') || value.contains('\0') {
                return Err(DyskError::Encode(format!(
                    "{} contains a line break or NUL byte",
                    field.label()
                )));
            }
            if let Some(max) = field.max_len() {
                if value.len() > max {
                    return Err(DyskError::Encode(format!(
                        "{} is {} bytes, maximum is {}",
                        field.label(),
                        value.len(),
                        max
                    )));
                }
            }
            out.push_str(&value);
            out.push('\n');
        }
        Ok(out)
    }

    fn build(&self, values: &[&str]) -> Result<DeviceRecord> {
        let mut record = DeviceRecord::new(AccessMode::ReadOnly, "", "", false);
        for (field, value) in self.fields.iter().zip(values) {
            field.assign(&mut record, value)?;
        }
        Ok(record)
    }
}

/// Encode a record into a padded mount request buffer
pub fn encode(record: &DeviceRecord) -> Result<Buffer> {
    bufferize(&REQUEST.to_text(record)?)
}

/// Decode a record from buffer text.
///
/// The layout is chosen by field count; no field is validated beyond what is
/// needed to parse it.
pub fn decode(text: &str) -> Result<DeviceRecord> {
    let mut values: Vec<&str> = text.split('\n').collect();
    if values.last() == Some(&"") {
        values.pop();
    }

    let schema = if values.len() == RESPONSE.fields.len() {
        &RESPONSE
    } else if values.len() == REQUEST.fields.len() {
        &REQUEST
    } else {
        return Err(DyskError::Decode(format!(
            "expected {} or {} fields, found {}",
            REQUEST.fields.len(),
            RESPONSE.fields.len(),
            values.len()
        )));
    };

    schema.build(&values)
}

/// Copy `text` into a zero-padded buffer of exactly [`BUFFER_LEN`] bytes
pub fn bufferize(text: &str) -> Result<Buffer> {
    let bytes = text.as_bytes();
    if bytes.len() > BUFFER_LEN {
        return Err(DyskError::Encode(format!(
            "request is {} bytes, control buffer holds {}",
            bytes.len(),
            BUFFER_LEN
        )));
    }
    let mut buffer = [0u8; BUFFER_LEN];
    buffer[..bytes.len()].copy_from_slice(bytes);
    Ok(buffer)
}

/// Request payload naming a single device
pub fn name_request(name: &str) -> String {
    format!("{}\n", name)
}

/// Parsed response envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub is_error: bool,
    pub payload: String,
}

/// Split a response into its marker line and payload.
///
/// Text ends at the first NUL byte. Anything other than `ERR` on the first
/// line counts as success.
pub fn parse_envelope(bytes: &[u8]) -> Envelope {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    let text = String::from_utf8_lossy(&bytes[..end]);

    match text.split_once('\n') {
        Some((marker, payload)) => Envelope {
            is_error: marker == ERR_MARKER,
            payload: payload.to_string(),
        },
        None => Envelope {
            is_error: text == ERR_MARKER,
            payload: String::new(),
        },
    }
}

/// Device names from a list payload.
///
/// The payload is newline terminated, so the element after the last newline
/// is dropped.
pub fn parse_names(payload: &str) -> Vec<String> {
    let mut names: Vec<&str> = payload.split('\n').collect();
    names.pop();
    names.into_iter().map(str::to_string).collect()
}
