//! Rendering of command results for the CLI

use serde::Serialize;

use crate::device::DeviceRecord;
use crate::error::Result;
use crate::lifecycle::CreatedObject;

/// Output format of listing commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

const RECORD_HEADERS: [&str; 6] = ["Type", "Name", "VHD", "SizeGB", "AccountName", "Path"];

/// JSON with four-space indentation
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn push_row<'a>(out: &mut String, widths: &[usize], cells: impl Iterator<Item = &'a str>) {
    let line: Vec<String> = cells
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = width))
        .collect();
    out.push_str(line.join("  ").trim_end());
    out.push('\n');
}

/// Left-aligned columns separated by two spaces
fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &widths, headers.iter().copied());
    for row in rows {
        push_row(&mut out, &widths, row.iter().map(String::as_str));
    }
    out
}

/// Render device records
pub fn render_records(records: &[DeviceRecord], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => to_json(records),
        OutputFormat::Table => {
            let rows: Vec<Vec<String>> = records
                .iter()
                .map(|r| {
                    vec![
                        r.mode.to_string(),
                        r.name.clone(),
                        if r.vhd { "Yes" } else { "No" }.to_string(),
                        r.size_gb.to_string(),
                        r.account_name.clone(),
                        r.path.clone(),
                    ]
                })
                .collect();
            Ok(table(&RECORD_HEADERS, &rows))
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedView<'a> {
    path: String,
    #[serde(rename = "SizeGB")]
    size_gb: u64,
    vhd: bool,
    lease_id: &'a str,
}

/// Render a newly created blob
pub fn render_created(created: &CreatedObject, format: OutputFormat) -> Result<String> {
    let view = CreatedView {
        path: created.blob.path(),
        size_gb: created.size_gb,
        vhd: created.trailer,
        lease_id: created.lease_id.as_deref().unwrap_or(""),
    };
    match format {
        OutputFormat::Json => to_json(&view),
        OutputFormat::Table => Ok(table(
            &["Path", "SizeGB", "VHD", "LeaseId"],
            &[vec![
                view.path.clone(),
                view.size_gb.to_string(),
                if view.vhd { "Yes" } else { "No" }.to_string(),
                view.lease_id.to_string(),
            ]],
        )),
    }
}
