//! Run summaries for CLI commands.
//!
//! Standard output carries the record stream, so summaries go to stderr in
//! text or JSON form. Listings that are not record streams go to stdout.

use anyhow::Result;
use chrono::{DateTime, Utc};
use kopi_core::{DiffStats, ManifestStats, RestoreStats, ScanStats, StoreStats};
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command summaries with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
        }
    }

    /// Write a run summary to stderr.
    ///
    /// `text_fn` is called only in text mode.
    pub fn summary<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        self.emit(&mut io::stderr().lock(), data, text_fn)
    }

    /// Write a listing to stdout.
    pub fn listing<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        self.emit(&mut io::stdout().lock(), data, text_fn)
    }

    fn emit<W: Write, T: Serialize>(
        &self,
        out: &mut W,
        data: &T,
        text_fn: impl FnOnce() -> String,
    ) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string(data)?;
                writeln!(out, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(out, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error to stderr.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

/// Format a byte count with a binary unit.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct ScanOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub stats: ScanStats,
}

#[derive(Debug, Serialize)]
pub struct DiffOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub stats: DiffStats,
}

#[derive(Debug, Serialize)]
pub struct StoreOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub stats: StoreStats,
}

#[derive(Debug, Serialize)]
pub struct RestoreOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub stats: RestoreStats,
}

#[derive(Debug, Serialize)]
pub struct ManifestWriteOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub stats: ManifestStats,
}

#[derive(Debug, Serialize)]
pub struct ManifestReadOutput {
    pub success: bool,
    pub result_code: u8,
    pub date: DateTime<Utc>,
    pub description: String,
    #[serde(flatten)]
    pub stats: ManifestStats,
}

#[derive(Debug, Serialize)]
pub struct ManifestListOutput {
    pub success: bool,
    pub result_code: u8,
    pub manifests: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1023), "1023 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(10 * 1024 * 1024), "10.0 MiB");
    }

    #[test]
    fn test_flattened_summary() {
        let output = StoreOutput {
            success: true,
            result_code: 0,
            stats: StoreStats {
                files_stored: 2,
                ..StoreStats::default()
            },
        };
        let json = serde_json::to_string(&output).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"files_stored\":2"));
    }
}
