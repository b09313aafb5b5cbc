use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::types::Credential;
use tavreg_core::RegisterError;

/// Durable destination for a harvested credential. One append per
/// successful run.
pub trait CredentialSink: Send + Sync {
    fn append(&self, credential: &Credential) -> Result<(), RegisterError>;
}

/// Appends credentials to a UTF-8 CSV file. The file gets a BOM and a
/// header row when first created, so spreadsheet tools open non-ASCII
/// content correctly.
pub struct CsvSink {
    path: PathBuf,
}

const HEADER: &str = "email,password,api_key,created_at";

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialSink for CsvSink {
    fn append(&self, credential: &Credential) -> Result<(), RegisterError> {
        let exists = self.path.exists();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| RegisterError::Sink(e.to_string()))?;

        if !exists {
            file.write_all(b"\xEF\xBB\xBF")
                .map_err(|e| RegisterError::Sink(e.to_string()))?;
            writeln!(file, "{}", HEADER).map_err(|e| RegisterError::Sink(e.to_string()))?;
        }

        writeln!(
            file,
            "{},{},{},{}",
            quote(&credential.email),
            quote(&credential.password),
            quote(&credential.api_key),
            quote(&credential.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        )
        .map_err(|e| RegisterError::Sink(e.to_string()))?;

        info!(path = %self.path.display(), email = %credential.email, "credential persisted");
        Ok(())
    }
}

/// Minimal CSV quoting: wrap in quotes when the field contains a comma,
/// quote or newline; double embedded quotes.
fn quote(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
