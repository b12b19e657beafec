//! Attachment post-processors for request-for-quote messages
//!
//! A registry of extractors keyed by RFQ kind. Each processor classifies
//! messages (the first match tags the message with its kind) and extracts a
//! structured `extra` blob from matching attachments. Extraction failures
//! are logged by the caller and never block persistence.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::mime::CanonicalMessage;

/// Largest PDF the extractor will attempt, matching the fetch-side cap
const MAX_PDF_BYTES: u64 = 5_000_000;

/// One attachment-typed extractor
pub trait RfqProcessor: Send + Sync {
    /// Kind tag stored in `rfq_type` and used for dispatch
    fn kind(&self) -> &'static str;

    /// Whether this processor's supplier sent the message
    fn classify(&self, message: &CanonicalMessage) -> bool;

    /// Extract structured data from a stored attachment
    ///
    /// `Ok(None)` means the attachment is not this processor's format
    /// (wrong extension, no recognizable content) and is persisted without
    /// an `extra` blob.
    fn process(&self, file_path: &str) -> AppResult<Option<Value>>;
}

/// Registry of all known processors
#[derive(Clone)]
pub struct ProcessorRegistry {
    processors: Vec<Arc<dyn RfqProcessor>>,
}

impl ProcessorRegistry {
    pub fn new(processors: Vec<Arc<dyn RfqProcessor>>) -> Self {
        Self { processors }
    }

    /// Registry with the built-in processors
    pub fn with_defaults() -> Self {
        Self::new(vec![Arc::new(ShipServProcessor)])
    }

    /// Classify a message; the first matching processor's kind wins
    pub fn classify(&self, message: &CanonicalMessage) -> Option<&'static str> {
        self.processors
            .iter()
            .find(|p| p.classify(message))
            .map(|p| p.kind())
    }

    /// Look up a processor by kind
    pub fn find(&self, kind: &str) -> Option<Arc<dyn RfqProcessor>> {
        self.processors.iter().find(|p| p.kind() == kind).cloned()
    }
}

/// Extractor for ShipServ request-for-quote PDFs
///
/// Reconstructs the quote's header metadata, line sections, and item table
/// from the PDF text layer.
pub struct ShipServProcessor;

impl RfqProcessor for ShipServProcessor {
    fn kind(&self) -> &'static str {
        "ShipServ"
    }

    fn classify(&self, message: &CanonicalMessage) -> bool {
        message
            .sender
            .as_deref()
            .is_some_and(|s| s.to_ascii_lowercase().contains("shipserv"))
    }

    fn process(&self, file_path: &str) -> AppResult<Option<Value>> {
        if !file_path.to_ascii_lowercase().ends_with(".pdf") {
            return Ok(None);
        }
        let size = std::fs::metadata(Path::new(file_path))
            .map_err(|e| AppError::Storage(format!("cannot stat {file_path}: {e}")))?
            .len();
        if size > MAX_PDF_BYTES {
            warn!(path = file_path, size, "PDF exceeds extraction size cap");
            return Ok(None);
        }

        let text = pdf_extract::extract_text(Path::new(file_path))
            .map_err(|e| AppError::Parse(format!("PDF text extraction failed: {e}")))?;
        let meta_data = parse_meta_block(&text);
        let section_data = parse_sections(&text);
        let table_data = parse_table_rows(&text);
        if meta_data.is_empty() && section_data.is_empty() && table_data.is_empty() {
            debug!(path = file_path, "no recognizable quote structure in PDF");
            return Ok(None);
        }

        Ok(Some(json!({
            "type": "ShipServ",
            "version": 2,
            "table_data": table_data,
            "section_data": section_data,
            "meta_data": meta_data,
        })))
    }
}

/// Key-value pairs from the header block (everything before the first blank
/// line that follows a `Subject:` line)
fn parse_meta_block(text: &str) -> BTreeMap<String, String> {
    let mut meta = BTreeMap::new();
    let mut in_header = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Subject:") {
            in_header = true;
        }
        if in_header && trimmed.is_empty() {
            break;
        }
        if let Some((key, value)) = split_key_value(trimmed) {
            meta.insert(key, value);
        }
        if !in_header && meta.len() >= 16 {
            break;
        }
    }
    meta
}

/// Key-value blocks separated by blank lines, after the header
fn parse_sections(text: &str) -> Vec<BTreeMap<String, String>> {
    let mut sections = Vec::new();
    let mut current: BTreeMap<String, String> = BTreeMap::new();
    let mut past_header = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            past_header = true;
            if !current.is_empty() {
                sections.push(std::mem::take(&mut current));
            }
            continue;
        }
        if !past_header {
            continue;
        }
        if let Some((key, value)) = split_key_value(trimmed) {
            current.insert(key, value);
        }
    }
    if !current.is_empty() {
        sections.push(current);
    }
    sections
}

/// Tabular rows: lines with three or more columns separated by runs of
/// two-plus spaces
fn parse_table_rows(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .filter_map(|line| {
            let columns: Vec<String> = line
                .split("  ")
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_owned)
                .collect();
            if columns.len() >= 3 { Some(columns) } else { None }
        })
        .collect()
}

/// Split a `Key: value` line; keys longer than 40 chars are body text, not
/// field labels
fn split_key_value(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() || key.len() > 40 || value.is_empty() {
        return None;
    }
    Some((key.to_owned(), value.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::{
        ProcessorRegistry, RfqProcessor, ShipServProcessor, parse_meta_block, parse_sections,
        parse_table_rows, split_key_value,
    };
    use crate::mime::CanonicalMessage;

    fn message_from(sender: &str) -> CanonicalMessage {
        CanonicalMessage {
            sender: Some(sender.to_owned()),
            ..CanonicalMessage::default()
        }
    }

    #[test]
    fn classifies_shipserv_senders() {
        let registry = ProcessorRegistry::with_defaults();
        assert_eq!(
            registry.classify(&message_from("rfq@pages.shipserv.com")),
            Some("ShipServ")
        );
        assert_eq!(registry.classify(&message_from("buyer@acme.test")), None);
    }

    #[test]
    fn finds_processor_by_kind() {
        let registry = ProcessorRegistry::with_defaults();
        assert!(registry.find("ShipServ").is_some());
        assert!(registry.find("Unknown").is_none());
    }

    #[test]
    fn non_pdf_paths_yield_nothing() {
        let result = ShipServProcessor.process("/tmp/quote.xlsx").expect("must not error");
        assert!(result.is_none());
    }

    #[test]
    fn split_key_value_rejects_prose_lines() {
        assert_eq!(
            split_key_value("Vessel: MV Northern Star"),
            Some(("Vessel".to_owned(), "MV Northern Star".to_owned()))
        );
        assert_eq!(split_key_value("no separator here"), None);
        assert_eq!(split_key_value("Key:"), None);
    }

    #[test]
    fn parses_meta_sections_and_table_from_text() {
        let text = concat!(
            "Subject: RFQ 4711\n",
            "Vessel: MV Northern Star\n",
            "\n",
            "Port: Rotterdam\n",
            "ETA: 2025-03-12\n",
            "\n",
            "1  Fuel filter  12  pcs\n",
            "2  Gasket set  4  pcs\n"
        );
        let meta = parse_meta_block(text);
        assert_eq!(meta.get("Subject").map(String::as_str), Some("RFQ 4711"));
        assert_eq!(meta.get("Vessel").map(String::as_str), Some("MV Northern Star"));

        let sections = parse_sections(text);
        assert!(sections.iter().any(|s| s.get("Port").map(String::as_str) == Some("Rotterdam")));

        let table = parse_table_rows(text);
        assert_eq!(table.len(), 2);
        assert_eq!(table[0], vec!["1", "Fuel filter", "12", "pcs"]);
    }
}
