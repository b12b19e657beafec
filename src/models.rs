//! Domain records and HTTP DTOs
//!
//! Defines the persisted entity shapes (messages, attachments, forward
//! records) and the request/response types used by the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored email message
///
/// `message_id` is the upstream-unique identity; `id` is assigned on insert.
/// Address lists are persisted as JSON text columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Row id, assigned on insert
    pub id: Option<i64>,
    /// Upstream-unique Message-ID header value
    pub message_id: String,
    /// Decoded, whitespace-normalized subject
    pub subject: Option<String>,
    /// Bare sender address
    pub sender: Option<String>,
    /// Bare recipient addresses, in header order
    pub recipients: Vec<String>,
    /// Bare Cc addresses
    pub cc: Vec<String>,
    /// Bare Bcc addresses
    pub bcc: Vec<String>,
    /// Accumulated text/plain body
    pub content_text: Option<String>,
    /// Accumulated text/html body
    pub content_html: Option<String>,
    /// Parsed Date header, when parseable
    pub date_sent: Option<DateTime<Utc>>,
    /// Ingestion wall-clock time
    pub date_received: DateTime<Utc>,
    /// All top-level headers as `Key: value` lines
    pub raw_headers: String,
    /// Assigned handler, set only by rule actions
    pub dispatcher_id: Option<i64>,
    /// Request-for-quote classification
    pub rfq: bool,
    /// Post-processor kind when `rfq` is set (e.g. `ShipServ`)
    pub rfq_type: Option<String>,
}

/// A stored attachment owned by exactly one message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: Option<i64>,
    /// Parent message row id; set during the save transaction
    pub email_id: i64,
    /// Decoded filename as carried by the message
    pub original_filename: String,
    /// Generated on-disk name (`YYYYMMDDHHMM_<uid>_<uuid><ext>`)
    pub stored_filename: String,
    /// Absolute path of the stored file
    pub file_path: String,
    /// Byte length written to disk
    pub file_size: i64,
    pub content_type: String,
    /// Disposition type only (`attachment`, `inline`, ...), parameters stripped
    pub content_disposition_type: String,
    /// Content-ID without angle brackets, for inline references
    pub content_id: Option<String>,
    /// Structured post-processor output, when any
    pub extra: Option<serde_json::Value>,
}

/// Forward record lifecycle state
///
/// Transitions are monotonic: `Pending → Sent` or `Pending → Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    Pending,
    Sent,
    Failed,
}

impl ForwardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One forward attempt for a stored message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRecord {
    pub id: Option<i64>,
    pub email_id: i64,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub bcc_addresses: Vec<String>,
    pub additional_message: Option<String>,
    pub status: ForwardStatus,
    /// Non-empty exactly when `status` is `Failed`
    pub error_message: Option<String>,
    pub forwarded_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Per-run ingestion counters
///
/// Every processed UID lands in exactly one of `new_emails`,
/// `duplicates_skipped`, `rule_skipped`, or `errors`, so
/// `total_processed` always equals their sum.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub total_processed: u64,
    pub new_emails: u64,
    pub duplicates_skipped: u64,
    pub rule_skipped: u64,
    pub errors: u64,
    pub last_message_id: Option<String>,
    pub sync_time: Option<DateTime<Utc>>,
}

/// Aggregate repository counts surfaced by `/sync/status`
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_emails: i64,
    pub total_attachments: i64,
    pub today_emails: i64,
    pub latest_email_time: Option<DateTime<Utc>>,
}

/// Body of `POST /emails/{email_id}/forward`
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardRequest {
    pub to_addresses: Vec<String>,
    #[serde(default)]
    pub cc_addresses: Vec<String>,
    #[serde(default)]
    pub bcc_addresses: Vec<String>,
    pub additional_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::ForwardStatus;

    #[test]
    fn forward_status_round_trips_through_strings() {
        for status in [
            ForwardStatus::Pending,
            ForwardStatus::Sent,
            ForwardStatus::Failed,
        ] {
            assert_eq!(ForwardStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn forward_status_rejects_unknown_values() {
        assert_eq!(ForwardStatus::parse("queued"), None);
        assert_eq!(ForwardStatus::parse(""), None);
    }
}
