//! Message canonicalization and MIME handling
//!
//! Decodes raw RFC822 bytes into a [`CanonicalMessage`] using `mailparse`:
//! cleaned subject and Message-ID, bare address lists, accumulated text/HTML
//! bodies, and attachment parts with decoded filenames. A malformed part is
//! skipped with a warning; only a message that fails top-level parsing is an
//! error.

use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use tracing::warn;

use crate::errors::{AppError, AppResult};

/// One decoded attachment part, prior to persistence
#[derive(Debug, Clone)]
pub struct AttachmentPart {
    /// Decoded filename (encoded-word, RFC 2231, or percent-decoded)
    pub filename: String,
    /// Decoded content bytes
    pub content: Vec<u8>,
    /// MIME content type (e.g. `application/pdf`)
    pub content_type: String,
    /// Disposition type only, parameters stripped; empty when the part
    /// carried no Content-Disposition header
    pub content_disposition_type: String,
    /// Content-ID without angle brackets
    pub content_id: Option<String>,
}

/// The canonical in-memory representation of one message
///
/// This is what the rule engine evaluates and the pipeline persists.
#[derive(Debug, Clone, Default)]
pub struct CanonicalMessage {
    /// Cleaned Message-ID; `None` when the header is absent or empty
    pub message_id: Option<String>,
    /// Decoded, whitespace-collapsed subject
    pub subject: String,
    /// Bare sender address from the From header
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// All text/plain leaf parts, concatenated in tree order
    pub content_text: String,
    /// All text/html leaf parts, concatenated in tree order
    pub content_html: String,
    /// Parsed Date header
    pub date_sent: Option<DateTime<Utc>>,
    /// Top-level headers as `Key: value` lines
    pub raw_headers: String,
    pub attachments: Vec<AttachmentPart>,
}

/// Parse raw message bytes into the canonical record
///
/// # Errors
///
/// `Parse` when the message cannot be parsed at all. Individual bad parts
/// never fail the whole message.
pub fn parse_canonical(raw: &[u8]) -> AppResult<CanonicalMessage> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Parse(format!("failed to parse RFC822 message: {e}")))?;

    let mut message = CanonicalMessage {
        message_id: non_empty(clean_header_text(
            &parsed.headers.get_first_value("Message-ID").unwrap_or_default(),
        )),
        subject: clean_header_text(&parsed.headers.get_first_value("Subject").unwrap_or_default()),
        sender: parse_address_list(&parsed.headers.get_first_value("From").unwrap_or_default())
            .into_iter()
            .next(),
        recipients: parse_address_list(&parsed.headers.get_first_value("To").unwrap_or_default()),
        cc: parse_address_list(&parsed.headers.get_first_value("Cc").unwrap_or_default()),
        bcc: parse_address_list(&parsed.headers.get_first_value("Bcc").unwrap_or_default()),
        date_sent: parse_date(&parsed.headers.get_first_value("Date").unwrap_or_default()),
        raw_headers: join_raw_headers(&parsed),
        ..CanonicalMessage::default()
    };

    walk_parts(&parsed, &mut message);
    Ok(message)
}

/// Walk the MIME part tree, routing leaves to bodies or attachments
///
/// A leaf is an attachment when its disposition is `attachment` or it carries
/// any filename; otherwise text/plain and text/html payloads accumulate into
/// the respective body fields.
fn walk_parts(part: &ParsedMail<'_>, message: &mut CanonicalMessage) {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disp = part.get_content_disposition();
        let filename = raw_filename(part);
        let is_attachment = disp.disposition == DispositionType::Attachment || filename.is_some();

        if !is_attachment {
            match ctype.as_str() {
                "text/plain" => match part.get_body() {
                    Ok(text) => message.content_text.push_str(&text),
                    Err(e) => warn!(error = %e, "skipping undecodable text part"),
                },
                "text/html" => match part.get_body() {
                    Ok(html) => message.content_html.push_str(&html),
                    Err(e) => warn!(error = %e, "skipping undecodable html part"),
                },
                _ => {}
            }
            return;
        }

        let filename = decode_filename(&filename.unwrap_or_default());
        let content = match part.get_body_raw() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(filename = %filename, error = %e, "skipping undecodable attachment part");
                return;
            }
        };
        if content.is_empty() {
            warn!(filename = %filename, "dropping attachment with empty content");
            return;
        }

        let content_id = part
            .get_headers()
            .get_first_value("Content-ID")
            .map(|v| v.trim().trim_matches(|c| c == '<' || c == '>').to_owned());

        message.attachments.push(AttachmentPart {
            filename,
            content,
            content_type: ctype,
            content_disposition_type: disposition_type_of(part),
            content_id,
        });
        return;
    }

    for sub in &part.subparts {
        walk_parts(sub, message);
    }
}

/// Filename as carried by the part, undecoded
///
/// Checks the Content-Disposition `filename` parameter first, then the
/// Content-Type `name` parameter.
fn raw_filename(part: &ParsedMail<'_>) -> Option<String> {
    let disp = part.get_content_disposition();
    disp.params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

/// Disposition type only (`attachment`, `inline`, ...), lowercased
///
/// Empty string when the part carries no Content-Disposition header at all,
/// matching how the value is persisted.
fn disposition_type_of(part: &ParsedMail<'_>) -> String {
    if part
        .get_headers()
        .get_first_value("Content-Disposition")
        .is_none()
    {
        return String::new();
    }
    match part.get_content_disposition().disposition {
        DispositionType::Inline => "inline".to_owned(),
        DispositionType::Attachment => "attachment".to_owned(),
        DispositionType::FormData => "form-data".to_owned(),
        DispositionType::Extension(ext) => ext.to_ascii_lowercase(),
    }
}

/// Decode an attachment filename
///
/// Tries, in order: encoded-word decode, RFC 2231 charset decode,
/// percent-decode when a `%` is present, then the value verbatim.
pub fn decode_filename(filename: &str) -> String {
    if filename.is_empty() {
        return String::new();
    }

    if filename.contains("=?") {
        let decoded = decode_encoded_words(filename);
        if decoded != filename {
            return decoded;
        }
    }

    if let Some(decoded) = decode_rfc2231(filename) {
        return decoded;
    }

    if filename.contains('%') {
        let bytes = urlencoding::decode_binary(filename.as_bytes());
        let decoded = String::from_utf8_lossy(&bytes).into_owned();
        if decoded != filename {
            return decoded;
        }
    }

    filename.to_owned()
}

/// Decode RFC 2047 encoded words by round-tripping through a header parse
fn decode_encoded_words(value: &str) -> String {
    let synthetic = format!("X-Filename: {value}");
    match mailparse::parse_header(synthetic.as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(_) => value.to_owned(),
    }
}

/// Decode the RFC 2231 `charset'lang'percent-escapes` parameter form
///
/// The declared charset is honored as UTF-8 with lossy replacement, the
/// fallback the rest of the decode chain uses.
fn decode_rfc2231(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?;
    let _lang = parts.next()?;
    let encoded = parts.next()?;
    if charset.is_empty() || charset.contains(' ') || !encoded.contains('%') {
        return None;
    }
    let bytes = urlencoding::decode_binary(encoded.as_bytes());
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Collapse internal whitespace/CRLF runs to single spaces and trim
///
/// The header decoder leaves folding artifacts in long Subject and
/// Message-ID values; storage and rule matching want one clean line.
pub fn clean_header_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse an address header into bare email addresses
///
/// Display names are discarded; group syntax is flattened. An unparseable
/// header yields an empty list.
pub fn parse_address_list(header_value: &str) -> Vec<String> {
    if header_value.trim().is_empty() {
        return Vec::new();
    }
    match mailparse::addrparse(header_value) {
        Ok(list) => {
            let mut out = Vec::new();
            for addr in list.iter() {
                match addr {
                    MailAddr::Single(info) => out.push(info.addr.clone()),
                    MailAddr::Group(group) => {
                        out.extend(group.addrs.iter().map(|a| a.addr.clone()));
                    }
                }
            }
            out
        }
        Err(e) => {
            warn!(header = %header_value, error = %e, "failed to parse address header");
            Vec::new()
        }
    }
}

/// Parse an RFC822 date header; unparseable dates yield `None`
fn parse_date(header_value: &str) -> Option<DateTime<Utc>> {
    if header_value.trim().is_empty() {
        return None;
    }
    match mailparse::dateparse(header_value) {
        Ok(epoch) => DateTime::<Utc>::from_timestamp(epoch, 0),
        Err(e) => {
            warn!(header = %header_value, error = %e, "failed to parse date header");
            None
        }
    }
}

/// Join top-level headers into `Key: value` lines
fn join_raw_headers(parsed: &ParsedMail<'_>) -> String {
    parsed
        .headers
        .iter()
        .map(|h| format!("{}: {}", h.get_key(), h.get_value()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::{clean_header_text, decode_filename, parse_address_list, parse_canonical};

    #[test]
    fn parses_simple_plain_text_message() {
        let raw = b"From: Alice <alice@example.com>\r\nTo: bob@example.com\r\nSubject: Hi\r\nMessage-ID: <a@x>\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\nHello there";
        let msg = parse_canonical(raw).expect("parse should succeed");

        assert_eq!(msg.message_id.as_deref(), Some("<a@x>"));
        assert_eq!(msg.subject, "Hi");
        assert_eq!(msg.sender.as_deref(), Some("alice@example.com"));
        assert_eq!(msg.recipients, vec!["bob@example.com".to_owned()]);
        assert_eq!(msg.content_text, "Hello there");
        assert!(msg.date_sent.is_some());
        assert!(msg.attachments.is_empty());
        assert!(msg.raw_headers.contains("Subject: Hi"));
    }

    #[test]
    fn decodes_encoded_word_subject() {
        let raw = b"From: a@x\r\nSubject: =?utf-8?Q?Caf=C3=A9_menu?=\r\n\r\nbody";
        let msg = parse_canonical(raw).expect("parse should succeed");
        assert_eq!(msg.subject, "Caf\u{e9} menu");
    }

    #[test]
    fn accumulates_multiple_text_parts() {
        let raw = concat!(
            "From: a@x\r\n",
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n\r\n",
            "--b\r\nContent-Type: text/plain\r\n\r\nfirst\r\n",
            "--b\r\nContent-Type: text/plain\r\n\r\nsecond\r\n",
            "--b--\r\n"
        );
        let msg = parse_canonical(raw.as_bytes()).expect("parse should succeed");
        assert!(msg.content_text.contains("first"));
        assert!(msg.content_text.contains("second"));
    }

    #[test]
    fn routes_named_part_to_attachments() {
        let raw = concat!(
            "From: a@x\r\n",
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n\r\n",
            "--b\r\nContent-Type: text/plain\r\n\r\nbody text\r\n",
            "--b\r\nContent-Type: application/pdf; name=\"order.pdf\"\r\n",
            "Content-Disposition: attachment; filename=\"order.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n\r\n",
            "JVBERi0xLjQ=\r\n",
            "--b--\r\n"
        );
        let msg = parse_canonical(raw.as_bytes()).expect("parse should succeed");
        assert_eq!(msg.attachments.len(), 1);
        let att = &msg.attachments[0];
        assert_eq!(att.filename, "order.pdf");
        assert_eq!(att.content_type, "application/pdf");
        assert_eq!(att.content_disposition_type, "attachment");
        assert_eq!(att.content, b"%PDF-1.4");
        assert_eq!(msg.content_text.trim(), "body text");
    }

    #[test]
    fn drops_attachment_with_empty_content() {
        let raw = concat!(
            "From: a@x\r\n",
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n\r\n",
            "--b\r\nContent-Type: application/octet-stream\r\n",
            "Content-Disposition: attachment; filename=\"empty.bin\"\r\n\r\n",
            "\r\n",
            "--b--\r\n"
        );
        let msg = parse_canonical(raw.as_bytes()).expect("parse should succeed");
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn strips_angle_brackets_from_content_id() {
        let raw = concat!(
            "From: a@x\r\n",
            "Content-Type: multipart/related; boundary=\"b\"\r\n\r\n",
            "--b\r\nContent-Type: image/png; name=\"logo.png\"\r\n",
            "Content-ID: <logo@inline>\r\n",
            "Content-Disposition: inline; filename=\"logo.png\"\r\n\r\n",
            "pngbytes\r\n",
            "--b--\r\n"
        );
        let msg = parse_canonical(raw.as_bytes()).expect("parse should succeed");
        assert_eq!(msg.attachments[0].content_id.as_deref(), Some("logo@inline"));
        assert_eq!(msg.attachments[0].content_disposition_type, "inline");
    }

    #[test]
    fn clean_header_text_collapses_folding_whitespace() {
        assert_eq!(clean_header_text("  a\r\n  long\tsubject  "), "a long subject");
        assert_eq!(clean_header_text(""), "");
    }

    #[test]
    fn parses_addresses_discarding_display_names() {
        let addrs = parse_address_list("\"Li, Wei\" <wei@example.cn>, ops@example.com");
        assert_eq!(addrs, vec!["wei@example.cn".to_owned(), "ops@example.com".to_owned()]);
        assert!(parse_address_list("").is_empty());
    }

    #[test]
    fn decode_filename_handles_each_fallback() {
        assert_eq!(decode_filename("=?utf-8?Q?r=C3=A9sum=C3=A9.pdf?="), "r\u{e9}sum\u{e9}.pdf");
        assert_eq!(decode_filename("utf-8''%E6%8A%A5%E4%BB%B7.pdf"), "\u{62a5}\u{4ef7}.pdf");
        assert_eq!(decode_filename("my%20file.txt"), "my file.txt");
        assert_eq!(decode_filename("plain.txt"), "plain.txt");
        assert_eq!(decode_filename(""), "");
    }

    #[test]
    fn unparseable_date_is_none() {
        let raw = b"From: a@x\r\nDate: not a date\r\n\r\nbody";
        let msg = parse_canonical(raw).expect("parse should succeed");
        assert!(msg.date_sent.is_none());
    }
}
