//! Message forwarding over the SMTP relay
//!
//! Loads a stored message and its attachments, records a pending forward,
//! composes the outbound message (subject prefixing, forward header block,
//! HTML-aware body insertion, verbatim attachment dispositions), delivers
//! via the authenticated implicit-TLS relay, and reconciles the record to
//! `sent` or `failed` exactly once.

use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use regex::Regex;
use secrecy::ExposeSecret;
use tracing::{info, warn};

use crate::config::MailConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{AttachmentRecord, EmailMessage, ForwardRecord, ForwardStatus};
use crate::repo::Repository;
use crate::storage::AttachmentStore;

/// Forwarding service
pub struct Forwarder {
    config: MailConfig,
    repo: Repository,
    store: AttachmentStore,
}

impl Forwarder {
    pub fn new(config: MailConfig, repo: Repository, store: AttachmentStore) -> Self {
        Self {
            config,
            repo,
            store,
        }
    }

    /// Forward a stored message
    ///
    /// # Errors
    ///
    /// - `NotFound` when the message does not exist
    /// - `Validation` for an empty recipient list or unparseable addresses
    /// - `Auth`/`Transport` for delivery failures (also recorded on the
    ///   forward record)
    pub async fn forward(
        &self,
        email_id: i64,
        to_addresses: Vec<String>,
        cc_addresses: Vec<String>,
        bcc_addresses: Vec<String>,
        additional_message: Option<String>,
    ) -> AppResult<()> {
        if to_addresses.is_empty() {
            return Err(AppError::validation("to_addresses must not be empty"));
        }

        let message = self
            .repo
            .get_message_by_id(email_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("email {email_id} does not exist")))?;
        let attachments = self.repo.get_attachments(email_id).await?;

        let record = ForwardRecord {
            id: None,
            email_id,
            to_addresses: to_addresses.clone(),
            cc_addresses: cc_addresses.clone(),
            bcc_addresses: bcc_addresses.clone(),
            additional_message: additional_message.clone(),
            status: ForwardStatus::Pending,
            error_message: None,
            forwarded_at: None,
            created_at: None,
        };
        let forward_id = self.repo.save_forward(&record).await?;

        let result = self
            .compose_and_send(
                &message,
                &attachments,
                &to_addresses,
                &cc_addresses,
                &bcc_addresses,
                additional_message.as_deref(),
            )
            .await;

        match result {
            Ok(()) => {
                self.repo
                    .update_forward_status(forward_id, ForwardStatus::Sent, None)
                    .await?;
                info!(email_id, forward_id, "message forwarded");
                Ok(())
            }
            Err(e) => {
                let error_text = e.to_string();
                if let Err(update_err) = self
                    .repo
                    .update_forward_status(forward_id, ForwardStatus::Failed, Some(&error_text))
                    .await
                {
                    warn!(forward_id, error = %update_err, "failed to record forward failure");
                }
                Err(e)
            }
        }
    }

    async fn compose_and_send(
        &self,
        original: &EmailMessage,
        attachments: &[AttachmentRecord],
        to_addresses: &[String],
        cc_addresses: &[String],
        bcc_addresses: &[String],
        additional_message: Option<&str>,
    ) -> AppResult<()> {
        let from: Mailbox = self
            .config
            .username
            .parse()
            .map_err(|e| AppError::validation(format!("invalid From address: {e}")))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(forward_subject(original.subject.as_deref().unwrap_or("")));
        for addr in to_addresses {
            builder = builder.to(parse_mailbox(addr)?);
        }
        for addr in cc_addresses {
            builder = builder.cc(parse_mailbox(addr)?);
        }
        for addr in bcc_addresses {
            builder = builder.bcc(parse_mailbox(addr)?);
        }

        let (body, is_html) = build_forward_body(original, additional_message);
        let body_part = if is_html {
            SinglePart::html(body)
        } else {
            SinglePart::plain(body)
        };

        let mut attachment_parts = Vec::new();
        for attachment in attachments {
            match self.store.read(&attachment.file_path).await {
                Ok(Some(bytes)) => attachment_parts.push(attachment_part(attachment, bytes)),
                Ok(None) => {
                    warn!(file = %attachment.file_path, "attachment file missing, skipping");
                }
                Err(e) => {
                    warn!(file = %attachment.file_path, error = %e, "failed to read attachment, skipping");
                }
            }
        }

        let outbound = if attachment_parts.is_empty() {
            builder
                .singlepart(body_part)
                .map_err(|e| AppError::Transport(format!("failed to build message: {e}")))?
        } else {
            let mut multipart = MultiPart::mixed().singlepart(body_part);
            for part in attachment_parts {
                multipart = multipart.singlepart(part);
            }
            builder
                .multipart(multipart)
                .map_err(|e| AppError::Transport(format!("failed to build message: {e}")))?
        };

        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_owned(),
        );
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.smtp_server)
            .map_err(|e| AppError::Transport(format!("SMTP relay error: {e}")))?
            .port(self.config.smtp_port)
            .credentials(creds)
            .build();

        transport.send(outbound).await.map_err(map_smtp_error)?;
        Ok(())
    }
}

fn parse_mailbox(addr: &str) -> AppResult<Mailbox> {
    addr.parse()
        .map_err(|e| AppError::validation(format!("invalid recipient '{addr}': {e}")))
}

/// Build a lettre part carrying the stored disposition and content-id
fn attachment_part(attachment: &AttachmentRecord, bytes: Vec<u8>) -> SinglePart {
    let content_type: ContentType = attachment
        .content_type
        .parse()
        .unwrap_or(ContentType::TEXT_PLAIN);
    let is_inline = attachment.content_disposition_type == "inline";
    match (&attachment.content_id, is_inline) {
        (Some(content_id), true) => Attachment::new_inline(content_id.clone()).body(bytes, content_type),
        _ => Attachment::new(attachment.original_filename.clone()).body(bytes, content_type),
    }
}

/// Map an SMTP delivery error onto the application taxonomy
fn map_smtp_error(err: lettre::transport::smtp::Error) -> AppError {
    let text = err.to_string();
    let lower = text.to_ascii_lowercase();
    if lower.contains("auth") || lower.contains("535") {
        AppError::Auth(format!("SMTP authentication failed: {text}"))
    } else {
        AppError::Transport(format!("SMTP send failed: {text}"))
    }
}

/// Prefix the subject with `Fwd: ` unless it already carries a forward marker
///
/// The prefix check is case-sensitive on `Fwd:` and `FW:`, so an existing
/// marker is never doubled but unconventional casings still get the prefix.
pub fn forward_subject(subject: &str) -> String {
    if subject.starts_with("Fwd:") || subject.starts_with("FW:") {
        subject.to_owned()
    } else {
        format!("Fwd: {subject}")
    }
}

/// The `---------- Forwarded message ----------` block
fn forward_header_block(original: &EmailMessage) -> String {
    let date = original
        .date_sent
        .map(|d| d.to_rfc2822())
        .unwrap_or_default();
    let mut header = format!(
        "---------- Forwarded message ----------\nFrom: {}\nDate: {}\nSubject: {}\nTo: {}\n",
        original.sender.as_deref().unwrap_or(""),
        date,
        original.subject.as_deref().unwrap_or(""),
        original.recipients.join(", "),
    );
    if !original.cc.is_empty() {
        header.push_str(&format!("Cc: {}\n", original.cc.join(", ")));
    }
    header
}

/// Compose the forwarded body; returns the text and whether it is HTML
///
/// An HTML original keeps its HTML with the header block inserted inside the
/// `<body>` tag; a plain original gets the additional message, the header
/// block, and the original text stacked with blank-line separators.
pub fn build_forward_body(
    original: &EmailMessage,
    additional_message: Option<&str>,
) -> (String, bool) {
    let header = forward_header_block(original);

    if let Some(html) = original.content_html.as_deref() {
        return (
            insert_html_forward_header(html, &header, additional_message),
            true,
        );
    }

    let mut parts = Vec::new();
    if let Some(additional) = additional_message {
        parts.push(additional.to_owned());
        parts.push(String::new());
    }
    parts.push(header);
    parts.push(String::new());
    if let Some(text) = original.content_text.as_deref() {
        parts.push(text.to_owned());
    }
    (parts.join("\n"), false)
}

/// Insert the forward header (and additional message) after the `<body>` tag
///
/// Without a `<body>` tag the HTML is forwarded unchanged and a warning is
/// logged; injecting markup into a fragment risks breaking its rendering.
pub fn insert_html_forward_header(
    html: &str,
    header: &str,
    additional_message: Option<&str>,
) -> String {
    let body_pattern = match Regex::new(r"(?i)<body[^>]*>") {
        Ok(re) => re,
        Err(e) => {
            warn!(error = %e, "body tag pattern failed to compile");
            return html.to_owned();
        }
    };
    let Some(found) = body_pattern.find(html) else {
        warn!("no body tag found in HTML content, skipping forward header insertion");
        return html.to_owned();
    };

    let header_html = header.replace('\n', "<br>");
    let mut insert = String::new();
    if let Some(additional) = additional_message {
        insert.push_str(&format!(
            "<div style=\"margin-bottom: 15px; padding: 10px; background-color: #e8f4f8; \
             border-radius: 5px;\"><p style=\"margin: 0; color: #2c5aa0;\">{additional}</p></div>"
        ));
    }
    insert.push_str(&format!(
        "<pre style=\"font-family: monospace; margin: 10px 0; padding: 10px; \
         background-color: #f5f5f5; border-left: 3px solid #ccc;\">{header_html}</pre>"
    ));

    let mut out = String::with_capacity(html.len() + insert.len());
    out.push_str(&html[..found.end()]);
    out.push_str(&insert);
    out.push_str(&html[found.end()..]);
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{build_forward_body, forward_subject, insert_html_forward_header};
    use crate::models::EmailMessage;

    fn original(text: Option<&str>, html: Option<&str>) -> EmailMessage {
        EmailMessage {
            id: Some(1),
            message_id: "<m@x>".to_owned(),
            subject: Some("Hello".to_owned()),
            sender: Some("alice@x.test".to_owned()),
            recipients: vec!["bob@y.test".to_owned()],
            cc: vec!["carol@y.test".to_owned()],
            bcc: Vec::new(),
            content_text: text.map(str::to_owned),
            content_html: html.map(str::to_owned),
            date_sent: None,
            date_received: Utc::now(),
            raw_headers: String::new(),
            dispatcher_id: None,
            rfq: false,
            rfq_type: None,
        }
    }

    #[test]
    fn prefixes_subject_unless_already_forwarded() {
        assert_eq!(forward_subject("Hello"), "Fwd: Hello");
        assert_eq!(forward_subject("Fwd: Hello"), "Fwd: Hello");
        assert_eq!(forward_subject("FW: Hello"), "FW: Hello");
        // Case-sensitive check: unconventional casings still get the prefix.
        assert_eq!(forward_subject("fwd: Hello"), "Fwd: fwd: Hello");
        assert_eq!(forward_subject(""), "Fwd: ");
    }

    #[test]
    fn plain_body_stacks_additional_header_and_text() {
        let (body, is_html) = build_forward_body(
            &original(Some("original text"), None),
            Some("please handle"),
        );
        assert!(!is_html);
        let additional_pos = body.find("please handle").expect("additional message present");
        let header_pos = body
            .find("---------- Forwarded message ----------")
            .expect("header block present");
        let text_pos = body.find("original text").expect("original text present");
        assert!(additional_pos < header_pos);
        assert!(header_pos < text_pos);
        assert!(body.contains("From: alice@x.test"));
        assert!(body.contains("To: bob@y.test"));
        assert!(body.contains("Cc: carol@y.test"));
    }

    #[test]
    fn html_body_gets_header_inside_body_tag() {
        let html = "<html><BODY bgcolor=\"#fff\"><p>original</p></body></html>";
        let (body, is_html) = build_forward_body(&original(None, Some(html)), None);
        assert!(is_html);
        let body_tag_end = body.find('>').and_then(|_| body.find("<p>original</p>"));
        assert!(body_tag_end.is_some());
        let header_pos = body.find("Forwarded message").expect("header inserted");
        let original_pos = body.find("<p>original</p>").expect("original kept");
        assert!(header_pos < original_pos);
        assert!(body.starts_with("<html><BODY bgcolor=\"#fff\">"));
    }

    #[test]
    fn html_without_body_tag_is_forwarded_unchanged() {
        let html = "<div>fragment only</div>";
        let out = insert_html_forward_header(html, "header", None);
        assert_eq!(out, html);
    }

    #[test]
    fn additional_message_precedes_header_in_html() {
        let html = "<body><p>x</p></body>";
        let out = insert_html_forward_header(html, "From: a@x", Some("note for you"));
        let note_pos = out.find("note for you").expect("note inserted");
        let header_pos = out.find("From: a@x").expect("header inserted");
        assert!(note_pos < header_pos);
    }
}
