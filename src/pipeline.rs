//! Ingestion pipeline
//!
//! Orchestrates one sync run: connect to the mailbox, search for pending
//! UIDs, canonicalize each message, deduplicate, apply rules, persist
//! attachments and the message transactionally, and reconcile the upstream
//! processed flag. The upstream flag clears if and only if the message was
//! handled (stored, duplicate, or rule-skipped); any failure leaves it set
//! so the next tick retries.
//!
//! Counter discipline: every processed UID lands in exactly one of
//! `new_emails`, `duplicates_skipped`, `rule_skipped`, or `errors`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::config::MailConfig;
use crate::errors::{AppError, AppResult};
use crate::extract::ProcessorRegistry;
use crate::imap::{MailboxClient, PRIMARY_FOLDER};
use crate::mime::{AttachmentPart, CanonicalMessage, parse_canonical};
use crate::models::{AttachmentRecord, DatabaseStats, EmailMessage, SyncStats};
use crate::repo::Repository;
use crate::rules::{EffectSet, MutableField, RuleEngine};
use crate::storage::AttachmentStore;

/// Result of a sync request
#[derive(Debug)]
pub enum SyncOutcome {
    /// A run was already in flight; nothing was done
    Busy,
    /// The run completed (possibly with per-message errors counted)
    Completed(SyncStats),
}

/// Snapshot returned by `/sync/status`
#[derive(Debug, Serialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_stats: SyncStats,
    pub database_stats: Option<DatabaseStats>,
}

/// Releases the single-writer gate even when a run errors out
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The ingestion service
///
/// One instance per process, shared behind `Arc`. The `is_syncing` flag is
/// the only cross-task lock; all per-message state lives on the task stack.
pub struct SyncService {
    mail_config: MailConfig,
    repo: Repository,
    store: AttachmentStore,
    engine: RuleEngine,
    registry: ProcessorRegistry,
    is_syncing: AtomicBool,
    last_sync_time: RwLock<Option<DateTime<Utc>>>,
    last_stats: RwLock<SyncStats>,
}

impl SyncService {
    pub fn new(
        mail_config: MailConfig,
        repo: Repository,
        store: AttachmentStore,
        registry: ProcessorRegistry,
    ) -> Self {
        let engine = RuleEngine::new(repo.clone());
        Self {
            mail_config,
            repo,
            store,
            engine,
            registry,
            is_syncing: AtomicBool::new(false),
            last_sync_time: RwLock::new(None),
            last_stats: RwLock::new(SyncStats::default()),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Run one sync, guarded so at most one run is in flight
    ///
    /// A second caller observing the gate busy gets `SyncOutcome::Busy`
    /// immediately; it is never queued.
    pub async fn sync(
        &self,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<SyncOutcome> {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("sync already in progress, skipping this trigger");
            return Ok(SyncOutcome::Busy);
        }
        let _guard = SyncGuard(&self.is_syncing);

        let sync_start = Utc::now();
        let result = self.run_sync(limit, since, sync_start).await;
        match result {
            Ok(stats) => {
                *self.last_sync_time.write().await = Some(sync_start);
                *self.last_stats.write().await = stats.clone();
                Ok(SyncOutcome::Completed(stats))
            }
            Err(e) => {
                error!(error = %e, "sync run failed");
                Err(e)
            }
        }
    }

    async fn run_sync(
        &self,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
        sync_start: DateTime<Utc>,
    ) -> AppResult<SyncStats> {
        info!("starting mail sync");
        let mut stats = SyncStats {
            sync_time: Some(sync_start),
            ..SyncStats::default()
        };

        let mut client = MailboxClient::new(self.mail_config.clone());
        client.connect().await?;
        client.select_folder(PRIMARY_FOLDER).await?;

        let uids = client.search_pending(since, limit).await?;
        info!(count = uids.len(), "pending messages found");
        if uids.is_empty() {
            client.disconnect().await;
            return Ok(stats);
        }

        for (index, uid) in uids.iter().enumerate() {
            debug!(uid, position = index + 1, total = uids.len(), "processing message");
            if let Err(e) = self.process_single(&mut client, *uid, &mut stats).await {
                error!(uid, error = %e, "failed to process message");
                stats.errors += 1;
            }
            if (index + 1) % 10 == 0 {
                info!(processed = index + 1, total = uids.len(), "sync progress");
            }
        }

        client.disconnect().await;
        let duration = (Utc::now() - sync_start).num_milliseconds();
        info!(
            duration_ms = duration,
            total = stats.total_processed,
            new = stats.new_emails,
            duplicates = stats.duplicates_skipped,
            rule_skipped = stats.rule_skipped,
            errors = stats.errors,
            "mail sync finished"
        );
        Ok(stats)
    }

    /// Process one UID
    ///
    /// Outcomes other than an error increment their counter here and clear
    /// the upstream flag; an `Err` return leaves the flag set and the caller
    /// counts it.
    async fn process_single(
        &self,
        client: &mut MailboxClient,
        uid: u32,
        stats: &mut SyncStats,
    ) -> AppResult<()> {
        stats.total_processed += 1;

        let (_flags, raw) = client.fetch_raw(uid).await?;
        let canonical = parse_canonical(&raw)?;
        let date_received = Utc::now();

        let Some(message_id) = canonical.message_id.clone() else {
            warn!(uid, "message has no Message-ID, leaving flag set");
            return Err(AppError::Parse(format!("uid {uid} has no Message-ID")));
        };

        if self.repo.exists_message(&message_id).await? {
            debug!(uid, message_id = %message_id, "duplicate message");
            stats.duplicates_skipped += 1;
            clear_flag_logged(client, uid).await;
            return Ok(());
        }

        let effects = self.engine.apply(&canonical).await;
        for err in &effects.errors {
            warn!(uid, error = %err, "rule action error");
        }
        if effects.should_skip {
            info!(
                uid,
                message_id = %message_id,
                matched = ?effects.matched_rules,
                reason = effects.skip_reason.as_deref().unwrap_or(""),
                "message skipped by rule"
            );
            stats.rule_skipped += 1;
            clear_flag_logged(client, uid).await;
            return Ok(());
        }

        let mut message = build_message(&canonical, message_id.clone(), date_received);
        apply_effects(&mut message, &effects);
        if let Some(kind) = self.registry.classify(&canonical) {
            debug!(uid, kind, "message classified as RFQ");
            message.rfq = true;
            message.rfq_type = Some(kind.to_owned());
        }

        let mut attachments = self
            .persist_attachment_files(uid, date_received, &canonical.attachments)
            .await;
        if message.rfq {
            self.run_post_processors(&message, &mut attachments).await;
        }

        let (email_id, attachment_ids) = self
            .repo
            .save_message_with_attachments(&message, &attachments)
            .await?;

        stats.new_emails += 1;
        stats.last_message_id = Some(message_id.clone());
        clear_flag_logged(client, uid).await;
        debug!(uid, email_id, attachments = attachment_ids.len(), "message ingested");
        Ok(())
    }

    /// Write attachment bytes to the store
    ///
    /// A failed write logs a warning and drops that attachment only; the
    /// rest of the message proceeds.
    async fn persist_attachment_files(
        &self,
        uid: u32,
        date_received: DateTime<Utc>,
        parts: &[AttachmentPart],
    ) -> Vec<AttachmentRecord> {
        let mut records = Vec::with_capacity(parts.len());
        for part in parts {
            let saved = match self
                .store
                .save(
                    &uid.to_string(),
                    &part.filename,
                    part.content.clone(),
                    Some(date_received),
                )
                .await
            {
                Ok(saved) => saved,
                Err(e) => {
                    warn!(uid, filename = %part.filename, error = %e, "failed to store attachment");
                    continue;
                }
            };
            records.push(AttachmentRecord {
                id: None,
                email_id: 0,
                original_filename: part.filename.clone(),
                stored_filename: saved.stored_filename,
                file_path: saved.file_path,
                file_size: saved.file_size,
                content_type: part.content_type.clone(),
                content_disposition_type: part.content_disposition_type.clone(),
                content_id: part.content_id.clone(),
                extra: None,
            });
        }
        records
    }

    /// Run the matching post-processor over each stored attachment
    ///
    /// Extraction runs in `spawn_blocking` (PDF parsing is CPU work). A
    /// failure logs and leaves that attachment without an `extra` blob.
    async fn run_post_processors(
        &self,
        message: &EmailMessage,
        attachments: &mut [AttachmentRecord],
    ) {
        let Some(kind) = message.rfq_type.as_deref() else {
            return;
        };
        let Some(processor) = self.registry.find(kind) else {
            warn!(kind, "no post-processor registered for RFQ kind");
            return;
        };

        for attachment in attachments.iter_mut() {
            let path = attachment.file_path.clone();
            let processor = Arc::clone(&processor);
            let extracted = task::spawn_blocking(move || processor.process(&path)).await;
            match extracted {
                Ok(Ok(Some(extra))) => {
                    debug!(file = %attachment.stored_filename, kind, "post-processor extracted data");
                    attachment.extra = Some(extra);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!(file = %attachment.stored_filename, error = %e, "post-processor failed");
                }
                Err(e) => {
                    warn!(file = %attachment.stored_filename, error = %e, "post-processor task failed");
                }
            }
        }
    }

    /// Status snapshot for the HTTP surface
    pub async fn status(&self) -> SyncStatus {
        let database_stats = match self.repo.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "failed to load database stats");
                None
            }
        };
        SyncStatus {
            is_syncing: self.is_syncing(),
            last_sync_time: *self.last_sync_time.read().await,
            last_sync_stats: self.last_stats.read().await.clone(),
            database_stats,
        }
    }
}

/// Build the storable message from the canonical record
fn build_message(
    canonical: &CanonicalMessage,
    message_id: String,
    date_received: DateTime<Utc>,
) -> EmailMessage {
    EmailMessage {
        id: None,
        message_id,
        subject: non_empty(&canonical.subject),
        sender: canonical.sender.clone(),
        recipients: canonical.recipients.clone(),
        cc: canonical.cc.clone(),
        bcc: canonical.bcc.clone(),
        content_text: non_empty(&canonical.content_text),
        content_html: non_empty(&canonical.content_html),
        date_sent: canonical.date_sent,
        date_received,
        raw_headers: canonical.raw_headers.clone(),
        dispatcher_id: None,
        rfq: false,
        rfq_type: None,
    }
}

/// Apply the engine's field modifications to the message before insert
fn apply_effects(message: &mut EmailMessage, effects: &EffectSet) {
    for (field, value) in &effects.field_modifications {
        match field {
            MutableField::DispatcherId => message.dispatcher_id = value.as_i64(),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

/// Clear the processed flag, logging instead of failing the message
///
/// The message itself is already handled at this point; a flag failure only
/// means the next tick sees it again, which dedup absorbs.
async fn clear_flag_logged(client: &mut MailboxClient, uid: u32) {
    if let Err(e) = client.set_processed_flag(uid, true).await {
        warn!(uid, error = %e, "failed to clear processed flag");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{apply_effects, build_message};
    use crate::mime::CanonicalMessage;
    use crate::rules::{EffectSet, MutableField};

    fn canonical() -> CanonicalMessage {
        CanonicalMessage {
            message_id: Some("<m@x>".to_owned()),
            subject: "Quote".to_owned(),
            sender: Some("buyer@x.test".to_owned()),
            recipients: vec!["sales@y.test".to_owned()],
            content_text: "please quote".to_owned(),
            ..CanonicalMessage::default()
        }
    }

    #[test]
    fn builds_message_with_empty_bodies_as_none() {
        let mut c = canonical();
        c.content_text = String::new();
        let msg = build_message(&c, "<m@x>".to_owned(), Utc::now());
        assert_eq!(msg.message_id, "<m@x>");
        assert!(msg.content_text.is_none());
        assert!(msg.content_html.is_none());
        assert_eq!(msg.subject.as_deref(), Some("Quote"));
        assert!(!msg.rfq);
        assert!(msg.dispatcher_id.is_none());
    }

    #[test]
    fn apply_effects_sets_and_clears_dispatcher() {
        let mut msg = build_message(&canonical(), "<m@x>".to_owned(), Utc::now());

        let mut effects = EffectSet::default();
        effects
            .field_modifications
            .insert(MutableField::DispatcherId, json!(7));
        apply_effects(&mut msg, &effects);
        assert_eq!(msg.dispatcher_id, Some(7));

        let mut clear = EffectSet::default();
        clear
            .field_modifications
            .insert(MutableField::DispatcherId, serde_json::Value::Null);
        apply_effects(&mut msg, &clear);
        assert_eq!(msg.dispatcher_id, None);
    }
}
