//! Transactional repository over a pooled MySQL connection
//!
//! Owns all SQL: message and attachment persistence (idempotent on
//! `message_id`), forward records, whitelisted field updates, rule-tree
//! loading in deterministic order, and the startup table check. Writes that
//! span rows run inside one transaction which rolls back on drop unless
//! committed.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{AttachmentRecord, DatabaseStats, EmailMessage, ForwardRecord, ForwardStatus};
use crate::rules::{
    ActionKind, Condition, ConditionGroup, FieldKind, GroupLogic, MutableField, Operator, Rule,
    RuleAction,
};

/// Tables that must exist before the service starts
const REQUIRED_TABLES: [&str; 7] = [
    "emails",
    "attachments",
    "email_forwards",
    "email_rules",
    "rule_condition_groups",
    "rule_conditions",
    "rule_actions",
];

/// Repository handle; cheap to clone, shares the pool
#[derive(Debug, Clone)]
pub struct Repository {
    pool: MySqlPool,
}

impl Repository {
    /// Connect the pool
    ///
    /// # Errors
    ///
    /// `Database` when the server is unreachable or credentials are wrong.
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        let pool = MySqlPoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .connect(&config.url())
            .await
            .map_err(|e| AppError::Database(format!("failed to create connection pool: {e}")))?;
        info!(host = %config.host, db = %config.name, "database pool ready");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Assert all required tables exist; schema creation is an operator task
    ///
    /// # Errors
    ///
    /// `Config` naming the missing tables, which aborts startup.
    pub async fn check_tables(&self) -> AppResult<()> {
        let rows = sqlx::query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = DATABASE()",
        )
        .fetch_all(&self.pool)
        .await?;

        let present: Vec<String> = rows
            .iter()
            .map(|r| {
                r.try_get::<String, _>(0)
                    .map_err(|e| AppError::Database(e.to_string()))
            })
            .collect::<AppResult<_>>()?;

        let missing: Vec<&str> = REQUIRED_TABLES
            .iter()
            .filter(|t| !present.iter().any(|p| p.eq_ignore_ascii_case(t)))
            .copied()
            .collect();

        if missing.is_empty() {
            info!("database table check passed");
            Ok(())
        } else {
            Err(AppError::Config(format!(
                "missing database tables: {} (apply schema.sql)",
                missing.join(", ")
            )))
        }
    }

    /// Save a message and its attachments in one transaction
    ///
    /// Idempotent on `message_id`: an existing row's id is returned without
    /// a new insert. When the existing row already has attachment rows, no
    /// attachments are inserted either; when it has none, the provided
    /// attachments are inserted (a retry can repair an earlier incomplete
    /// attachment pass).
    pub async fn save_message_with_attachments(
        &self,
        message: &EmailMessage,
        attachments: &[AttachmentRecord],
    ) -> AppResult<(i64, Vec<i64>)> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM emails WHERE message_id = ?")
                .bind(&message.message_id)
                .fetch_optional(&mut *tx)
                .await?;

        let email_id = match existing {
            Some((id,)) => {
                debug!(email_id = id, message_id = %message.message_id, "message already stored");
                let attachment_count: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM attachments WHERE email_id = ?")
                        .bind(id)
                        .fetch_one(&mut *tx)
                        .await?;
                if attachment_count > 0 {
                    tx.commit().await?;
                    return Ok((id, Vec::new()));
                }
                id
            }
            None => {
                let result = sqlx::query(
                    "INSERT INTO emails (message_id, subject, sender, recipients, cc, bcc, \
                     content_text, content_html, date_sent, date_received, raw_headers, \
                     dispatcher_id, rfq, rfq_type) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&message.message_id)
                .bind(&message.subject)
                .bind(&message.sender)
                .bind(encode_json_list(&message.recipients))
                .bind(encode_json_list(&message.cc))
                .bind(encode_json_list(&message.bcc))
                .bind(&message.content_text)
                .bind(&message.content_html)
                .bind(message.date_sent.map(|d| d.naive_utc()))
                .bind(message.date_received.naive_utc())
                .bind(&message.raw_headers)
                .bind(message.dispatcher_id)
                .bind(message.rfq)
                .bind(&message.rfq_type)
                .execute(&mut *tx)
                .await?;
                let id = result.last_insert_id() as i64;
                info!(email_id = id, message_id = %message.message_id, "message saved");
                id
            }
        };

        let mut attachment_ids = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let result = sqlx::query(
                "INSERT INTO attachments (email_id, original_filename, stored_filename, \
                 file_path, file_size, content_type, content_disposition_type, content_id, extra) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(email_id)
            .bind(&attachment.original_filename)
            .bind(&attachment.stored_filename)
            .bind(&attachment.file_path)
            .bind(attachment.file_size)
            .bind(&attachment.content_type)
            .bind(&attachment.content_disposition_type)
            .bind(&attachment.content_id)
            .bind(attachment.extra.as_ref().map(|v| v.to_string()))
            .execute(&mut *tx)
            .await?;
            attachment_ids.push(result.last_insert_id() as i64);
        }

        tx.commit().await?;
        debug!(email_id, attachments = attachment_ids.len(), "message transaction committed");
        Ok((email_id, attachment_ids))
    }

    pub async fn exists_message(&self, message_id: &str) -> AppResult<bool> {
        let found: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM emails WHERE message_id = ? LIMIT 1")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    pub async fn get_message_by_id(&self, id: i64) -> AppResult<Option<EmailMessage>> {
        let row = sqlx::query("SELECT * FROM emails WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_message_row(&r)).transpose()
    }

    pub async fn get_message_by_message_id(
        &self,
        message_id: &str,
    ) -> AppResult<Option<EmailMessage>> {
        let row = sqlx::query("SELECT * FROM emails WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_message_row(&r)).transpose()
    }

    pub async fn get_attachments(&self, email_id: i64) -> AppResult<Vec<AttachmentRecord>> {
        let rows = sqlx::query("SELECT * FROM attachments WHERE email_id = ? ORDER BY id")
            .bind(email_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_attachment_row).collect()
    }

    /// List messages newest first, with an optional sender substring filter
    pub async fn list_messages(
        &self,
        limit: i64,
        offset: i64,
        sender_filter: Option<&str>,
    ) -> AppResult<(Vec<EmailMessage>, i64)> {
        let (total, rows) = match sender_filter {
            Some(sender) => {
                let pattern = format!("%{sender}%");
                let total: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM emails WHERE sender LIKE ?")
                        .bind(&pattern)
                        .fetch_one(&self.pool)
                        .await?;
                let rows = sqlx::query(
                    "SELECT * FROM emails WHERE sender LIKE ? \
                     ORDER BY date_received DESC LIMIT ? OFFSET ?",
                )
                .bind(&pattern)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
            None => {
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM emails")
                    .fetch_one(&self.pool)
                    .await?;
                let rows = sqlx::query(
                    "SELECT * FROM emails ORDER BY date_received DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
        };
        let messages = rows.iter().map(map_message_row).collect::<AppResult<_>>()?;
        Ok((messages, total))
    }

    pub async fn latest_received_at(&self) -> AppResult<Option<DateTime<Utc>>> {
        let latest: Option<chrono::NaiveDateTime> =
            sqlx::query_scalar("SELECT MAX(date_received) FROM emails")
                .fetch_one(&self.pool)
                .await?;
        Ok(latest.map(|d| d.and_utc()))
    }

    pub async fn stats(&self) -> AppResult<DatabaseStats> {
        let total_emails: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM emails")
            .fetch_one(&self.pool)
            .await?;
        let total_attachments: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attachments")
            .fetch_one(&self.pool)
            .await?;
        let today_emails: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM emails WHERE DATE(date_received) = CURDATE()",
        )
        .fetch_one(&self.pool)
        .await?;
        let latest_email_time = self.latest_received_at().await?;
        Ok(DatabaseStats {
            total_emails,
            total_attachments,
            today_emails,
            latest_email_time,
        })
    }

    /// Update one whitelisted message field
    ///
    /// The whitelist is the `MutableField` enum; there is no way to reach an
    /// arbitrary column from here. Returns whether a row was updated.
    pub async fn update_field(
        &self,
        email_id: i64,
        field: MutableField,
        value: &Value,
    ) -> AppResult<bool> {
        let result = match field {
            MutableField::DispatcherId => {
                let dispatcher: Option<i64> = match value {
                    Value::Null => None,
                    other => Some(other.as_i64().ok_or_else(|| {
                        AppError::validation(format!(
                            "dispatcher_id must be an integer or null, got {other}"
                        ))
                    })?),
                };
                sqlx::query("UPDATE emails SET dispatcher_id = ? WHERE id = ?")
                    .bind(dispatcher)
                    .bind(email_id)
                    .execute(&self.pool)
                    .await?
            }
        };
        if result.rows_affected() == 0 {
            warn!(email_id, "update_field matched no rows");
            return Ok(false);
        }
        Ok(true)
    }

    /// Delete a message; attachments and forward records cascade via FK
    pub async fn delete_message(&self, email_id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM emails WHERE id = ?")
            .bind(email_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn save_forward(&self, forward: &ForwardRecord) -> AppResult<i64> {
        let result = sqlx::query(
            "INSERT INTO email_forwards (email_id, to_addresses, cc_addresses, bcc_addresses, \
             additional_message, forward_status, error_message) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(forward.email_id)
        .bind(encode_json_list(&forward.to_addresses))
        .bind(encode_json_list(&forward.cc_addresses))
        .bind(encode_json_list(&forward.bcc_addresses))
        .bind(&forward.additional_message)
        .bind(forward.status.as_str())
        .bind(&forward.error_message)
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_id() as i64;
        debug!(forward_id = id, email_id = forward.email_id, "forward record created");
        Ok(id)
    }

    /// Advance a forward record to its terminal status
    pub async fn update_forward_status(
        &self,
        forward_id: i64,
        status: ForwardStatus,
        error_message: Option<&str>,
    ) -> AppResult<bool> {
        let result = match error_message {
            Some(error) => {
                sqlx::query(
                    "UPDATE email_forwards SET forward_status = ?, error_message = ? WHERE id = ?",
                )
                .bind(status.as_str())
                .bind(error)
                .bind(forward_id)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("UPDATE email_forwards SET forward_status = ? WHERE id = ?")
                    .bind(status.as_str())
                    .bind(forward_id)
                    .execute(&self.pool)
                    .await?
            }
        };
        if result.rows_affected() == 0 {
            warn!(forward_id, "forward status update matched no rows");
            return Ok(false);
        }
        info!(forward_id, status = status.as_str(), "forward status updated");
        Ok(true)
    }

    pub async fn list_forwards(&self, email_id: i64) -> AppResult<Vec<ForwardRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM email_forwards WHERE email_id = ? ORDER BY forwarded_at DESC",
        )
        .bind(email_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_forward_row).collect()
    }

    pub async fn get_forward(&self, forward_id: i64) -> AppResult<Option<ForwardRecord>> {
        let row = sqlx::query("SELECT * FROM email_forwards WHERE id = ?")
            .bind(forward_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_forward_row(&r)).transpose()
    }

    /// Load all active rules with their condition trees and actions
    ///
    /// Ordering is deterministic at every level: rules by
    /// `priority DESC, id ASC`, groups by `group_order ASC, id ASC`,
    /// conditions by `condition_order ASC, id ASC`, actions by
    /// `action_order ASC, id ASC`.
    pub async fn load_active_rules(&self) -> AppResult<Vec<Rule>> {
        let rule_rows = sqlx::query(
            "SELECT id, name, description, is_active, priority, stop_on_match, \
             global_group_logic FROM email_rules WHERE is_active = 1 \
             ORDER BY priority DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rule_rows.len());
        for row in &rule_rows {
            let id: i64 = get(row, "id")?;
            let logic_raw: String = get(row, "global_group_logic")?;
            let mut rule = Rule {
                id,
                name: get(row, "name")?,
                description: get(row, "description")?,
                is_active: get(row, "is_active")?,
                priority: get(row, "priority")?,
                stop_on_match: get(row, "stop_on_match")?,
                global_group_logic: GroupLogic::parse(&logic_raw).ok_or_else(|| {
                    AppError::Database(format!("rule {id}: unknown group logic '{logic_raw}'"))
                })?,
                groups: Vec::new(),
                actions: Vec::new(),
            };
            rule.groups = self.load_condition_groups(id).await?;
            rule.actions = self.load_rule_actions(id).await?;
            rules.push(rule);
        }
        debug!(count = rules.len(), "active rules loaded");
        Ok(rules)
    }

    async fn load_condition_groups(&self, rule_id: i64) -> AppResult<Vec<ConditionGroup>> {
        let group_rows = sqlx::query(
            "SELECT id, group_logic, group_order FROM rule_condition_groups \
             WHERE rule_id = ? ORDER BY group_order ASC, id ASC",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        let mut groups = Vec::with_capacity(group_rows.len());
        for row in &group_rows {
            let id: i64 = get(row, "id")?;
            let logic_raw: String = get(row, "group_logic")?;
            groups.push(ConditionGroup {
                id,
                logic: GroupLogic::parse(&logic_raw).ok_or_else(|| {
                    AppError::Database(format!("group {id}: unknown group logic '{logic_raw}'"))
                })?,
                order: get(row, "group_order")?,
                conditions: self.load_group_conditions(id).await?,
            });
        }
        Ok(groups)
    }

    async fn load_group_conditions(&self, group_id: i64) -> AppResult<Vec<Condition>> {
        let rows = sqlx::query(
            "SELECT id, field_type, operator, match_value, case_sensitive, condition_order \
             FROM rule_conditions WHERE group_id = ? ORDER BY condition_order ASC, id ASC",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: i64 = get(row, "id")?;
                let field_raw: String = get(row, "field_type")?;
                let operator_raw: String = get(row, "operator")?;
                Ok(Condition {
                    id,
                    field: FieldKind::parse(&field_raw).ok_or_else(|| {
                        AppError::Database(format!("condition {id}: unknown field '{field_raw}'"))
                    })?,
                    operator: Operator::parse(&operator_raw).ok_or_else(|| {
                        AppError::Database(format!(
                            "condition {id}: unknown operator '{operator_raw}'"
                        ))
                    })?,
                    match_value: get(row, "match_value")?,
                    case_sensitive: get(row, "case_sensitive")?,
                    order: get(row, "condition_order")?,
                })
            })
            .collect()
    }

    async fn load_rule_actions(&self, rule_id: i64) -> AppResult<Vec<RuleAction>> {
        let rows = sqlx::query(
            "SELECT id, action_type, action_config, action_order FROM rule_actions \
             WHERE rule_id = ? ORDER BY action_order ASC, id ASC",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: i64 = get(row, "id")?;
                let kind_raw: String = get(row, "action_type")?;
                let config_raw: Option<String> = get(row, "action_config")?;
                Ok(RuleAction {
                    id,
                    kind: ActionKind::parse(&kind_raw).ok_or_else(|| {
                        AppError::Database(format!("action {id}: unknown action '{kind_raw}'"))
                    })?,
                    config: config_raw.as_deref().map(parse_json).transpose()?,
                    order: get(row, "action_order")?,
                })
            })
            .collect()
    }
}

fn get<'r, T>(row: &'r MySqlRow, column: &str) -> AppResult<T>
where
    T: sqlx::Decode<'r, sqlx::MySql> + sqlx::Type<sqlx::MySql>,
{
    row.try_get(column)
        .map_err(|e| AppError::Database(format!("column '{column}': {e}")))
}

fn parse_json(raw: &str) -> AppResult<Value> {
    serde_json::from_str(raw).map_err(|e| AppError::Database(format!("malformed JSON column: {e}")))
}

/// Serialize an address list to its JSON text column; `None` when empty
fn encode_json_list(values: &[String]) -> Option<String> {
    if values.is_empty() {
        None
    } else {
        Some(serde_json::to_string(values).unwrap_or_else(|_| "[]".to_owned()))
    }
}

/// Deserialize a JSON text column back into an address list
fn decode_json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn map_message_row(row: &MySqlRow) -> AppResult<EmailMessage> {
    let date_sent: Option<chrono::NaiveDateTime> = get(row, "date_sent")?;
    let date_received: chrono::NaiveDateTime = get(row, "date_received")?;
    Ok(EmailMessage {
        id: Some(get(row, "id")?),
        message_id: get(row, "message_id")?,
        subject: get(row, "subject")?,
        sender: get(row, "sender")?,
        recipients: decode_json_list(get(row, "recipients")?),
        cc: decode_json_list(get(row, "cc")?),
        bcc: decode_json_list(get(row, "bcc")?),
        content_text: get(row, "content_text")?,
        content_html: get(row, "content_html")?,
        date_sent: date_sent.map(|d| d.and_utc()),
        date_received: date_received.and_utc(),
        raw_headers: get::<Option<String>>(row, "raw_headers")?.unwrap_or_default(),
        dispatcher_id: get(row, "dispatcher_id")?,
        rfq: get::<Option<bool>>(row, "rfq")?.unwrap_or(false),
        rfq_type: get(row, "rfq_type")?,
    })
}

fn map_attachment_row(row: &MySqlRow) -> AppResult<AttachmentRecord> {
    let extra_raw: Option<String> = get(row, "extra")?;
    Ok(AttachmentRecord {
        id: Some(get(row, "id")?),
        email_id: get(row, "email_id")?,
        original_filename: get::<Option<String>>(row, "original_filename")?.unwrap_or_default(),
        stored_filename: get::<Option<String>>(row, "stored_filename")?.unwrap_or_default(),
        file_path: get::<Option<String>>(row, "file_path")?.unwrap_or_default(),
        file_size: get::<Option<i64>>(row, "file_size")?.unwrap_or(0),
        content_type: get::<Option<String>>(row, "content_type")?.unwrap_or_default(),
        content_disposition_type: get::<Option<String>>(row, "content_disposition_type")?
            .unwrap_or_default(),
        content_id: get(row, "content_id")?,
        extra: extra_raw.as_deref().map(parse_json).transpose()?,
    })
}

fn map_forward_row(row: &MySqlRow) -> AppResult<ForwardRecord> {
    let status_raw: String = get(row, "forward_status")?;
    let forwarded_at: Option<chrono::NaiveDateTime> = get(row, "forwarded_at")?;
    let created_at: Option<chrono::NaiveDateTime> = get(row, "created_at")?;
    Ok(ForwardRecord {
        id: Some(get(row, "id")?),
        email_id: get(row, "email_id")?,
        to_addresses: decode_json_list(get(row, "to_addresses")?),
        cc_addresses: decode_json_list(get(row, "cc_addresses")?),
        bcc_addresses: decode_json_list(get(row, "bcc_addresses")?),
        additional_message: get(row, "additional_message")?,
        status: ForwardStatus::parse(&status_raw).ok_or_else(|| {
            AppError::Database(format!("unknown forward status '{status_raw}'"))
        })?,
        error_message: get(row, "error_message")?,
        forwarded_at: forwarded_at.map(|d| d.and_utc()),
        created_at: created_at.map(|d| d.and_utc()),
    })
}

#[cfg(test)]
mod tests {
    use super::{decode_json_list, encode_json_list};

    #[test]
    fn json_list_round_trips() {
        let addrs = vec!["a@x.test".to_owned(), "b@x.test".to_owned()];
        let encoded = encode_json_list(&addrs).expect("non-empty list must encode");
        assert_eq!(decode_json_list(Some(encoded)), addrs);
    }

    #[test]
    fn empty_list_encodes_as_null_column() {
        assert_eq!(encode_json_list(&[]), None);
        assert!(decode_json_list(None).is_empty());
        assert!(decode_json_list(Some("not json".to_owned())).is_empty());
    }
}
