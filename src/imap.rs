//! IMAP transport and mailbox session operations
//!
//! Provides a timeout-bounded client over `async-imap`. All connections are
//! TLS with server certificate verification against the webpki roots, and
//! every network call is bounded by a timeout from config.
//!
//! The ingestion cursor is the standard `\Flagged` flag: a flagged message
//! needs processing, and clearing the flag marks it processed. The client
//! never mixes the opposite polarity on the same mailbox.

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::Fetch;
use async_imap::{Client, Session};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::config::MailConfig;
use crate::errors::{AppError, AppResult};

/// Type alias for an authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Mailbox folder that ingestion reads from
pub const PRIMARY_FOLDER: &str = "INBOX";

/// Stateful mailbox client
///
/// Lifecycle: `Disconnected → Connected → FolderSelected`. Any transport
/// error drops the session back to `Disconnected`, invalidating previously
/// returned UIDs.
pub struct MailboxClient {
    config: MailConfig,
    session: Option<ImapSession>,
}

impl MailboxClient {
    pub fn new(config: MailConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.config.socket_timeout_ms)
    }

    /// Connect and authenticate
    ///
    /// Performs the full connection sequence with timeouts: TCP connect, TLS
    /// handshake, IMAP greeting, LOGIN, and (where the provider requires it)
    /// a post-login `ID` handshake.
    ///
    /// # Errors
    ///
    /// - `Transport` for TCP, TLS, greeting, or timeout failures
    /// - `Auth` when LOGIN is rejected
    pub async fn connect(&mut self) -> AppResult<()> {
        let connect_duration = Duration::from_millis(self.config.connect_timeout_ms);
        let socket_duration = self.socket_timeout();
        let host = self.config.imap_server.as_str();

        let tcp = timeout(
            connect_duration,
            TcpStream::connect((host, self.config.imap_port)),
        )
        .await
        .map_err(|_| AppError::Transport("tcp connect timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Transport(format!("tcp connect failed: {e}"))))?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));

        let server_name = ServerName::try_from(self.config.imap_server.clone())
            .map_err(|_| AppError::Transport("invalid IMAP host for TLS SNI".to_owned()))?;
        let tls_stream = timeout(socket_duration, connector.connect(server_name, tcp))
            .await
            .map_err(|_| AppError::Transport("TLS handshake timeout".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Transport(format!("TLS handshake failed: {e}"))))?;

        let mut client = Client::new(tls_stream);
        let greeting = timeout(socket_duration, client.read_response())
            .await
            .map_err(|_| AppError::Transport("IMAP greeting timeout".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Transport(format!("IMAP greeting failed: {e}"))))?;
        if greeting.is_none() {
            return Err(AppError::Transport(
                "IMAP server closed connection before greeting".to_owned(),
            ));
        }

        let pass = self.config.password.expose_secret().to_owned();
        let mut session = timeout(
            socket_duration,
            client.login(self.config.username.as_str(), pass.as_str()),
        )
        .await
        .map_err(|_| AppError::Transport("IMAP login timeout".to_owned()))
        .and_then(|r| r.map_err(|(e, _)| AppError::Auth(e.to_string())))?;

        // 163 servers reject mailbox commands until the client identifies itself.
        if host.ends_with("163.com") {
            timeout(
                socket_duration,
                session.run_command_and_check_ok(
                    "ID (\"name\" \"mail-ingest-rs\" \"version\" \"0.1.0\")",
                ),
            )
            .await
            .map_err(|_| AppError::Transport("ID handshake timeout".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Transport(format!("ID handshake failed: {e}"))))?;
        }

        info!(server = %self.config.imap_server, "connected to IMAP server");
        self.session = Some(session);
        Ok(())
    }

    /// Log out and drop the session; errors during logout are ignored
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = timeout(self.socket_timeout(), session.logout()).await;
            debug!("IMAP session closed");
        }
    }

    fn session_mut(&mut self) -> AppResult<&mut ImapSession> {
        self.session
            .as_mut()
            .ok_or_else(|| AppError::Transport("not connected to IMAP server".to_owned()))
    }

    /// Drop the session after a transport failure
    fn invalidate<T>(&mut self, err: AppError) -> AppResult<T> {
        self.session = None;
        Err(err)
    }

    /// List all visible mailbox folders
    pub async fn list_folders(&mut self) -> AppResult<Vec<String>> {
        let socket_duration = self.socket_timeout();
        let session = self.session_mut()?;
        let result = async {
            let stream = timeout(socket_duration, session.list(None, Some("*")))
                .await
                .map_err(|_| AppError::Transport("LIST timed out".to_owned()))
                .and_then(|r| r.map_err(|e| AppError::Transport(format!("LIST failed: {e}"))))?;
            let names = timeout(socket_duration, stream.try_collect::<Vec<_>>())
                .await
                .map_err(|_| AppError::Transport("LIST stream timed out".to_owned()))
                .and_then(|r| {
                    r.map_err(|e| AppError::Transport(format!("LIST stream failed: {e}")))
                })?;
            Ok(names.iter().map(|n| n.name().to_owned()).collect())
        }
        .await;
        match result {
            Ok(names) => Ok(names),
            Err(err) => self.invalidate(err),
        }
    }

    /// Select a folder for read-write access; returns its message count
    pub async fn select_folder(&mut self, folder: &str) -> AppResult<u32> {
        let socket_duration = self.socket_timeout();
        let session = self.session_mut()?;
        let result = timeout(socket_duration, session.select(folder))
            .await
            .map_err(|_| AppError::Transport(format!("SELECT timed out for folder '{folder}'")))
            .and_then(|r| {
                r.map_err(|e| AppError::Transport(format!("cannot select folder '{folder}': {e}")))
            });
        match result {
            Ok(mailbox) => {
                debug!(folder, exists = mailbox.exists, "folder selected");
                Ok(mailbox.exists)
            }
            Err(err) => self.invalidate(err),
        }
    }

    /// Search for messages that still need processing
    ///
    /// Criterion is `FLAGGED`, bounded by `SINCE` when a lower bound is
    /// given. UIDs are returned in ascending order (the upstream's natural
    /// order), optionally capped at `limit`.
    pub async fn search_pending(
        &mut self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> AppResult<Vec<u32>> {
        let criterion = pending_search_criterion(since);
        debug!(criterion = %criterion, "searching mailbox");
        let socket_duration = self.socket_timeout();
        let session = self.session_mut()?;
        let result = timeout(socket_duration, session.uid_search(&criterion))
            .await
            .map_err(|_| AppError::Transport("UID SEARCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Transport(format!("uid search failed: {e}"))));
        match result {
            Ok(set) => {
                let mut uids: Vec<u32> = set.into_iter().collect();
                uids.sort_unstable();
                if let Some(limit) = limit
                    && uids.len() > limit
                {
                    uids.truncate(limit);
                    info!(limit, "capped pending message list");
                }
                Ok(uids)
            }
            Err(err) => self.invalidate(err),
        }
    }

    /// Fetch the complete RFC822 source and flags of one message
    ///
    /// # Errors
    ///
    /// - `NotFound` when the UID disappeared between search and fetch
    /// - `Transport` for network or protocol failures
    pub async fn fetch_raw(&mut self, uid: u32) -> AppResult<(Vec<String>, Vec<u8>)> {
        let fetch = self.fetch_one(uid, "UID RFC822 FLAGS").await?;
        let flags = flags_to_strings(&fetch);
        let body = fetch
            .body()
            .ok_or_else(|| AppError::NotFound(format!("message uid {uid} has no RFC822 body")))?
            .to_vec();
        Ok((flags, body))
    }

    async fn fetch_one(&mut self, uid: u32, query: &str) -> AppResult<Fetch> {
        let socket_duration = self.socket_timeout();
        let session = self.session_mut()?;
        let result = async {
            let stream = timeout(socket_duration, session.uid_fetch(uid.to_string(), query))
                .await
                .map_err(|_| AppError::Transport("UID FETCH timed out".to_owned()))
                .and_then(|r| {
                    r.map_err(|e| AppError::Transport(format!("uid fetch failed: {e}")))
                })?;
            timeout(socket_duration, stream.try_collect::<Vec<Fetch>>())
                .await
                .map_err(|_| AppError::Transport("UID FETCH stream timed out".to_owned()))
                .and_then(|r| {
                    r.map_err(|e| AppError::Transport(format!("uid fetch stream failed: {e}")))
                })
        }
        .await;
        match result {
            Ok(fetches) => fetches
                .into_iter()
                .next()
                .ok_or_else(|| AppError::NotFound(format!("message uid {uid} not found"))),
            Err(err) => self.invalidate(err),
        }
    }

    /// Set or clear the processed marker
    ///
    /// `processed = true` removes `\Flagged` (message handled); `false` adds
    /// it back, re-queueing the message for the next tick.
    pub async fn set_processed_flag(&mut self, uid: u32, processed: bool) -> AppResult<()> {
        let query = if processed {
            "-FLAGS.SILENT (\\Flagged)"
        } else {
            "+FLAGS.SILENT (\\Flagged)"
        };
        self.store_flags(uid, query).await
    }

    /// Add `\Seen` to a message
    pub async fn mark_seen(&mut self, uid: u32) -> AppResult<()> {
        self.store_flags(uid, "+FLAGS.SILENT (\\Seen)").await
    }

    async fn store_flags(&mut self, uid: u32, query: &str) -> AppResult<()> {
        let socket_duration = self.socket_timeout();
        let session = self.session_mut()?;
        let result = async {
            let stream = timeout(socket_duration, session.uid_store(uid.to_string(), query))
                .await
                .map_err(|_| AppError::Transport("UID STORE timed out".to_owned()))
                .and_then(|r| {
                    r.map_err(|e| AppError::Transport(format!("uid store failed: {e}")))
                })?;
            let _: Vec<Fetch> = timeout(socket_duration, stream.try_collect())
                .await
                .map_err(|_| AppError::Transport("UID STORE stream timed out".to_owned()))
                .and_then(|r| {
                    r.map_err(|e| AppError::Transport(format!("uid store stream failed: {e}")))
                })?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.invalidate(err),
        }
    }
}

/// Convert fetch flags to their string representation
fn flags_to_strings(fetch: &Fetch) -> Vec<String> {
    fetch.flags().map(|flag| format!("{flag:?}")).collect()
}

/// Build the pending-message search criterion
///
/// `FLAGGED`, with `SINCE <d-Mon-Y>` appended when a lower bound is given.
pub fn pending_search_criterion(since: Option<DateTime<Utc>>) -> String {
    match since {
        Some(date) => format!("FLAGGED SINCE {}", date.format("%d-%b-%Y")),
        None => "FLAGGED".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::pending_search_criterion;

    #[test]
    fn criterion_without_bound_is_flagged_only() {
        assert_eq!(pending_search_criterion(None), "FLAGGED");
    }

    #[test]
    fn criterion_appends_since_with_imap_date_format() {
        let since = Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(pending_search_criterion(Some(since)), "FLAGGED SINCE 09-Mar-2025");
    }
}
