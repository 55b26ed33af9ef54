//! IMAP mail source: raw IMAP over rustls, blocking, run in `spawn_blocking`.
//!
//! One shared mailbox receives mail for every route; messages are selected
//! by `TO` address. Message ids are UIDs. The most recently fetched messages
//! are cached so attachment downloads do not refetch the message.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, Utc};
use regex::Regex;
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::config::ImapConfig;
use crate::error::MailError;
use crate::mail::parse::{attachment_bytes, parse_message};
use crate::mail::{FetchedMessage, MailSource, MessageSummary};
use crate::pipeline::calendar::DayWindow;
use crate::store::TenantRoute;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Largest literal accepted from the server.
const MAX_LITERAL_BYTES: usize = 64 * 1024 * 1024;

/// Messages kept in memory. Messages are worked one at a time, so a handful
/// covers every attachment download of the current one.
const CACHED_MESSAGES: usize = 8;

#[derive(Clone)]
struct CachedMessage {
    raw: Arc<Vec<u8>>,
    internal_date: Option<DateTime<Utc>>,
}

/// Raw messages by UID, evicting the oldest insert once full.
struct MessageCache {
    capacity: usize,
    entries: HashMap<String, CachedMessage>,
    order: VecDeque<String>,
}

impl MessageCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, uid: &str) -> Option<CachedMessage> {
        self.entries.get(uid).cloned()
    }

    fn insert(&mut self, uid: &str, message: CachedMessage) {
        if self.entries.insert(uid.to_string(), message).is_some() {
            return;
        }
        self.order.push_back(uid.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct ImapSource {
    config: ImapConfig,
    cache: Mutex<MessageCache>,
}

impl ImapSource {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(MessageCache::new(CACHED_MESSAGES)),
        }
    }

    fn cached(&self, uid: &str) -> Option<CachedMessage> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(uid)
    }

    /// Fetch a message over a fresh session, caching the raw bytes.
    async fn fetch_raw(&self, uid: &str) -> Result<CachedMessage, MailError> {
        if let Some(hit) = self.cached(uid) {
            return Ok(hit);
        }

        let config = self.config.clone();
        let uid_owned = uid.to_string();
        let (raw, internal_date) = tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            let fetched = session.fetch_message(&uid_owned);
            session.logout();
            fetched
        })
        .await
        .map_err(|e| MailError::Task(e.to_string()))??;

        let entry = CachedMessage {
            raw: Arc::new(raw),
            internal_date,
        };
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uid, entry.clone());
        Ok(entry)
    }
}

#[async_trait]
impl MailSource for ImapSource {
    fn name(&self) -> &str {
        "imap"
    }

    async fn list_messages(
        &self,
        route: &TenantRoute,
        window: &DayWindow,
    ) -> Result<Vec<MessageSummary>, MailError> {
        let config = self.config.clone();
        let address = route.source_address.clone();
        let window = *window;

        let summaries = tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            let listed = session.list_window(&address, &window);
            session.logout();
            listed
        })
        .await
        .map_err(|e| MailError::Task(e.to_string()))??;

        info!(
            address = %route.source_address,
            day = %window.day,
            count = summaries.len(),
            "IMAP messages listed"
        );
        Ok(summaries)
    }

    async fn get_message(&self, _route: &TenantRoute, id: &str) -> Result<FetchedMessage, MailError> {
        let entry = self.fetch_raw(id).await?;
        parse_message(id, &entry.raw, entry.internal_date)
    }

    async fn get_attachment(
        &self,
        _route: &TenantRoute,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, MailError> {
        let entry = self.fetch_raw(message_id).await?;
        attachment_bytes(message_id, &entry.raw, attachment_id)
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// Tagged response to one command.
struct Response {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

struct ImapSession {
    tls: TlsStream,
    host: String,
    next_tag: u32,
}

impl ImapSession {
    fn connect(config: &ImapConfig) -> Result<Self, MailError> {
        let conn_err = |reason: String| MailError::Connection {
            host: config.host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((&*config.host, config.port)).map_err(|e| conn_err(e.to_string()))?;
        tcp.set_read_timeout(Some(Duration::from_secs(60)))
            .map_err(|e| conn_err(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| conn_err(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| conn_err(e.to_string()))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            host: config.host.clone(),
            next_tag: 1,
        };

        let _greeting = session.read_line()?;

        let login = session.command(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))?;
        if !is_ok(&login) {
            return Err(MailError::AuthFailed {
                account: config.username.clone(),
            });
        }

        // Read-only: the pipeline never changes flags.
        let examine = session.command(&format!("EXAMINE {}", quote(&config.mailbox)))?;
        if !is_ok(&examine) {
            return Err(MailError::Protocol(format!("cannot open mailbox {}", config.mailbox)));
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, MailError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(MailError::Protocol("IMAP connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
                Err(e) => {
                    return Err(MailError::Connection {
                        host: self.host.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Send a command and collect untagged lines and `{N}` literals up to the tagged reply.
    fn command(&mut self, cmd: &str) -> Result<Response, MailError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let full = format!("{tag} {cmd}\r\n");
        self.tls
            .write_all(full.as_bytes())
            .and_then(|_| self.tls.flush())
            .map_err(|e| MailError::Connection {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        let mut response = Response {
            lines: Vec::new(),
            literals: Vec::new(),
        };
        loop {
            let raw = self.read_line()?;
            let line = String::from_utf8_lossy(&raw).to_string();

            if let Some(len) = literal_length(&line) {
                if len > MAX_LITERAL_BYTES {
                    return Err(MailError::Protocol(format!("literal of {len} bytes refused")));
                }
                let mut literal = vec![0u8; len];
                self.tls.read_exact(&mut literal).map_err(|e| MailError::Connection {
                    host: self.host.clone(),
                    reason: e.to_string(),
                })?;
                response.literals.push(literal);
                response.lines.push(line);
                continue;
            }

            let done = line.starts_with(&format!("{tag} "));
            response.lines.push(line);
            if done {
                return Ok(response);
            }
        }
    }

    /// UIDs addressed to `address` whose INTERNALDATE falls inside `window`.
    fn list_window(&mut self, address: &str, window: &DayWindow) -> Result<Vec<MessageSummary>, MailError> {
        // SEARCH dates are whole days in the server's zone, so widen by one
        // day each side and filter on INTERNALDATE below.
        let since = window
            .start
            .date_naive()
            .checked_sub_days(Days::new(1))
            .unwrap_or(window.start.date_naive());
        let before = window
            .end
            .date_naive()
            .checked_add_days(Days::new(1))
            .unwrap_or(window.end.date_naive());

        let search = self.command(&format!(
            "UID SEARCH SINCE {} BEFORE {} TO {}",
            since.format("%d-%b-%Y"),
            before.format("%d-%b-%Y"),
            quote(address)
        ))?;
        if !is_ok(&search) {
            return Err(MailError::Protocol("UID SEARCH rejected".into()));
        }
        let uids = search_uids(&search.lines);
        debug!(address, candidates = uids.len(), "IMAP search returned");
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let fetch = self.command(&format!("UID FETCH {} (INTERNALDATE)", uids.join(",")))?;
        if !is_ok(&fetch) {
            return Err(MailError::Protocol("UID FETCH INTERNALDATE rejected".into()));
        }

        let mut summaries: Vec<MessageSummary> = fetch
            .lines
            .iter()
            .filter_map(|line| parse_fetch_line(line))
            .filter(|(_, ts)| window.contains(*ts))
            .map(|(uid, received_at)| MessageSummary { id: uid, received_at })
            .collect();
        summaries.sort_by_key(|s| s.received_at);
        Ok(summaries)
    }

    fn fetch_message(&mut self, uid: &str) -> Result<(Vec<u8>, Option<DateTime<Utc>>), MailError> {
        if uid.is_empty() || !uid.chars().all(|c| c.is_ascii_digit()) {
            return Err(MailError::MessageNotFound(uid.to_string()));
        }
        let resp = self.command(&format!("UID FETCH {uid} (INTERNALDATE RFC822)"))?;
        if !is_ok(&resp) {
            return Err(MailError::Protocol(format!("UID FETCH {uid} rejected")));
        }
        let internal_date = resp.lines.iter().find_map(|l| parse_fetch_line(l)).map(|(_, ts)| ts);
        let raw = resp
            .literals
            .into_iter()
            .max_by_key(|l| l.len())
            .ok_or_else(|| MailError::MessageNotFound(uid.to_string()))?;
        Ok((raw, internal_date))
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn is_ok(resp: &Response) -> bool {
    resp.lines
        .last()
        .and_then(|l| l.split_whitespace().nth(1))
        .is_some_and(|status| status.eq_ignore_ascii_case("OK"))
}

/// `{N}` at the end of a line announces an N-byte literal.
fn literal_length(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches("\r\n");
    let open = trimmed.rfind('{')?;
    let inner = trimmed[open + 1..].strip_suffix('}')?;
    inner.parse().ok()
}

fn search_uids(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2).map(|s| s.to_string()).collect::<Vec<_>>())
        .filter(|s| s.chars().all(|c| c.is_ascii_digit()))
        .collect()
}

/// `* 5 FETCH (UID 123 INTERNALDATE "14-Mar-2024 23:50:00 +0000")` → (uid, instant).
fn parse_fetch_line(line: &str) -> Option<(String, DateTime<Utc>)> {
    let uid_re = Regex::new(r"\bUID (\d+)").ok()?;
    let date_re = Regex::new(r#"INTERNALDATE "([^"]+)""#).ok()?;
    let uid = uid_re.captures(line)?.get(1)?.as_str().to_string();
    let date = parse_internal_date(date_re.captures(line)?.get(1)?.as_str())?;
    Some((uid, date))
}

fn parse_internal_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
