//! IMAP mail source.
//!
//! Speaks just enough IMAP4rev1 over rustls to search a mailbox by date and
//! fetch full messages. Each call opens its own short session on a blocking
//! thread; the mailbox is opened read-only so nothing is marked as seen.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::error::SourceError;
use crate::model::DateRange;
use crate::source::{MailSource, MessagePage, RawMessage};

const PROVIDER: &str = "imap";

/// IMAP connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    pub page_size: usize,
}

impl ImapConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = std::env::var("EMAIL_PASSWORD").unwrap_or_default();
        let mailbox = std::env::var("EMAIL_IMAP_MAILBOX").unwrap_or_else(|_| "INBOX".into());

        let page_size: usize = std::env::var("JOBTRACKER_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(50);

        Some(Self {
            host,
            port,
            username,
            password: SecretString::from(password),
            mailbox,
            page_size,
        })
    }
}

/// [`MailSource`] backed by an IMAP server.
pub struct ImapMailSource {
    config: Arc<ImapConfig>,
}

impl ImapMailSource {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl MailSource for ImapMailSource {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list_messages(
        &self,
        _user_id: &str,
        range: &DateRange,
        page_token: Option<&str>,
    ) -> Result<MessagePage, SourceError> {
        let offset: usize = match page_token {
            Some(t) => t.parse().map_err(|_| SourceError::Rejected {
                provider: PROVIDER.into(),
                reason: format!("invalid page token '{t}'"),
            })?,
            None => 0,
        };

        let config = Arc::clone(&self.config);
        let criteria = search_criteria(range);
        let uids = tokio::task::spawn_blocking(move || search_uids(&config, &criteria))
            .await
            .map_err(|e| network(format!("search task panicked: {e}")))??;

        let page_size = self.config.page_size;
        let total = uids.len();
        let message_ids: Vec<String> = uids.into_iter().skip(offset).take(page_size).collect();
        let next = offset + page_size;
        Ok(MessagePage {
            message_ids,
            next_page_token: (next < total).then(|| next.to_string()),
            total_estimate: u32::try_from(total).ok(),
        })
    }

    async fn get_message(&self, _user_id: &str, id: &str) -> Result<RawMessage, SourceError> {
        let config = Arc::clone(&self.config);
        let uid = id.to_string();
        let raw = tokio::task::spawn_blocking(move || fetch_raw(&config, &uid))
            .await
            .map_err(|e| network(format!("fetch task panicked: {e}")))??;

        parse_message(id, &raw)
    }
}

fn network(reason: impl Into<String>) -> SourceError {
    SourceError::Network {
        provider: PROVIDER.into(),
        reason: reason.into(),
    }
}

fn io_err(e: std::io::Error) -> SourceError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            SourceError::Timeout(Duration::from_secs(30))
        }
        _ => network(e.to_string()),
    }
}

/// `SINCE`/`BEFORE` criteria for a half-open window. IMAP dates are day
/// granular, so a partial end day is widened and filtered later.
fn search_criteria(range: &DateRange) -> String {
    let since = range.start.date_naive();
    let end_day = range.end.date_naive();
    let before = if range.end.time() == NaiveTime::MIN {
        end_day
    } else {
        end_day.checked_add_days(Days::new(1)).unwrap_or(end_day)
    };
    format!("SINCE {} BEFORE {}", imap_date(since), imap_date(before))
}

fn imap_date(d: NaiveDate) -> String {
    d.format("%d-%b-%Y").to_string()
}

// ── Session ─────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

struct ImapSession {
    tls: TlsStream,
    tag: u32,
}

impl ImapSession {
    fn open(config: &ImapConfig) -> Result<Self, SourceError> {
        let tcp = TcpStream::connect((&*config.host, config.port)).map_err(io_err)?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))
            .map_err(io_err)?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| SourceError::Rejected {
                provider: PROVIDER.into(),
                reason: format!("invalid host name: {e}"),
            })?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| network(format!("TLS setup failed: {e}")))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            tag: 0,
        };
        let _greeting = session.read_line()?;

        let login = session.command(&format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ))?;
        if !last_is_ok(&login) {
            return Err(SourceError::Rejected {
                provider: PROVIDER.into(),
                reason: "login failed".into(),
            });
        }

        let examine = session.command(&format!("EXAMINE \"{}\"", config.mailbox))?;
        if !last_is_ok(&examine) {
            return Err(SourceError::Rejected {
                provider: PROVIDER.into(),
                reason: format!("cannot open mailbox {}", config.mailbox),
            });
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, SourceError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(network("IMAP connection closed")),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(io_err(e)),
            }
        }
    }

    /// Send a tagged command and collect lines up to its tagged completion.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, SourceError> {
        self.tag += 1;
        let tag = format!("J{}", self.tag);
        let full = format!("{tag} {cmd}\r\n");
        self.tls.write_all(full.as_bytes()).map_err(io_err)?;
        self.tls.flush().map_err(io_err)?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&format!("{tag} "));
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

fn last_is_ok(lines: &[String]) -> bool {
    lines
        .last()
        .and_then(|l| l.split_whitespace().nth(1))
        .is_some_and(|status| status.eq_ignore_ascii_case("OK"))
}

fn search_uids(config: &ImapConfig, criteria: &str) -> Result<Vec<String>, SourceError> {
    let mut session = ImapSession::open(config)?;
    let resp = session.command(&format!("UID SEARCH {criteria}"))?;
    session.logout();

    if !last_is_ok(&resp) {
        return Err(SourceError::Rejected {
            provider: PROVIDER.into(),
            reason: format!("search failed: {}", resp.last().map(|s| s.trim()).unwrap_or("")),
        });
    }
    let uids = parse_search_response(&resp);
    debug!(count = uids.len(), criteria, "IMAP search complete");
    Ok(uids)
}

fn parse_search_response(lines: &[String]) -> Vec<String> {
    let mut uids = Vec::new();
    for line in lines {
        if line.starts_with("* SEARCH") {
            uids.extend(line.split_whitespace().skip(2).map(str::to_string));
        }
    }
    uids
}

fn fetch_raw(config: &ImapConfig, uid: &str) -> Result<String, SourceError> {
    let mut session = ImapSession::open(config)?;
    let resp = session.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
    session.logout();

    // First line is "* n FETCH (... {size}", the last two are ")" and the tag.
    if resp.len() < 3 {
        return Err(SourceError::NotFound { id: uid.into() });
    }
    Ok(resp
        .iter()
        .skip(1)
        .take(resp.len().saturating_sub(3))
        .cloned()
        .collect())
}

// ── Parsing ─────────────────────────────────────────────────────────

fn parse_message(id: &str, raw: &str) -> Result<RawMessage, SourceError> {
    let parsed = MessageParser::default()
        .parse(raw.as_bytes())
        .ok_or_else(|| SourceError::Malformed {
            id: id.into(),
            reason: "unparseable RFC 822 message".into(),
        })?;

    let sender = first_address(parsed.from()).unwrap_or_else(|| "unknown".into());
    let recipient = first_address(parsed.to()).unwrap_or_default();
    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let body = extract_text(&parsed);
    let snippet: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
    let snippet: String = snippet.chars().take(200).collect();

    let received_at = parsed
        .date()
        .and_then(|d| {
            NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))
                .and_then(|date| {
                    date.and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))
                })
                .map(|naive| {
                    let offset_secs = i64::from(d.tz_hour) * 3600 + i64::from(d.tz_minute) * 60;
                    let offset_secs = if d.tz_before_gmt { offset_secs } else { -offset_secs };
                    Utc.from_utc_datetime(&naive) + chrono::Duration::seconds(offset_secs)
                })
        })
        .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC);

    Ok(RawMessage {
        id: id.to_string(),
        thread_id: parsed.message_id().map(str::to_string),
        sender,
        recipient,
        subject,
        snippet,
        body,
        labels: Vec::new(),
        received_at,
    })
}

fn first_address(addr: Option<&mail_parser::Address>) -> Option<String> {
    addr.and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(str::to_string)
}

/// Readable text from a parsed message, preferring the plain-text part.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

/// Drop tags and collapse whitespace. Links keep their `href` so status
/// links survive for extraction.
fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut tag = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                if let Some(href) = href_of(&tag) {
                    result.push(' ');
                    result.push_str(href);
                    result.push(' ');
                }
            }
            _ if in_tag => tag.push(ch),
            _ => result.push(ch),
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn href_of(tag: &str) -> Option<&str> {
    let lower = tag.to_ascii_lowercase();
    if !lower.starts_with('a') {
        return None;
    }
    let start = lower.find("href=\"")? + 6;
    let end = tag[start..].find('"')? + start;
    Some(&tag[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: &str, end: &str) -> DateRange {
        DateRange {
            start: DateTime::parse_from_rfc3339(start).unwrap().with_timezone(&Utc),
            end: DateTime::parse_from_rfc3339(end).unwrap().with_timezone(&Utc),
        }
    }

    #[test]
    fn criteria_for_whole_days() {
        let r = range("2025-08-01T00:00:00Z", "2025-09-01T00:00:00Z");
        assert_eq!(search_criteria(&r), "SINCE 01-Aug-2025 BEFORE 01-Sep-2025");
    }

    #[test]
    fn criteria_widens_partial_end_day() {
        let r = range("2025-08-01T00:00:00Z", "2025-08-15T13:30:00Z");
        assert_eq!(search_criteria(&r), "SINCE 01-Aug-2025 BEFORE 16-Aug-2025");
    }

    #[test]
    fn search_response_parsing() {
        let lines = vec![
            "* SEARCH 4 8 15\r\n".to_string(),
            "J3 OK SEARCH completed\r\n".to_string(),
        ];
        assert_eq!(parse_search_response(&lines), vec!["4", "8", "15"]);
        assert!(last_is_ok(&lines));
    }

    #[test]
    fn tagged_no_is_not_ok() {
        let lines = vec!["J1 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n".to_string()];
        assert!(!last_is_ok(&lines));
    }

    #[test]
    fn parses_rfc822_message() {
        let raw = "From: Acme Careers <careers@acme.com>\r\n\
                   To: me@example.com\r\n\
                   Subject: Thank you for applying to Acme\r\n\
                   Date: Sat, 23 Aug 2025 10:15:00 +0000\r\n\
                   Message-ID: <abc123@acme.com>\r\n\
                   Content-Type: text/plain\r\n\
                   \r\n\
                   We received your application for SWE Intern.\r\n";
        let msg = parse_message("42", raw).unwrap();
        assert_eq!(msg.id, "42");
        assert_eq!(msg.sender, "careers@acme.com");
        assert_eq!(msg.recipient, "me@example.com");
        assert_eq!(msg.subject, "Thank you for applying to Acme");
        assert!(msg.body.contains("SWE Intern"));
        assert_eq!(msg.received_at.date_naive(), NaiveDate::from_ymd_opt(2025, 8, 23).unwrap());
        assert_eq!(msg.thread_id.as_deref(), Some("abc123@acme.com"));
    }

    #[test]
    fn html_links_are_kept() {
        let html = r#"<p>Check <a href="https://acme.greenhouse.io/status">status</a></p>"#;
        let text = strip_html(html);
        assert!(text.contains("https://acme.greenhouse.io/status"));
        assert!(text.contains("Check"));
        assert!(!text.contains('<'));
    }
}
