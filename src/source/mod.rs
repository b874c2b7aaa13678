//! Source Reader: pulls raw messages for a date window from a mail provider.
//!
//! The reader yields one [`FetchedPage`] per provider page, lazily. A page is
//! only requested when the consumer polls for it, and every provider call is
//! preceded by a permit from the shared mail [`RateBudget`].

pub mod imap;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::model::DateRange;
use crate::retry::{RetryPolicy, with_retry};

pub use crate::rate_limit::RateBudget;

/// A full message as returned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    pub thread_id: Option<String>,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub snippet: String,
    pub body: String,
    pub labels: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    /// Text handed to classification and extraction: headers plus body,
    /// capped at `max_chars` characters.
    pub fn text_for_analysis(&self, max_chars: usize) -> String {
        let mut text = format!(
            "From: {}\nTo: {}\nSubject: {}\n\n{}",
            self.sender, self.recipient, self.subject, self.body
        );
        if let Some((idx, _)) = text.char_indices().nth(max_chars) {
            text.truncate(idx);
        }
        text
    }
}

/// One page of message identifiers.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub message_ids: Vec<String>,
    pub next_page_token: Option<String>,
    /// Provider's estimate of total matches, if it offers one.
    pub total_estimate: Option<u32>,
}

/// Mail provider interface.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Provider name for logs and errors.
    fn name(&self) -> &str;

    /// List message ids received within `range`, one page at a time.
    async fn list_messages(
        &self,
        user_id: &str,
        range: &DateRange,
        page_token: Option<&str>,
    ) -> Result<MessagePage, SourceError>;

    /// Fetch headers and body for one message.
    async fn get_message(&self, user_id: &str, id: &str) -> Result<RawMessage, SourceError>;
}

/// Messages retrieved for a single provider page.
#[derive(Debug, Default)]
pub struct FetchedPage {
    pub messages: Vec<RawMessage>,
    /// Messages listed on the page that could not be fetched.
    pub failures: Vec<(String, SourceError)>,
    pub total_estimate: Option<u32>,
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Lazy, paged reader over a [`MailSource`].
#[derive(Clone)]
pub struct SourceReader {
    source: Arc<dyn MailSource>,
    budget: RateBudget,
    retry: RetryPolicy,
    timeout: Duration,
    concurrency: usize,
}

impl SourceReader {
    pub fn new(
        source: Arc<dyn MailSource>,
        budget: RateBudget,
        retry: RetryPolicy,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            budget,
            retry,
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Stream the pages for `range`.
    ///
    /// The stream is finite and not restartable. A failed page listing is
    /// yielded as `Err` and ends the stream, since the provider cursor is lost.
    pub fn fetch(
        &self,
        user_id: &str,
        range: DateRange,
    ) -> BoxStream<'static, Result<FetchedPage, SourceError>> {
        let reader = self.clone();
        let user_id = user_id.to_string();

        stream::unfold(Cursor::Start, move |cursor| {
            let reader = reader.clone();
            let user_id = user_id.clone();
            async move {
                let token = match cursor {
                    Cursor::Done => return None,
                    Cursor::Start => None,
                    Cursor::Next(t) => Some(t),
                };

                match reader.fetch_page(&user_id, &range, token.as_deref()).await {
                    Ok((page, next)) => {
                        let cursor = match next {
                            Some(t) => Cursor::Next(t),
                            None => Cursor::Done,
                        };
                        Some((Ok(page), cursor))
                    }
                    Err(e) => Some((Err(e), Cursor::Done)),
                }
            }
        })
        .boxed()
    }

    async fn fetch_page(
        &self,
        user_id: &str,
        range: &DateRange,
        token: Option<&str>,
    ) -> Result<(FetchedPage, Option<String>), SourceError> {
        let listing = with_retry(
            "list_messages",
            self.retry,
            self.timeout,
            SourceError::Timeout,
            move || async move {
                self.budget.acquire().await;
                self.source.list_messages(user_id, range, token).await
            },
        )
        .await?;

        debug!(
            source = self.source.name(),
            count = listing.message_ids.len(),
            has_more = listing.next_page_token.is_some(),
            "Listed message page"
        );

        let results: Vec<(String, Result<RawMessage, SourceError>)> =
            stream::iter(listing.message_ids.into_iter())
                .map(|id| async move {
                    let id_ref = id.as_str();
                    let result = with_retry(
                        "get_message",
                        self.retry,
                        self.timeout,
                        SourceError::Timeout,
                        move || async move {
                            self.budget.acquire().await;
                            self.source.get_message(user_id, id_ref).await
                        },
                    )
                    .await;
                    (id, result)
                })
                .buffered(self.concurrency)
                .collect()
                .await;

        let mut page = FetchedPage {
            total_estimate: listing.total_estimate,
            ..FetchedPage::default()
        };
        for (id, result) in results {
            match result {
                Ok(msg) if range.contains(msg.received_at) => page.messages.push(msg),
                Ok(msg) => debug!(message_id = %msg.id, "Message outside date window, skipping"),
                Err(e) => {
                    warn!(message_id = %id, error = %e, "Failed to fetch message");
                    page.failures.push((id, e));
                }
            }
        }

        Ok((page, listing.next_page_token))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory mail source for unit tests.

    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    pub struct MemorySource {
        pub messages: Vec<RawMessage>,
        pub page_size: usize,
        /// Page indexes whose listing fails permanently.
        pub failing_pages: HashSet<usize>,
        /// Message ids whose fetch fails permanently.
        pub failing_messages: HashSet<String>,
        pub list_calls: Mutex<usize>,
    }

    impl MemorySource {
        pub fn new(messages: Vec<RawMessage>, page_size: usize) -> Self {
            Self {
                messages,
                page_size,
                failing_pages: HashSet::new(),
                failing_messages: HashSet::new(),
                list_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl MailSource for MemorySource {
        fn name(&self) -> &str {
            "memory"
        }

        async fn list_messages(
            &self,
            _user_id: &str,
            _range: &DateRange,
            page_token: Option<&str>,
        ) -> Result<MessagePage, SourceError> {
            *self.list_calls.lock().unwrap() += 1;
            let page: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
            if self.failing_pages.contains(&page) {
                return Err(SourceError::Rejected {
                    provider: "memory".into(),
                    reason: format!("page {page} unavailable"),
                });
            }
            let start = page * self.page_size;
            let ids: Vec<String> = self
                .messages
                .iter()
                .skip(start)
                .take(self.page_size)
                .map(|m| m.id.clone())
                .collect();
            let next = if start + self.page_size < self.messages.len() {
                Some((page + 1).to_string())
            } else {
                None
            };
            Ok(MessagePage {
                message_ids: ids,
                next_page_token: next,
                total_estimate: Some(self.messages.len() as u32),
            })
        }

        async fn get_message(&self, _user_id: &str, id: &str) -> Result<RawMessage, SourceError> {
            if self.failing_messages.contains(id) {
                return Err(SourceError::NotFound { id: id.into() });
            }
            self.messages
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .ok_or_else(|| SourceError::NotFound { id: id.into() })
        }
    }

    pub fn message(id: &str, subject: &str, body: &str, received_at: DateTime<Utc>) -> RawMessage {
        RawMessage {
            id: id.into(),
            thread_id: None,
            sender: "jobs@example.com".into(),
            recipient: "me@example.com".into(),
            subject: subject.into(),
            snippet: body.chars().take(80).collect(),
            body: body.into(),
            labels: vec!["INBOX".into()],
            received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::testing::{MemorySource, message};
    use super::*;

    fn range() -> DateRange {
        DateRange {
            start: Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap(),
        }
    }

    fn reader(source: MemorySource) -> (SourceReader, Arc<MemorySource>) {
        let source = Arc::new(source);
        let reader = SourceReader::new(
            source.clone(),
            RateBudget::per_second("mail", 1000),
            RetryPolicy::none(),
            Duration::from_secs(5),
            2,
        );
        (reader, source)
    }

    fn fixture(n: usize) -> Vec<RawMessage> {
        (0..n)
            .map(|i| {
                message(
                    &format!("m{i}"),
                    "Hello",
                    "body",
                    Utc.with_ymd_and_hms(2025, 8, 2 + i as u32, 9, 0, 0).unwrap(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn pages_are_pulled_lazily() {
        let (reader, source) = reader(MemorySource::new(fixture(5), 2));
        assert_eq!(reader.source_name(), "memory");
        let mut pages = reader.fetch("u", range());

        let first = pages.next().await.unwrap().unwrap();
        assert_eq!(first.messages.len(), 2);
        assert_eq!(*source.list_calls.lock().unwrap(), 1);

        let rest: Vec<_> = pages.collect().await;
        assert_eq!(rest.len(), 2);
        assert_eq!(*source.list_calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn failed_page_ends_stream_with_error() {
        let mut src = MemorySource::new(fixture(5), 2);
        src.failing_pages.insert(1);
        let (reader, _) = reader(src);

        let pages: Vec<_> = reader.fetch("u", range()).collect().await;
        assert_eq!(pages.len(), 2);
        assert!(pages[0].is_ok());
        assert!(pages[1].is_err());
    }

    #[tokio::test]
    async fn per_message_failures_are_reported() {
        let mut src = MemorySource::new(fixture(3), 10);
        src.failing_messages.insert("m1".into());
        let (reader, _) = reader(src);

        let page = reader.fetch("u", range()).next().await.unwrap().unwrap();
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.failures.len(), 1);
        assert_eq!(page.failures[0].0, "m1");
    }

    #[tokio::test]
    async fn messages_outside_window_are_dropped() {
        let mut msgs = fixture(2);
        msgs[1].received_at = Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap();
        let (reader, _) = reader(MemorySource::new(msgs, 10));

        let page = reader.fetch("u", range()).next().await.unwrap().unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].id, "m0");
    }

    #[test]
    fn analysis_text_is_capped() {
        let msg = message("x", "Subject", &"a".repeat(100), Utc::now());
        assert_eq!(msg.text_for_analysis(20).chars().count(), 20);
    }
}
