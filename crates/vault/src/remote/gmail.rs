//! Gmail API implementation of [`MailRemote`]
//!
//! Uses synchronous HTTP (ureq) to be executor-agnostic. Rate-limited
//! calls are retried with a fixed sleep and a bounded try count; a 404 on
//! item fetch is absence, not failure.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;

use super::session::{Session, SessionPool};
use super::{
    InsertMessage, MailRemote, MessageEnvelope, MessageFormat, MessageSummary, RemoteError,
    RemoteLabel,
};
use crate::exec::{sleep_cancellable, CancelToken};

/// Default bounded retry: 5 tries, 10 seconds between rate-limited ones.
pub const DEFAULT_TRY_COUNT: usize = 5;
pub const DEFAULT_TRY_SLEEP: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListLabelsResponse {
    labels: Option<Vec<RemoteLabel>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesResponse {
    messages: Option<Vec<MessageSummary>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InsertResponse {
    id: String,
}

/// Gmail API client with pooled sessions and bounded retry.
pub struct GmailRemote {
    sessions: SessionPool,
    base_url: String,
    try_count: usize,
    try_sleep: Duration,
    cancel: CancelToken,
}

impl GmailRemote {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    pub fn new(sessions: SessionPool, cancel: CancelToken) -> Self {
        Self {
            sessions,
            base_url: Self::BASE_URL.to_string(),
            try_count: DEFAULT_TRY_COUNT,
            try_sleep: DEFAULT_TRY_SLEEP,
            cancel,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_retry(mut self, try_count: usize, try_sleep: Duration) -> Self {
        self.try_count = try_count.max(1);
        self.try_sleep = try_sleep;
        self
    }

    /// Run `op` with a pooled session, retrying rate-limited and transport
    /// failures up to the try bound. Other statuses propagate immediately.
    fn with_retry_session<T>(
        &self,
        account: &str,
        what: &str,
        op: impl Fn(&Session) -> Result<T, RemoteError>,
    ) -> Result<T> {
        for attempt in 1..=self.try_count {
            let session = self.sessions.acquire(account)?;
            let result = op(&session);
            self.sessions.release(account, session);

            match result {
                Ok(value) => return Ok(value),
                Err(e @ RemoteError::RateLimited) | Err(e @ RemoteError::Transport(_)) => {
                    if attempt == self.try_count {
                        return Err(anyhow!(e).context(format!("{what} failed after retries")));
                    }
                    if matches!(e, RemoteError::RateLimited) {
                        warn!(
                            "{what}: rate limit exceeded, sleeping for {}s",
                            self.try_sleep.as_secs()
                        );
                        if !sleep_cancellable(self.try_sleep, &self.cancel) {
                            anyhow::bail!("{what} cancelled while backing off");
                        }
                    } else {
                        warn!("{what}: transient failure, retrying ({e})");
                    }
                }
                Err(e) => return Err(anyhow!(e).context(format!("{what} failed"))),
            }
        }
        unreachable!("retry loop returns on last attempt")
    }
}

/// Gmail signals quota exhaustion with 403 as well as 429.
fn classify(e: ureq::Error) -> RemoteError {
    match e {
        ureq::Error::StatusCode(403) | ureq::Error::StatusCode(429) => RemoteError::RateLimited,
        ureq::Error::StatusCode(status) => RemoteError::Status(status),
        other => RemoteError::Transport(other.to_string()),
    }
}

fn get_json<T: serde::de::DeserializeOwned>(
    session: &Session,
    url: &str,
) -> Result<T, RemoteError> {
    let mut response = session
        .agent
        .get(url)
        .header("Authorization", &format!("Bearer {}", session.token))
        .call()
        .map_err(classify)?;
    response
        .body_mut()
        .read_json()
        .map_err(|e| RemoteError::Transport(e.to_string()))
}

fn post_json<T: serde::de::DeserializeOwned>(
    session: &Session,
    url: &str,
    body: &impl serde::Serialize,
) -> Result<T, RemoteError> {
    let mut response = session
        .agent
        .post(url)
        .header("Authorization", &format!("Bearer {}", session.token))
        .send_json(body)
        .map_err(classify)?;
    response
        .body_mut()
        .read_json()
        .map_err(|e| RemoteError::Transport(e.to_string()))
}

impl MailRemote for GmailRemote {
    fn list_labels(&self, account: &str) -> Result<Vec<RemoteLabel>> {
        let url = format!("{}/users/me/labels", self.base_url);
        let response: ListLabelsResponse =
            self.with_retry_session(account, "list labels", |session| {
                get_json(session, &url)
            })?;
        Ok(response.labels.unwrap_or_default())
    }

    fn list_messages(
        &self,
        account: &str,
        query: &str,
    ) -> Result<BTreeMap<String, MessageSummary>> {
        let mut messages = BTreeMap::new();
        let mut page_token: Option<String> = None;
        let mut page = 1u32;

        loop {
            debug!("Loading message page {page} from server");
            let mut url = format!(
                "{}/users/me/messages?maxResults=500&q={}",
                self.base_url,
                urlencoding::encode(query)
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
            }

            let response: ListMessagesResponse =
                self.with_retry_session(account, "list messages", |session| {
                    get_json(session, &url)
                })?;

            let page_messages = response.messages.unwrap_or_default();
            debug!("Page {page} loaded ({} messages)", page_messages.len());
            for summary in page_messages {
                messages.insert(summary.id.clone(), summary);
            }

            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
            page += 1;
        }

        Ok(messages)
    }

    fn get_message(
        &self,
        account: &str,
        id: &str,
        format: MessageFormat,
    ) -> Result<Option<MessageEnvelope>> {
        let url = format!(
            "{}/users/me/messages/{}?format={}",
            self.base_url,
            urlencoding::encode(id),
            format.as_str()
        );
        self.with_retry_session(account, "get message", |session| {
            match get_json::<MessageEnvelope>(session, &url) {
                Ok(envelope) => Ok(Some(envelope)),
                Err(RemoteError::Status(404)) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .with_context(|| format!("{id} message download failed"))
    }

    fn create_label(&self, account: &str, name: &str) -> Result<RemoteLabel> {
        let url = format!("{}/users/me/labels", self.base_url);
        let body = serde_json::json!({ "name": name });

        let created = self.with_retry_session(account, "create label", |session| {
            match post_json::<RemoteLabel>(session, &url, &body) {
                Ok(label) => Ok(Some(label)),
                // 409: the name already exists; recover by lookup below
                Err(RemoteError::Status(409)) => Ok(None),
                Err(e) => Err(e),
            }
        })?;

        if let Some(label) = created {
            info!("Label created ({name})");
            return Ok(label);
        }

        debug!("Label ({name}) already exists, looking it up");
        self.list_labels(account)?
            .into_iter()
            .find(|label| label.name == name)
            .with_context(|| format!("Label ({name}) already exists but cannot be found"))
    }

    fn insert_message(&self, account: &str, message: &InsertMessage) -> Result<String> {
        let url = format!(
            "{}/users/me/messages?internalDateSource=dateHeader",
            self.base_url
        );
        let response: InsertResponse =
            self.with_retry_session(account, "insert message", |session| {
                post_json(session, &url, message)
            })?;
        Ok(response.id)
    }
}
