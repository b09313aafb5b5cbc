use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::types::{MailboxQuery, VerificationMessage, VerificationToken};
use tavreg_core::config::MailboxConfig;
use tavreg_core::RegisterError;

/// Read-only view of the verification mailbox. `fetch` must be idempotent:
/// messages are read, not consumed, so an interrupted run can be
/// re-inspected by hand.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// All currently held messages matching `query`. Ordering is not part
    /// of the contract; the caller picks the most recent.
    async fn fetch(&self, query: &MailboxQuery)
        -> Result<Vec<VerificationMessage>, RegisterError>;

    /// Best-effort removal of a consumed message so a resend lands in an
    /// empty inbox. Never fails the run.
    async fn cleanup(&self, _message_id: &str) -> bool {
        true
    }
}

/// Client for a tempmail.plus-style HTTP API: list message ids, fetch one
/// message's content, delete by id.
pub struct TempMailClient {
    client: reqwest::Client,
    api_url: String,
    alias: String,
    epin: String,
}

impl TempMailClient {
    pub fn new(config: &MailboxConfig) -> Result<Self, RegisterError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RegisterError::Mailbox(e.to_string()))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            alias: config.alias.clone(),
            epin: config.epin.clone(),
        })
    }

    async fn list_ids(&self) -> Result<Vec<String>, RegisterError> {
        let url = format!("{}/mail/id", self.api_url);
        let response = self
            .client
            .get(&url)
            .query(&[("email", self.alias.as_str()), ("epin", self.epin.as_str())])
            .send()
            .await
            .map_err(|e| RegisterError::Mailbox(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RegisterError::Mailbox(format!(
                "listing messages failed: HTTP {}",
                response.status()
            )));
        }

        let ids: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| RegisterError::Mailbox(e.to_string()))?;

        Ok(ids
            .into_iter()
            .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
            .collect())
    }

    async fn fetch_content(&self, id: &str) -> Result<MailContent, RegisterError> {
        let url = format!("{}/mail/{}/content", self.api_url, id);
        let response = self
            .client
            .get(&url)
            .query(&[("email", self.alias.as_str()), ("epin", self.epin.as_str())])
            .send()
            .await
            .map_err(|e| RegisterError::Mailbox(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RegisterError::Mailbox(format!(
                "fetching message {} failed: HTTP {}",
                id,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RegisterError::Mailbox(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct MailContent {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl Mailbox for TempMailClient {
    async fn fetch(
        &self,
        query: &MailboxQuery,
    ) -> Result<Vec<VerificationMessage>, RegisterError> {
        let ids = self.list_ids().await?;
        if ids.is_empty() {
            info!("mailbox is empty");
            return Ok(vec![]);
        }

        let mut matches = Vec::new();

        // The API lists newest first; a handful is plenty to cover resends
        for id in ids.iter().take(10) {
            let content = match self.fetch_content(id).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(id = %id, error = %e, "skipping unreadable message");
                    continue;
                }
            };

            if let Some(msg) = match_message(id, &content, query) {
                matches.push(msg);
            }
        }

        Ok(matches)
    }

    async fn cleanup(&self, message_id: &str) -> bool {
        let url = format!("{}/mail/{}", self.api_url, message_id);

        for attempt in 1..=3u32 {
            let result = self
                .client
                .delete(&url)
                .query(&[("email", self.alias.as_str()), ("epin", self.epin.as_str())])
                .send()
                .await;

            match result {
                Ok(r) if r.status().is_success() => {
                    info!(id = %message_id, "deleted consumed message");
                    return true;
                }
                Ok(r) => warn!(id = %message_id, attempt, status = %r.status(), "delete failed"),
                Err(e) => warn!(id = %message_id, attempt, error = %e, "delete failed"),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        false
    }
}

fn match_message(
    id: &str,
    content: &MailContent,
    query: &MailboxQuery,
) -> Option<VerificationMessage> {
    if !query.sender_domain.is_empty() {
        let from = content.from.as_deref().unwrap_or("");
        if !from.contains(&query.sender_domain) {
            return None;
        }
    }

    if let Some(to) = content.to.as_deref() {
        if !to.contains(&query.recipient) {
            return None;
        }
    }

    let received_at = content
        .date
        .as_deref()
        .and_then(parse_mail_date)
        .unwrap_or_else(Utc::now);
    if received_at <= query.received_after {
        return None;
    }

    let text = content.text.as_deref().unwrap_or("");
    let token = extract_token(text, &query.sender_domain)?;

    Some(VerificationMessage {
        id: id.to_string(),
        received_at,
        token,
    })
}

fn parse_mail_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Pull the verification payload out of a message body: a standalone
/// 6-digit code first, a verification link as fallback.
pub fn extract_token(body: &str, sender_domain: &str) -> Option<VerificationToken> {
    if let Some(code) = extract_code(body) {
        return Some(VerificationToken::Code(code));
    }
    extract_link(body, sender_domain).map(VerificationToken::Link)
}

/// A 6-digit run not embedded in a longer number, identifier or address.
pub fn extract_code(body: &str) -> Option<String> {
    // regex has no lookbehind; the leading alternation plays that role
    let re = Regex::new(r"(?:^|[^0-9A-Za-z@.])([0-9]{6})(?:[^0-9]|$)").ok()?;
    re.captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Verification link patterns, most specific first.
pub fn extract_link(body: &str, domain: &str) -> Option<String> {
    let mut patterns = Vec::new();
    if !domain.is_empty() {
        patterns.push(format!(
            r"https?://[^\s<>]*{}[^\s<>]*(?:verify|confirm|activate)[^\s<>]*",
            regex::escape(domain)
        ));
    }
    patterns.push(r"https?://[^\s<>]*[?&](?:token|code|key)=[a-zA-Z0-9_-]+[^\s<>]*".to_string());

    for pattern in patterns {
        if let Ok(re) = Regex::new(&pattern) {
            if let Some(m) = re.find(body) {
                let cleaned = m.as_str().trim_end_matches(&[')', ']', '.', ',', ';'][..]);
                // Mail bodies wrap and mangle URLs; only a parseable one
                // is worth navigating to
                if url::Url::parse(cleaned).is_ok() {
                    return Some(cleaned.to_string());
                }
            }
        }
    }

    None
}

/// The most recent message received strictly after `after`. Resends leave
/// stale matches behind; the latest one is the code the site expects.
pub fn most_recent(
    messages: &[VerificationMessage],
    after: DateTime<Utc>,
) -> Option<VerificationMessage> {
    messages
        .iter()
        .filter(|m| m.received_at > after)
        .max_by_key(|m| m.received_at)
        .cloned()
}
