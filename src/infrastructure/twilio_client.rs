//! Twilio SMS channel for trade confirmations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::domain::repositories::notification::{
    InboundMessage, NotificationError, NotificationService,
};

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub base_url: String,
    pub account_sid: String,
    /// Our Twilio number
    pub from_number: String,
    /// The approver's phone
    pub to_number: String,
}

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    messages: Vec<TwilioMessage>,
}

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
    #[serde(default)]
    body: String,
    from: String,
    #[serde(default)]
    direction: String,
    #[serde(default)]
    date_sent: Option<String>,
    #[serde(default)]
    date_created: Option<String>,
}

impl TwilioMessage {
    fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.date_sent
            .as_deref()
            .or(self.date_created.as_deref())
            .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

pub struct TwilioClient {
    client: Client,
    config: TwilioConfig,
    auth_token: Zeroizing<String>,
    messages_url: Url,
}

impl TwilioClient {
    pub fn new(config: TwilioConfig, auth_token: Zeroizing<String>) -> Result<Self, NotificationError> {
        let messages_url = Url::parse(&config.base_url)
            .and_then(|base| {
                base.join(&format!(
                    "/2010-04-01/Accounts/{}/Messages.json",
                    config.account_sid
                ))
            })
            .map_err(|e| NotificationError::Malformed(format!("Invalid Twilio URL: {}", e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            config,
            auth_token,
            messages_url,
        })
    }
}

/// Keep inbound replies from the approver, newest first
fn inbound_from(page: MessagePage, approver: &str) -> Vec<InboundMessage> {
    let mut messages: Vec<InboundMessage> = page
        .messages
        .into_iter()
        .filter(|m| m.direction.eq_ignore_ascii_case("inbound") && m.from == approver)
        .filter_map(|m| match m.sent_at() {
            Some(sent_at) => Some(InboundMessage {
                id: m.sid,
                body: m.body,
                from: m.from,
                sent_at,
            }),
            None => {
                warn!("Skipping SMS {} without a usable timestamp", m.sid);
                None
            }
        })
        .collect();
    messages.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
    messages
}

#[async_trait]
impl NotificationService for TwilioClient {
    async fn send(&self, message: &str) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(self.messages_url.clone())
            .basic_auth(&self.config.account_sid, Some(self.auth_token.as_str()))
            .form(&[
                ("To", self.config.to_number.as_str()),
                ("From", self.config.from_number.as_str()),
                ("Body", message),
            ])
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Rejected(format!("{} - {}", status, body)));
        }

        info!("📱 Confirmation SMS sent to {}", self.config.to_number);
        Ok(())
    }

    async fn list_recent_inbound(&self, limit: usize) -> Result<Vec<InboundMessage>, NotificationError> {
        let page_size = limit.clamp(1, 1000).to_string();
        let response = self
            .client
            .get(self.messages_url.clone())
            .basic_auth(&self.config.account_sid, Some(self.auth_token.as_str()))
            .query(&[
                ("To", self.config.from_number.as_str()),
                ("PageSize", page_size.as_str()),
            ])
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Rejected(format!("{} - {}", status, body)));
        }

        let page: MessagePage = response
            .json()
            .await
            .map_err(|e| NotificationError::Malformed(e.to_string()))?;

        let mut messages = inbound_from(page, &self.config.to_number);
        messages.truncate(limit);
        Ok(messages)
    }
}
