// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! External alerting collaborators - SMS delivery and IP geolocation.
//!
//! Both are best-effort: callers log failures and carry on.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::config::AlertConfig;
use crate::db::Metadata;
use crate::error::AlertError;

/// Sends a text message to the configured alert recipient
#[async_trait]
pub trait SmsNotifier: Send + Sync {
    async fn send(&self, body: &str) -> Result<(), AlertError>;
}

/// Resolves an IP address to a coarse location document
#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn locate(&self, ip: &str) -> Result<Metadata, AlertError>;
}

/// Body of the SMS sent when a helmet reports alcohol
pub fn drunken_alert_text(device_id: &str, alcohol_level: Option<i32>) -> String {
    let level = alcohol_level
        .map(|l| l.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!("🚨 ALERT: Alcohol detected in helmet {} (Level: {})", device_id, level)
}

/// Twilio REST API client
pub struct TwilioNotifier {
    client: Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    to_number: String,
}

impl TwilioNotifier {
    const API_BASE: &'static str = "https://api.twilio.com/2010-04-01";

    pub fn from_config(config: &AlertConfig) -> Result<Self, AlertError> {
        let required = |value: &Option<String>, name: &'static str| {
            value.clone().ok_or(AlertError::NotConfigured(name))
        };

        let client = Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Self {
            client,
            account_sid: required(&config.account_sid, "Twilio account SID")?,
            auth_token: required(&config.auth_token, "Twilio auth token")?,
            from_number: required(&config.from_number, "Twilio sender number")?,
            to_number: required(&config.to_number, "alert recipient number")?,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/Accounts/{}/Messages.json", Self::API_BASE, self.account_sid)
    }
}

#[async_trait]
impl SmsNotifier for TwilioNotifier {
    async fn send(&self, body: &str) -> Result<(), AlertError> {
        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", self.to_number.as_str()),
                ("From", self.from_number.as_str()),
                ("Body", body),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AlertError::Rejected { status: status.as_u16(), body });
        }

        info!("SMS alert sent to {}", self.to_number);
        Ok(())
    }
}

/// ip-api.com style lookup: `GET {base}{ip}` returning a JSON object
pub struct IpApiLocator {
    client: Client,
    base_url: String,
}

impl IpApiLocator {
    pub fn from_config(config: &AlertConfig) -> Result<Self, AlertError> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self::with_client(client, config.geolocation_base()))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self { client, base_url: base_url.to_string() }
    }

    fn lookup_url(&self, ip: &str) -> String {
        if self.base_url.ends_with('/') {
            format!("{}{}", self.base_url, ip)
        } else {
            format!("{}/{}", self.base_url, ip)
        }
    }
}

#[async_trait]
impl GeoLocator for IpApiLocator {
    async fn locate(&self, ip: &str) -> Result<Metadata, AlertError> {
        let response = self.client.get(self.lookup_url(ip)).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AlertError::Rejected { status: status.as_u16(), body });
        }

        let location: Metadata = response.json().await?;
        debug!("Resolved {} to {} fields", ip, location.len());
        Ok(location)
    }
}
