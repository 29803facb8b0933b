//! Staggered multi-recipient dispatch
//!
//! Recipient `i` is sent to at `i * stagger` after the run starts. Each send
//! runs on its own task, so a slow or failing recipient never delays or
//! cancels the others.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};
use url::Url;

use crate::contacts::Contact;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("No emergency contacts configured")]
    NoContactsConfigured,
}

/// Delivery transport for composed alerts
///
/// `phone` is already reduced to digits. Sends are fire-and-forget from the
/// scheduler's point of view; errors are logged only.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, phone: &str, text: &str) -> Result<(), SinkError>;
}

/// One recipient's send, as observed by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub contact_id: String,
    pub contact_name: String,

    /// Digits-only phone handed to the sink
    pub phone: String,

    /// Offset from the start of the run
    pub offset: Duration,

    pub sent_at: DateTime<Utc>,
    pub text: String,
}

/// A dispatch in progress; records arrive in contact order
pub struct DispatchRun {
    records: mpsc::UnboundedReceiver<DispatchRecord>,
    total: usize,
}

impl DispatchRun {
    /// Number of recipients scheduled
    pub fn total(&self) -> usize {
        self.total
    }

    /// Next record, or `None` once every slot has fired
    pub async fn next(&mut self) -> Option<DispatchRecord> {
        self.records.recv().await
    }

    /// Wait for every slot and collect the records
    pub async fn collect(mut self) -> Vec<DispatchRecord> {
        let mut records = Vec::with_capacity(self.total);
        while let Some(record) = self.next().await {
            records.push(record);
        }
        records
    }
}

/// Fans a message out to contacts with a fixed inter-recipient delay
#[derive(Clone)]
pub struct DispatchScheduler {
    sink: Arc<dyn NotificationSink>,
    stagger: Duration,
}

impl DispatchScheduler {
    pub fn new(sink: Arc<dyn NotificationSink>, stagger: Duration) -> Self {
        Self { sink, stagger }
    }

    pub fn stagger(&self) -> Duration {
        self.stagger
    }

    /// Schedule sends to `contacts` in list order
    pub fn dispatch(&self, contacts: Vec<Contact>, text: String) -> Result<DispatchRun, DispatchError> {
        if contacts.is_empty() {
            return Err(DispatchError::NoContactsConfigured);
        }

        let total = contacts.len();
        info!("Dispatching alert to {} contact(s)", total);

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = self.sink.clone();
        let stagger = self.stagger;
        let text: Arc<str> = Arc::from(text);

        tokio::spawn(async move {
            let start = Instant::now();

            for (index, contact) in contacts.into_iter().enumerate() {
                let offset = stagger * index as u32;
                sleep_until(start + offset).await;

                let phone = contact.normalized_phone();
                let record = DispatchRecord {
                    contact_id: contact.id.clone(),
                    contact_name: contact.name.clone(),
                    phone: phone.clone(),
                    offset: start.elapsed(),
                    sent_at: Utc::now(),
                    text: text.to_string(),
                };

                let sink = sink.clone();
                let body = text.clone();
                tokio::spawn(async move {
                    match sink.send(&phone, &body).await {
                        Ok(()) => debug!("Alert sent to {}", contact.name),
                        Err(e) => error!("Failed to send alert to {}: {}", contact.name, e),
                    }
                });

                if tx.send(record).is_err() {
                    debug!("Dispatch records no longer observed");
                }
            }
        });

        Ok(DispatchRun { records: rx, total })
    }
}

/// WhatsApp click-to-chat link for a digits-only phone number
pub fn whatsapp_link(phone: &str, text: &str) -> Result<Url, SinkError> {
    if phone.is_empty() || !phone.chars().all(|c| c.is_ascii_digit()) {
        return Err(SinkError::InvalidRecipient(phone.to_string()));
    }

    Url::parse_with_params(&format!("https://wa.me/{}", phone), &[("text", text)])
        .map_err(|e| SinkError::InvalidRecipient(e.to_string()))
}

/// Delivers by producing WhatsApp links and handing them to a launcher
pub struct WhatsAppLinkSink {
    launcher: Box<dyn Fn(&Url) -> Result<(), SinkError> + Send + Sync>,
}

impl WhatsAppLinkSink {
    pub fn new<F>(launcher: F) -> Self
    where
        F: Fn(&Url) -> Result<(), SinkError> + Send + Sync + 'static,
    {
        Self {
            launcher: Box::new(launcher),
        }
    }

    /// Sink that only logs the links it would open
    pub fn logging() -> Self {
        Self::new(|link| {
            info!("Opening WhatsApp link: {}", link);
            Ok(())
        })
    }
}

#[async_trait]
impl NotificationSink for WhatsAppLinkSink {
    async fn send(&self, phone: &str, text: &str) -> Result<(), SinkError> {
        let link = whatsapp_link(phone, text)?;
        (self.launcher)(&link)
    }
}
