//! Reservation event dispatch
//!
//! Delivery belongs to an external notification service. The lending core only
//! hands events over after the unit of work committed, and never waits for or
//! retries a delivery.

use crate::models::Notification;

#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Writes every event to the log
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) {
        match notification {
            Notification::ReservationQueued {
                reservation_id,
                user_id,
                book_id,
                position,
            } => tracing::info!(
                reservation_id,
                user_id,
                book_id,
                position,
                "Reservation queued"
            ),
            Notification::CopyReady {
                reservation_id,
                user_id,
                book_id,
                copy_id,
                expires_at,
            } => tracing::info!(
                reservation_id,
                user_id,
                book_id,
                copy_id,
                %expires_at,
                "Copy ready for pickup"
            ),
        }
    }
}

/// Posts every event as JSON to the notification service
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: &Notification) {
        let client = self.client.clone();
        let url = self.url.clone();
        let payload = notification.clone();

        tokio::spawn(async move {
            let result = client
                .post(&url)
                .json(&payload)
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match result {
                Ok(_) => tracing::debug!("Notification delivered to {}", url),
                Err(e) => tracing::warn!("Failed to deliver notification to {}: {}", url, e),
            }
        });
    }
}

/// Sends each event to several sinks
pub struct FanoutNotifier {
    sinks: Vec<Box<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Box<dyn Notifier>>) -> Self {
        Self { sinks }
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, notification: &Notification) {
        for sink in &self.sinks {
            sink.notify(notification);
        }
    }
}
