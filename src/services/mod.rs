//! Business logic services

pub mod clock;
pub mod fines;
pub mod inventory;
pub mod loans;
pub mod notifications;
pub mod reservations;

use std::sync::Arc;

use crate::{config::AppConfig, repository::Repository};

use clock::{Clock, SystemClock};
use notifications::{FanoutNotifier, Notifier, TracingNotifier, WebhookNotifier};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub lending: loans::LendingService,
}

impl Services {
    /// Create all services with the given repository
    pub fn new(repository: Repository, config: &AppConfig) -> Self {
        Self::with_clock(repository, config, Arc::new(SystemClock))
    }

    pub fn with_clock(repository: Repository, config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        let notifier: Arc<dyn Notifier> = match &config.notifications.webhook_url {
            Some(url) => Arc::new(FanoutNotifier::new(vec![
                Box::new(TracingNotifier),
                Box::new(WebhookNotifier::new(url.clone())),
            ])),
            None => Arc::new(TracingNotifier),
        };

        Self {
            lending: loans::LendingService::new(
                repository,
                config.lending.clone(),
                &config.fines,
                notifier,
                clock,
                config.database.transaction_retries,
            ),
        }
    }
}
