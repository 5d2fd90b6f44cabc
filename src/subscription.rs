//! Filter and event-class subscriptions replayed on every (re)connect

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::client::EslClient;

/// Filters and event classes applied, in order, after each handshake.
///
/// Filters are server-side inclusion rules (`Event-Name HEARTBEAT`); event
/// classes are subscribed in plain format (`HEARTBEAT`, `CHANNEL_ANSWER`,
/// `all`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subscriptions {
    pub filters: Vec<String>,
    pub events: Vec<String>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, expression: impl Into<String>) -> Self {
        self.filters
            .push(expression.into());
        self
    }

    pub fn event(mut self, class: impl Into<String>) -> Self {
        self.events
            .push(class.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters
            .is_empty()
            && self
                .events
                .is_empty()
    }
}

/// Replay `subscriptions` through the normal command path.
///
/// A failed entry is logged and skipped; returns how many failed.
pub(crate) async fn apply(client: &EslClient, subscriptions: &Subscriptions) -> usize {
    if subscriptions.is_empty() {
        return 0;
    }

    info!(
        filters = subscriptions.filters.len(),
        events = subscriptions.events.len(),
        "Setting up filters"
    );
    let mut failures = 0;

    for expression in &subscriptions.filters {
        if let Err(e) = client
            .filter(expression)
            .await
        {
            warn!(filter = %expression, error = %e, "Failed to add filter");
            failures += 1;
        }
    }

    for class in &subscriptions.events {
        if let Err(e) = client
            .subscribe(class)
            .await
        {
            warn!(event = %class, error = %e, "Failed to subscribe to event");
            failures += 1;
        }
    }

    info!(failures, "Filters set up");
    failures
}
