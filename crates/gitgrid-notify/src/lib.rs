//! gitgrid-notify — operational notifications for GitGrid.
//!
//! Fires a JSON webhook on failover promotion and on dead-letter reprocess
//! failure. Delivery is best effort: network errors and non-2xx responses
//! are logged and never returned to the caller.

pub mod webhook;

pub use webhook::{NoopNotifier, NotificationEvent, Notifier, NotifyError, WebhookNotifier};
