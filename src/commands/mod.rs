pub mod admin;
pub mod poll;

// Re-export command functions for convenience
pub use admin::{add_webhook, append, list_webhooks, remove_webhook, reset_metrics, status};
pub use poll::{once, run};
