//! HTTP surface of the balancer.

pub mod webhook;

pub use webhook::{router, WebhookState};
