//! HTTP request handlers.

mod admin;
mod health;
mod ingress;
mod version;

pub use admin::reprocess_suspended_events;
pub use health::{livez, readyz};
pub use ingress::publish_event;
pub use version::version;
