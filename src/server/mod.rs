//! Network surfaces: the remote read API, the admin command channel, and
//! the Jenkins build-notification listener.
//!
//! The read API is HTTP (axum); the other two are deliberately bare TCP
//! carrying one JSON object per connection, matching what the notifying
//! side (a Jenkins post-build shell step, an operator's `nc`) can produce
//! without tooling.

mod api;
mod control;

pub use api::{run_api_server, ApiState};
pub use control::{run_admin_listener, run_notify_listener, AdminOptions};
