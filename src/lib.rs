//! A Gerrit/Jenkins continuous-integration coordinator.
//!
//! One long-running process drives a per-project finite state machine:
//! watch the project's Gerrit staging branch, wait for the staged set to
//! settle, pin it with a build ref, trigger and monitor a Jenkins build,
//! archive its logs, report pass/fail back to Gerrit, and mail the
//! verdict. State-machine positions are persisted crash-safely after every
//! transition, and a small HTTP API exposes a diagnostic snapshot.

pub mod app;
pub mod command;
pub mod config;
pub mod events;
pub mod gerrit;
pub mod jenkins;
pub mod logsync;
pub mod machine;
pub mod mail;
pub mod server;
pub mod store;
pub mod summary;
pub mod types;
