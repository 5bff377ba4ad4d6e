//! The per-project integration state machine.
//!
//! One [`ProjectRunner`] task per enabled project drives the project through
//! the integration cycle: wait for staged changes, wait for quiescence,
//! create a build ref, trigger and monitor Jenkins, report the result back
//! to Gerrit, mail the verdict, and start over. Every transition is
//! persisted and flushed before the next one begins.

mod engine;
mod state;
mod stash;

pub use engine::{
    startup_stagger, MachineError, ProjectContext, ProjectRunner, SharedStore,
    SUSPEND_THRESHOLD,
};
pub use stash::{ErrorContext, Stash, StashError};
pub use state::State;
