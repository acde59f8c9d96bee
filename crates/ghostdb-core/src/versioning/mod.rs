//! Version graph, ref log and persisted database state.

mod changelog;
mod ref_log;
mod state;
mod version;

pub use changelog::Changelog;
pub use ref_log::{RefLog, Scope};
pub use state::State;
pub use version::{ChangeSet, Version, VersionId};
