//! Local state persistence.
//!
//! Maps control-plane host ids to local instance names and the last
//! observed state. Stored as `state.json` beside the config file.

mod store;

pub(crate) use store::write_atomic;
pub use store::{InstanceState, State, StateStore, StateStoreError};
