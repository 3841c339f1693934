//! Purpose: Define the stable public Rust API boundary for private-attrs.
//! Exports: `Store` and its options, shared lists, transfer state, keys, and errors.
//! Role: Public, additive-only surface; hides the backend and session internals.
//! Invariants: This module is the only public path to a store's tables.
//! Invariants: Session files are reachable only through `Store` and `SharedList` handles.

mod list;
mod store;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::key::{Instance, InstanceKey};
pub use crate::core::state::{DictRef, ListRef, PrivateState, StaticState, TransferState};
pub use crate::session_paths::{SESSION_DIR_ENV, default_session_dir};
pub use list::SharedList;
pub use store::{Accessor, OnMissing, STATIC_SUFFIX, Scope, Store, StoreOptions, scope_of};
