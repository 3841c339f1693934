// Core modules implementing keys, table backends, session storage, and error modeling.
pub mod backend;
pub mod error;
pub mod key;
pub mod session;
pub mod state;
