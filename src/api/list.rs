//! Purpose: Append-only lists living in a proxy store's session, shareable across processes.
//! Exports: `SharedList`.
//! Role: The mutable shared container a private attribute can hold by handle.
//! Invariants: Appends from any handle to the same list are visible to every other handle.
#![allow(clippy::result_large_err)]

use std::sync::Arc;

use serde_json::Value;

use crate::core::error::{Error, ErrorKind};
use crate::core::session::Session;
use crate::core::state::ListRef;

#[derive(Clone)]
pub struct SharedList {
    session: Arc<Session>,
    handle: ListRef,
}

impl SharedList {
    pub(crate) fn new(session: Arc<Session>, handle: ListRef) -> Self {
        Self { session, handle }
    }

    pub fn handle(&self) -> &ListRef {
        &self.handle
    }

    /// Encodes the handle so it can be stored as an attribute value.
    pub fn to_value(&self) -> Value {
        self.handle.to_value()
    }

    pub fn push(&self, value: impl Into<Value>) -> Result<(), Error> {
        let value = value.into();
        self.session.update(|state| {
            state
                .list_mut(self.handle.id)
                .map(|items| items.push(value))
                .ok_or_else(|| self.missing())
        })
    }

    pub fn items(&self) -> Result<Vec<Value>, Error> {
        self.session
            .read(|state| state.list(self.handle.id).cloned().ok_or_else(|| self.missing()))
    }

    pub fn len(&self) -> Result<usize, Error> {
        self.session
            .read(|state| state.list(self.handle.id).map(Vec::len).ok_or_else(|| self.missing()))
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    fn missing(&self) -> Error {
        Error::new(ErrorKind::NotFound)
            .with_message(format!("shared list {} not found", self.handle.id))
            .with_path(&self.handle.session)
    }
}
