//! Purpose: Public private-attribute store: per-instance and per-type tables behind one handle.
//! Exports: `Store`, `StoreOptions`, `OnMissing`, `Accessor`, `Scope`, `scope_of`, `STATIC_SUFFIX`.
//! Role: The only path to a type's private tables; nothing else holds a reference to them.
//! Invariants: An instance must be registered before its first `set_private_attr`.
//! Invariants: `delete` and the `del_*` family never fail; failures are logged and dropped.
//! Invariants: Proxy stores give per-call atomicity only; read-then-write sequences can race.
#![allow(clippy::result_large_err)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use super::list::SharedList;
use crate::core::backend::{Backend, LocalBackend, Lookup, SessionCache, SharedBackend};
use crate::core::error::{Error, ErrorKind};
use crate::core::key::Instance;
use crate::core::session::{MIN_FILE_SIZE, Session};
use crate::core::state::{ListRef, TransferState};
use crate::session_paths::{default_session_dir, next_session_path};

pub const STATIC_SUFFIX: &str = "_static";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope {
    Instance,
    Static,
}

/// Names ending in `_static` live in the per-type table; everything else is per-instance.
pub fn scope_of(name: &str) -> Scope {
    if name.ends_with(STATIC_SUFFIX) {
        Scope::Static
    } else {
        Scope::Instance
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OnMissing {
    Raise,
    Default(Value),
}

#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub proxy: bool,
    pub session_dir: Option<PathBuf>,
    pub initial_size: u64,
    pub owner: Option<String>,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self {
            proxy: false,
            session_dir: None,
            initial_size: MIN_FILE_SIZE,
            owner: None,
        }
    }

    pub fn proxy() -> Self {
        Self::new().with_proxy(true)
    }

    pub fn with_proxy(mut self, proxy: bool) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = Some(dir.into());
        self
    }

    pub fn with_initial_size(mut self, size: u64) -> Self {
        self.initial_size = size;
        self
    }

    /// Type label used in static-attribute error messages.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Store {
    backend: Box<dyn Backend>,
    session: Option<Arc<Session>>,
    sessions: Arc<SessionCache>,
    owner: Option<String>,
}

impl Store {
    pub fn create(proxy: bool) -> Result<Self, Error> {
        Self::with_options(StoreOptions::new().with_proxy(proxy))
    }

    pub fn local() -> Self {
        let sessions = Arc::new(SessionCache::default());
        Self {
            backend: Box::new(LocalBackend::new(Arc::clone(&sessions))),
            session: None,
            sessions,
            owner: None,
        }
    }

    pub fn with_options(options: StoreOptions) -> Result<Self, Error> {
        if !options.proxy {
            let mut store = Self::local();
            store.owner = options.owner;
            return Ok(store);
        }

        let dir = options.session_dir.unwrap_or_else(default_session_dir);
        std::fs::create_dir_all(&dir).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to create session directory")
                .with_path(&dir)
                .with_source(err)
        })?;

        let session = Arc::new(Session::create(
            next_session_path(&dir),
            options.initial_size,
        )?);
        let sessions = Arc::new(SessionCache::default());
        let backend = SharedBackend::create(Arc::clone(&session), Arc::clone(&sessions))?;
        tracing::debug!(path = %session.path().display(), "created proxy store");

        Ok(Self {
            backend: Box::new(backend),
            session: Some(session),
            sessions,
            owner: options.owner,
        })
    }

    pub fn is_proxy(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_path(&self) -> Option<&Path> {
        self.session.as_deref().map(Session::path)
    }

    pub fn register_instance<I: Instance + ?Sized>(&self, instance: &I) -> Result<(), Error> {
        let key = instance.instance_key();
        if self.backend.register(key)? {
            tracing::debug!(%key, type_name = instance.type_name(), "registered instance");
        }
        Ok(())
    }

    pub fn is_registered<I: Instance + ?Sized>(&self, instance: &I) -> Result<bool, Error> {
        self.backend.contains(instance.instance_key())
    }

    /// Drops the instance's entry. Safe to call twice or on instances never registered.
    pub fn delete<I: Instance + ?Sized>(&self, instance: &I) {
        let key = instance.instance_key();
        match self.backend.unregister(key) {
            Ok(true) => tracing::debug!(%key, "deleted instance entry"),
            Ok(false) => {}
            Err(err) => tracing::warn!(%key, error = %err, "failed to delete instance entry"),
        }
    }

    pub fn get_private_attr<I: Instance + ?Sized>(
        &self,
        name: &str,
        instance: &I,
    ) -> Result<Value, Error> {
        self.get_private_attr_with(name, instance, OnMissing::Raise)
    }

    pub fn get_private_attr_or<I: Instance + ?Sized>(
        &self,
        name: &str,
        instance: &I,
        default: impl Into<Value>,
    ) -> Result<Value, Error> {
        self.get_private_attr_with(name, instance, OnMissing::Default(default.into()))
    }

    pub fn get_private_attr_with<I: Instance + ?Sized>(
        &self,
        name: &str,
        instance: &I,
        on_missing: OnMissing,
    ) -> Result<Value, Error> {
        let lookup = self.backend.get(instance.instance_key(), name)?;
        let missing = match lookup {
            Lookup::Found(value) => return Ok(value),
            Lookup::MissingAttr => missing_private(instance.type_name(), name),
            Lookup::MissingInstance => missing_private(instance.type_name(), name)
                .with_hint("The instance was never registered with this store."),
        };
        match on_missing {
            OnMissing::Raise => Err(missing),
            OnMissing::Default(value) => Ok(value),
        }
    }

    pub fn set_private_attr<I: Instance + ?Sized>(
        &self,
        name: &str,
        value: impl Into<Value>,
        instance: &I,
    ) -> Result<(), Error> {
        if self
            .backend
            .set(instance.instance_key(), name, value.into())?
        {
            return Ok(());
        }
        Err(missing_private(instance.type_name(), name)
            .with_hint("Call register_instance from the constructor before setting private attributes."))
    }

    pub fn del_private_attr<I: Instance + ?Sized>(&self, name: &str, instance: &I) {
        let key = instance.instance_key();
        if let Err(err) = self.backend.remove(key, name) {
            tracing::warn!(%key, name, error = %err, "failed to delete private attribute");
        }
    }

    pub fn get_static_private_attr(&self, name: &str) -> Result<Value, Error> {
        self.get_static_private_attr_with(name, OnMissing::Raise)
    }

    pub fn get_static_private_attr_or(
        &self,
        name: &str,
        default: impl Into<Value>,
    ) -> Result<Value, Error> {
        self.get_static_private_attr_with(name, OnMissing::Default(default.into()))
    }

    pub fn get_static_private_attr_with(
        &self,
        name: &str,
        on_missing: OnMissing,
    ) -> Result<Value, Error> {
        match (self.backend.get_static(name)?, on_missing) {
            (Some(value), _) => Ok(value),
            (None, OnMissing::Default(value)) => Ok(value),
            (None, OnMissing::Raise) => Err(self.missing_static(name)),
        }
    }

    pub fn set_static_private_attr(&self, name: &str, value: impl Into<Value>) -> Result<(), Error> {
        self.backend.set_static(name, value.into())
    }

    pub fn del_static_private_attr(&self, name: &str) {
        if let Err(err) = self.backend.remove_static(name) {
            tracing::warn!(name, error = %err, "failed to delete static private attribute");
        }
    }

    /// Binds an instance so names route by suffix without repeating the instance.
    pub fn attrs<'a, I: Instance + ?Sized>(&'a self, instance: &'a I) -> Accessor<'a, I> {
        Accessor {
            store: self,
            instance,
        }
    }

    pub fn getstate<I: Instance + ?Sized>(&self, instance: &I) -> Result<TransferState, Error> {
        let key = instance.instance_key();
        let state = self.backend.export(key)?.ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message(format!(
                    "'{}' object has no private state to transfer",
                    instance.type_name()
                ))
                .with_hint("The instance was never registered with this store.")
        })?;
        tracing::debug!(%key, "exported private state");
        Ok(state)
    }

    pub fn setstate<I: Instance + ?Sized>(
        &self,
        state: TransferState,
        instance: &I,
    ) -> Result<(), Error> {
        let key = instance.instance_key();
        let original = state.key;
        self.backend.import(key, state)?;
        tracing::debug!(%key, %original, "imported private state");
        Ok(())
    }

    /// Allocates a list inside this store's session; only proxy stores have one.
    pub fn new_list(&self) -> Result<SharedList, Error> {
        let session = self.session.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("shared lists require a proxy store")
                .with_hint("Create the store with proxy enabled.")
        })?;
        let id = session.update(|state| Ok(state.new_list()))?;
        let handle = ListRef {
            session: session.path().to_path_buf(),
            id,
        };
        Ok(SharedList::new(Arc::clone(session), handle))
    }

    /// Resolves a value produced by `SharedList::to_value`, possibly from another process.
    pub fn open_list(&self, value: &Value) -> Result<SharedList, Error> {
        let handle = ListRef::from_value(value)?;
        let session = self.sessions.resolve(&handle.session)?;
        Ok(SharedList::new(session, handle))
    }

    fn missing_static(&self, name: &str) -> Error {
        let message = match &self.owner {
            Some(owner) => format!("'{owner}' has no private static attribute '{name}'"),
            None => format!("this type has no private static attribute '{name}'"),
        };
        Error::new(ErrorKind::NotFound).with_message(message)
    }
}

fn missing_private(type_name: &str, name: &str) -> Error {
    Error::new(ErrorKind::NotFound)
        .with_message(format!("'{type_name}' object has no private attribute '{name}'"))
}

pub struct Accessor<'a, I: Instance + ?Sized> {
    store: &'a Store,
    instance: &'a I,
}

impl<'a, I: Instance + ?Sized> Accessor<'a, I> {
    pub fn scope(&self, name: &str) -> Scope {
        scope_of(name)
    }

    pub fn get(&self, name: &str) -> Result<Value, Error> {
        match scope_of(name) {
            Scope::Static => self.store.get_static_private_attr(name),
            Scope::Instance => self.store.get_private_attr(name, self.instance),
        }
    }

    pub fn get_or(&self, name: &str, default: impl Into<Value>) -> Result<Value, Error> {
        match scope_of(name) {
            Scope::Static => self.store.get_static_private_attr_or(name, default),
            Scope::Instance => self.store.get_private_attr_or(name, self.instance, default),
        }
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<(), Error> {
        match scope_of(name) {
            Scope::Static => self.store.set_static_private_attr(name, value),
            Scope::Instance => self.store.set_private_attr(name, value, self.instance),
        }
    }

    pub fn del(&self, name: &str) {
        match scope_of(name) {
            Scope::Static => self.store.del_static_private_attr(name),
            Scope::Instance => self.store.del_private_attr(name, self.instance),
        }
    }
}
