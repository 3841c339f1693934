// Table backends behind a store: in-process maps or session-resident shared dicts.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::core::error::{Error, ErrorKind};
use crate::core::key::InstanceKey;
use crate::core::session::{Attrs, Session};
use crate::core::state::{DictRef, PrivateState, StaticState, TransferState};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Lookup {
    Found(Value),
    MissingAttr,
    MissingInstance,
}

pub(crate) trait Backend: Send + Sync {
    /// Returns `true` when a new entry was created.
    fn register(&self, key: InstanceKey) -> Result<bool, Error>;
    /// Returns `true` when an entry was removed.
    fn unregister(&self, key: InstanceKey) -> Result<bool, Error>;
    fn contains(&self, key: InstanceKey) -> Result<bool, Error>;
    fn get(&self, key: InstanceKey, name: &str) -> Result<Lookup, Error>;
    /// Returns `false` when the instance has no entry.
    fn set(&self, key: InstanceKey, name: &str, value: Value) -> Result<bool, Error>;
    fn remove(&self, key: InstanceKey, name: &str) -> Result<(), Error>;
    fn get_static(&self, name: &str) -> Result<Option<Value>, Error>;
    fn set_static(&self, name: &str, value: Value) -> Result<(), Error>;
    fn remove_static(&self, name: &str) -> Result<(), Error>;
    fn export(&self, key: InstanceKey) -> Result<Option<TransferState>, Error>;
    fn import(&self, key: InstanceKey, state: TransferState) -> Result<(), Error>;
}

/// Sessions opened by one store, keyed by file path. Holds the store's own session too.
#[derive(Default)]
pub(crate) struct SessionCache {
    sessions: Mutex<HashMap<PathBuf, Arc<Session>>>,
}

impl SessionCache {
    pub(crate) fn insert(&self, session: Arc<Session>) -> Result<(), Error> {
        let mut sessions = lock(&self.sessions)?;
        sessions.insert(session.path().to_path_buf(), session);
        Ok(())
    }

    pub(crate) fn resolve(&self, path: &Path) -> Result<Arc<Session>, Error> {
        let mut sessions = lock(&self.sessions)?;
        if let Some(session) = sessions.get(path) {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(Session::open(path)?);
        tracing::debug!(path = %path.display(), "opened foreign session");
        sessions.insert(path.to_path_buf(), Arc::clone(&session));
        Ok(session)
    }

    fn read_dict(&self, dict: &DictRef) -> Result<Option<Attrs>, Error> {
        let session = self.resolve(&dict.session)?;
        session.read(|state| Ok(state.dict(dict.id).cloned()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, Error> {
    mutex
        .lock()
        .map_err(|_| Error::new(ErrorKind::Internal).with_message("table mutex poisoned"))
}

fn merge_missing(target: &mut Attrs, incoming: Attrs) {
    for (name, value) in incoming {
        target.entry(name).or_insert(value);
    }
}

type Entry = Arc<Mutex<Attrs>>;

pub(crate) struct LocalBackend {
    private: Mutex<HashMap<InstanceKey, Entry>>,
    statics: Mutex<Attrs>,
    sessions: Arc<SessionCache>,
}

impl LocalBackend {
    pub(crate) fn new(sessions: Arc<SessionCache>) -> Self {
        Self {
            private: Mutex::new(HashMap::new()),
            statics: Mutex::new(Attrs::new()),
            sessions,
        }
    }

    fn entry(&self, key: InstanceKey) -> Result<Option<Entry>, Error> {
        Ok(lock(&self.private)?.get(&key).cloned())
    }
}

impl Backend for LocalBackend {
    fn register(&self, key: InstanceKey) -> Result<bool, Error> {
        let mut private = lock(&self.private)?;
        if private.contains_key(&key) {
            return Ok(false);
        }
        private.insert(key, Arc::new(Mutex::new(Attrs::new())));
        Ok(true)
    }

    fn unregister(&self, key: InstanceKey) -> Result<bool, Error> {
        Ok(lock(&self.private)?.remove(&key).is_some())
    }

    fn contains(&self, key: InstanceKey) -> Result<bool, Error> {
        Ok(lock(&self.private)?.contains_key(&key))
    }

    fn get(&self, key: InstanceKey, name: &str) -> Result<Lookup, Error> {
        let Some(entry) = self.entry(key)? else {
            return Ok(Lookup::MissingInstance);
        };
        let attrs = lock(&entry)?;
        Ok(match attrs.get(name) {
            Some(value) => Lookup::Found(value.clone()),
            None => Lookup::MissingAttr,
        })
    }

    fn set(&self, key: InstanceKey, name: &str, value: Value) -> Result<bool, Error> {
        let Some(entry) = self.entry(key)? else {
            return Ok(false);
        };
        lock(&entry)?.insert(name.to_string(), value);
        Ok(true)
    }

    fn remove(&self, key: InstanceKey, name: &str) -> Result<(), Error> {
        if let Some(entry) = self.entry(key)? {
            lock(&entry)?.remove(name);
        }
        Ok(())
    }

    fn get_static(&self, name: &str) -> Result<Option<Value>, Error> {
        Ok(lock(&self.statics)?.get(name).cloned())
    }

    fn set_static(&self, name: &str, value: Value) -> Result<(), Error> {
        lock(&self.statics)?.insert(name.to_string(), value);
        Ok(())
    }

    fn remove_static(&self, name: &str) -> Result<(), Error> {
        lock(&self.statics)?.remove(name);
        Ok(())
    }

    fn export(&self, key: InstanceKey) -> Result<Option<TransferState>, Error> {
        let Some(entry) = self.entry(key)? else {
            return Ok(None);
        };
        let private = lock(&entry)?.clone();
        let statics = lock(&self.statics)?.clone();
        Ok(Some(TransferState {
            key,
            private: PrivateState::Inline(private),
            statics: StaticState::Inline(statics),
        }))
    }

    fn import(&self, key: InstanceKey, state: TransferState) -> Result<(), Error> {
        let incoming_statics = match state.statics {
            StaticState::Inline(attrs) => attrs,
            StaticState::Shared(dict) => self.sessions.read_dict(&dict)?.unwrap_or_default(),
        };

        {
            let mut private = lock(&self.private)?;
            let entry = match private.get(&state.key) {
                Some(existing) => Arc::clone(existing),
                None => match state.private {
                    PrivateState::Inline(attrs) => Arc::new(Mutex::new(attrs)),
                    PrivateState::Shared(_) => {
                        return Err(Error::new(ErrorKind::Usage)
                            .with_message("shared private state requires a proxy store")
                            .with_hint("Create the receiving store with proxy enabled."));
                    }
                },
            };
            private.insert(key, entry);
        }

        merge_missing(&mut *lock(&self.statics)?, incoming_statics);
        Ok(())
    }
}

pub(crate) struct SharedBackend {
    session: Arc<Session>,
    private_root: u64,
    static_root: u64,
    sessions: Arc<SessionCache>,
}

impl SharedBackend {
    pub(crate) fn create(session: Arc<Session>, sessions: Arc<SessionCache>) -> Result<Self, Error> {
        let (private_root, static_root) =
            session.update(|state| Ok((state.new_dict(), state.new_dict())))?;
        sessions.insert(Arc::clone(&session))?;
        Ok(Self {
            session,
            private_root,
            static_root,
            sessions,
        })
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn static_ref(&self) -> DictRef {
        DictRef {
            session: self.session.path().to_path_buf(),
            id: self.static_root,
        }
    }

    fn entry(&self, key: InstanceKey) -> Result<Option<DictRef>, Error> {
        let slot = self.session.read(|state| {
            Ok(root(state.dict(self.private_root), self.session.path())?
                .get(&key.as_table_key())
                .cloned())
        })?;
        slot.map(decode_slot).transpose()
    }

    fn read_entry<R>(&self, dict: &DictRef, f: impl FnOnce(&Attrs) -> R) -> Result<Option<R>, Error> {
        let session = self.sessions.resolve(&dict.session)?;
        session.read(|state| Ok(state.dict(dict.id).map(f)))
    }

    fn update_entry<R>(
        &self,
        dict: &DictRef,
        f: impl FnOnce(&mut Attrs) -> R,
    ) -> Result<Option<R>, Error> {
        let session = self.sessions.resolve(&dict.session)?;
        session.update(|state| Ok(state.dict_mut(dict.id).map(f)))
    }

    fn is_local(&self, dict: &DictRef) -> bool {
        dict.session.as_path() == self.session.path()
    }

    fn retain(&self, dict: &DictRef) -> Result<(), Error> {
        let session = self.sessions.resolve(&dict.session)?;
        match session.update(|state| Ok(state.retain(dict.id)))? {
            Some(_) => Ok(()),
            None => Err(vanished(dict)),
        }
    }

    /// Returns `true` when the last reference went and the dict was freed.
    fn release(&self, dict: &DictRef) -> Result<bool, Error> {
        let session = match self.sessions.resolve(&dict.session) {
            Ok(session) => session,
            // The owning session is gone and took the dict with it.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        session.update(|state| Ok(state.release(dict.id)))
    }
}

fn vanished(dict: &DictRef) -> Error {
    Error::new(ErrorKind::NotFound)
        .with_message("transferred private state no longer exists")
        .with_hint("Keep the sending instance alive until setstate has run.")
        .with_path(&dict.session)
}

fn root<'a>(dict: Option<&'a Attrs>, path: &Path) -> Result<&'a Attrs, Error> {
    dict.ok_or_else(|| {
        Error::new(ErrorKind::Corrupt)
            .with_message("session is missing a root table")
            .with_path(path)
    })
}

fn root_mut<'a>(dict: Option<&'a mut Attrs>, path: &Path) -> Result<&'a mut Attrs, Error> {
    dict.ok_or_else(|| {
        Error::new(ErrorKind::Corrupt)
            .with_message("session is missing a root table")
            .with_path(path)
    })
}

fn encode_slot(dict: &DictRef) -> Result<Value, Error> {
    serde_json::to_value(dict).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode dict handle")
            .with_source(err)
    })
}

fn decode_slot(value: Value) -> Result<DictRef, Error> {
    serde_json::from_value(value).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("invalid dict handle in private table")
            .with_source(err)
    })
}

impl Backend for SharedBackend {
    fn register(&self, key: InstanceKey) -> Result<bool, Error> {
        let path = self.session.path();
        let table_key = key.as_table_key();
        self.session.update(|state| {
            if root(state.dict(self.private_root), path)?.contains_key(&table_key) {
                return Ok(false);
            }
            let id = state.new_owned_dict(Attrs::new());
            let slot = encode_slot(&DictRef {
                session: path.to_path_buf(),
                id,
            })?;
            root_mut(state.dict_mut(self.private_root), path)?.insert(table_key, slot);
            Ok(true)
        })
    }

    fn unregister(&self, key: InstanceKey) -> Result<bool, Error> {
        let path = self.session.path();
        let table_key = key.as_table_key();
        let removed = self.session.update(|state| {
            let Some(slot) = root_mut(state.dict_mut(self.private_root), path)?.remove(&table_key)
            else {
                return Ok(None);
            };
            let dict = decode_slot(slot)?;
            if self.is_local(&dict) {
                state.release(dict.id);
                return Ok(Some(None));
            }
            Ok(Some(Some(dict)))
        })?;

        match removed {
            None => Ok(false),
            Some(None) => Ok(true),
            Some(Some(foreign)) => {
                if self.release(&foreign)? {
                    tracing::debug!(
                        session = %foreign.session.display(),
                        id = foreign.id,
                        "freed transferred instance dict"
                    );
                }
                Ok(true)
            }
        }
    }

    fn contains(&self, key: InstanceKey) -> Result<bool, Error> {
        Ok(self.entry(key)?.is_some())
    }

    fn get(&self, key: InstanceKey, name: &str) -> Result<Lookup, Error> {
        let Some(dict) = self.entry(key)? else {
            return Ok(Lookup::MissingInstance);
        };
        let found = self.read_entry(&dict, |attrs| attrs.get(name).cloned())?;
        Ok(match found {
            None => Lookup::MissingInstance,
            Some(None) => Lookup::MissingAttr,
            Some(Some(value)) => Lookup::Found(value),
        })
    }

    fn set(&self, key: InstanceKey, name: &str, value: Value) -> Result<bool, Error> {
        let Some(dict) = self.entry(key)? else {
            return Ok(false);
        };
        let written = self.update_entry(&dict, |attrs| {
            attrs.insert(name.to_string(), value);
        })?;
        Ok(written.is_some())
    }

    fn remove(&self, key: InstanceKey, name: &str) -> Result<(), Error> {
        if let Some(dict) = self.entry(key)? {
            self.update_entry(&dict, |attrs| {
                attrs.remove(name);
            })?;
        }
        Ok(())
    }

    fn get_static(&self, name: &str) -> Result<Option<Value>, Error> {
        let path = self.session.path();
        self.session
            .read(|state| Ok(root(state.dict(self.static_root), path)?.get(name).cloned()))
    }

    fn set_static(&self, name: &str, value: Value) -> Result<(), Error> {
        let path = self.session.path();
        self.session.update(|state| {
            root_mut(state.dict_mut(self.static_root), path)?.insert(name.to_string(), value);
            Ok(())
        })
    }

    fn remove_static(&self, name: &str) -> Result<(), Error> {
        let path = self.session.path();
        self.session.update(|state| {
            root_mut(state.dict_mut(self.static_root), path)?.remove(name);
            Ok(())
        })
    }

    fn export(&self, key: InstanceKey) -> Result<Option<TransferState>, Error> {
        let Some(dict) = self.entry(key)? else {
            return Ok(None);
        };
        Ok(Some(TransferState {
            key,
            private: PrivateState::Shared(dict),
            statics: StaticState::Shared(self.static_ref()),
        }))
    }

    fn import(&self, key: InstanceKey, state: TransferState) -> Result<(), Error> {
        let incoming_statics = match state.statics {
            StaticState::Inline(attrs) => attrs,
            StaticState::Shared(dict) if dict == self.static_ref() => Attrs::new(),
            StaticState::Shared(dict) => self.sessions.read_dict(&dict)?.unwrap_or_default(),
        };

        // A key this store already holds wins over whatever the state carries.
        let source = match self.entry(state.key)? {
            Some(known) => PrivateState::Shared(known),
            None => state.private,
        };
        let pinned = match &source {
            PrivateState::Shared(dict) if !self.is_local(dict) => {
                self.retain(dict)?;
                Some(dict.clone())
            }
            _ => None,
        };

        let path = self.session.path();
        let table_key = key.as_table_key();
        let installed = self.session.update(|session_state| {
            let dict = match source {
                PrivateState::Shared(dict) => {
                    if self.is_local(&dict) && session_state.retain(dict.id).is_none() {
                        return Err(vanished(&dict));
                    }
                    dict
                }
                PrivateState::Inline(attrs) => DictRef {
                    session: path.to_path_buf(),
                    id: session_state.new_owned_dict(attrs),
                },
            };
            let slot = encode_slot(&dict)?;
            let replaced =
                root_mut(session_state.dict_mut(self.private_root), path)?.insert(table_key, slot);
            merge_missing(
                root_mut(session_state.dict_mut(self.static_root), path)?,
                incoming_statics,
            );
            Ok(replaced)
        });

        let replaced = match installed {
            Ok(replaced) => replaced,
            Err(err) => {
                if let Some(dict) = pinned {
                    if let Err(release_err) = self.release(&dict) {
                        tracing::warn!(error = %release_err, "failed to unpin transferred dict");
                    }
                }
                return Err(err);
            }
        };
        if let Some(old) = replaced {
            self.release(&decode_slot(old)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Backend, LocalBackend, Lookup, SessionCache, SharedBackend};
    use crate::core::error::ErrorKind;
    use crate::core::key::InstanceKey;
    use crate::core::session::Session;
    use crate::core::state::PrivateState;
    use serde_json::json;
    use std::sync::Arc;

    fn shared_backend(dir: &tempfile::TempDir, name: &str) -> SharedBackend {
        let session = Session::create(dir.path().join(name), 0).expect("session");
        SharedBackend::create(Arc::new(session), Arc::new(SessionCache::default())).expect("backend")
    }

    #[test]
    fn local_register_is_idempotent() {
        let backend = LocalBackend::new(Arc::new(SessionCache::default()));
        let key = InstanceKey::mint();
        assert!(backend.register(key).expect("register"));
        assert!(backend.set(key, "ssn", json!(123)).expect("set"));
        assert!(!backend.register(key).expect("register again"));
        assert_eq!(backend.get(key, "ssn").expect("get"), Lookup::Found(json!(123)));
    }

    #[test]
    fn local_lookup_distinguishes_missing_instance() {
        let backend = LocalBackend::new(Arc::new(SessionCache::default()));
        let key = InstanceKey::mint();
        assert_eq!(backend.get(key, "x").expect("get"), Lookup::MissingInstance);
        assert!(!backend.set(key, "x", json!(1)).expect("set"));
        backend.register(key).expect("register");
        assert_eq!(backend.get(key, "x").expect("get"), Lookup::MissingAttr);
    }

    #[test]
    fn local_import_coalesces_known_keys() {
        let backend = LocalBackend::new(Arc::new(SessionCache::default()));
        let original = InstanceKey::mint();
        backend.register(original).expect("register");
        backend.set(original, "ssn", json!(1)).expect("set");
        let state = backend.export(original).expect("export").expect("state");

        let copy = InstanceKey::mint();
        backend.import(copy, state).expect("import");
        backend.set(copy, "ssn", json!(2)).expect("set");
        assert_eq!(backend.get(original, "ssn").expect("get"), Lookup::Found(json!(2)));
    }

    #[test]
    fn local_import_rejects_shared_private_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shared = shared_backend(&dir, "a.pattrs");
        let key = InstanceKey::mint();
        shared.register(key).expect("register");
        let state = shared.export(key).expect("export").expect("state");
        assert!(matches!(state.private, PrivateState::Shared(_)));

        let local = LocalBackend::new(Arc::new(SessionCache::default()));
        let err = local.import(InstanceKey::mint(), state).expect_err("usage");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn shared_register_allocates_one_dict_per_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = shared_backend(&dir, "b.pattrs");
        let key = InstanceKey::mint();
        assert!(backend.register(key).expect("register"));
        assert!(!backend.register(key).expect("register again"));
        let dicts = backend.session().snapshot().expect("snapshot").dicts.len();
        assert_eq!(dicts, 3);
    }

    #[test]
    fn shared_unregister_keeps_entry_dict_for_other_copies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = shared_backend(&dir, "c.pattrs");
        let key = InstanceKey::mint();
        backend.register(key).expect("register");
        backend.set(key, "ssn", json!(5)).expect("set");
        let state = backend.export(key).expect("export").expect("state");

        let copy = InstanceKey::mint();
        backend.import(copy, state).expect("import");
        assert!(backend.unregister(key).expect("unregister"));
        assert!(!backend.unregister(key).expect("unregister again"));
        assert_eq!(backend.get(copy, "ssn").expect("get"), Lookup::Found(json!(5)));

        assert!(backend.unregister(copy).expect("unregister copy"));
        assert_eq!(backend.session().info().expect("info").dict_count, 2);
    }

    #[test]
    fn shared_delete_frees_instance_dicts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = shared_backend(&dir, "f.pattrs");
        for round in 0..200 {
            let key = InstanceKey::mint();
            backend.register(key).expect("register");
            backend.set(key, "ssn", json!(round)).expect("set");
            assert!(backend.unregister(key).expect("unregister"));
        }
        let info = backend.session().info().expect("info");
        assert_eq!(info.dict_count, 2);
        assert!(backend.session().snapshot().expect("snapshot").refs.is_empty());
    }

    #[test]
    fn foreign_dict_lives_until_every_holder_lets_go() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sender = shared_backend(&dir, "g.pattrs");
        let receiver = shared_backend(&dir, "h.pattrs");

        let key = InstanceKey::mint();
        sender.register(key).expect("register");
        sender.set(key, "ssn", json!(7)).expect("set");
        let state = sender.export(key).expect("export").expect("state");

        let copy = InstanceKey::mint();
        receiver.import(copy, state).expect("import");
        assert_eq!(receiver.session().info().expect("info").dict_count, 2);

        assert!(sender.unregister(key).expect("unregister sender"));
        assert_eq!(receiver.get(copy, "ssn").expect("get"), Lookup::Found(json!(7)));
        assert_eq!(sender.session().info().expect("info").dict_count, 3);

        assert!(receiver.unregister(copy).expect("unregister receiver"));
        assert_eq!(sender.session().info().expect("info").dict_count, 2);
    }

    #[test]
    fn import_of_a_freed_dict_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sender = shared_backend(&dir, "i.pattrs");
        let receiver = shared_backend(&dir, "j.pattrs");

        let key = InstanceKey::mint();
        sender.register(key).expect("register");
        let state = sender.export(key).expect("export").expect("state");
        sender.unregister(key).expect("unregister");

        let copy = InstanceKey::mint();
        let err = receiver.import(copy, state).expect_err("freed");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!receiver.contains(copy).expect("contains"));
    }

    #[test]
    fn reimport_over_a_registered_key_releases_the_old_dict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = shared_backend(&dir, "k.pattrs");
        let original = InstanceKey::mint();
        backend.register(original).expect("register");
        let state = backend.export(original).expect("export").expect("state");

        let other = InstanceKey::mint();
        backend.register(other).expect("register other");
        assert_eq!(backend.session().info().expect("info").dict_count, 4);
        backend.import(other, state).expect("import");
        assert_eq!(backend.session().info().expect("info").dict_count, 3);
    }

    #[test]
    fn shared_import_merges_statics_first_writer_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sender = shared_backend(&dir, "d.pattrs");
        let receiver = shared_backend(&dir, "e.pattrs");

        let key = InstanceKey::mint();
        sender.register(key).expect("register");
        sender.set_static("surname_static", json!("Doe")).expect("set");
        sender.set_static("city_static", json!("Lima")).expect("set");
        receiver.set_static("surname_static", json!("Potter")).expect("set");

        let state = sender.export(key).expect("export").expect("state");
        receiver.import(key, state).expect("import");

        assert_eq!(
            receiver.get_static("surname_static").expect("get"),
            Some(json!("Potter"))
        );
        assert_eq!(receiver.get_static("city_static").expect("get"), Some(json!("Lima")));
    }
}
