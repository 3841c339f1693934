// Session files: header validation, mmap'd JSON body, and per-call cross-process locking.
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{Error, ErrorKind};

const MAGIC: [u8; 4] = *b"PATR";
const VERSION: u32 = 1;
const ENDIANNESS_LE: u8 = 1;
pub const HEADER_SIZE: usize = 64;
pub const MIN_FILE_SIZE: u64 = 64 * 1024;

pub type Attrs = BTreeMap<String, Value>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionHeader {
    pub file_size: u64,
    pub body_len: u64,
}

impl SessionHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8] = ENDIANNESS_LE;

        write_u64(&mut buf, 16, self.file_size);
        write_u64(&mut buf, 24, self.body_len);

        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("header too small"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad magic"));
        }
        let version = u32::from_le_bytes(read_4(buf, 4));
        if version != VERSION {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported version"));
        }
        if buf[8] != ENDIANNESS_LE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported endianness"));
        }

        Ok(Self {
            file_size: read_u64(buf, 16),
            body_len: read_u64(buf, 24),
        })
    }

    fn validate(&self, actual_file_size: u64) -> Result<(), Error> {
        if self.file_size == 0 || self.file_size > actual_file_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid file size"));
        }
        let body_end = (HEADER_SIZE as u64)
            .checked_add(self.body_len)
            .ok_or_else(|| Error::new(ErrorKind::Corrupt).with_message("body length overflows"))?;
        if body_end > self.file_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message("body exceeds file size"));
        }
        Ok(())
    }
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Every object a session hands out: dicts of named values and append-only lists.
///
/// Dicts listed in `refs` are counted: they are removed with their last reference. Root
/// tables carry no count and live as long as the session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub created_at: String,
    pub next_id: u64,
    pub dicts: BTreeMap<u64, Attrs>,
    pub lists: BTreeMap<u64, Vec<Value>>,
    #[serde(default)]
    pub refs: BTreeMap<u64, u64>,
}

impl SessionState {
    fn new(created_at: String) -> Self {
        Self {
            created_at,
            next_id: 1,
            ..Self::default()
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn new_dict(&mut self) -> u64 {
        self.new_dict_with(Attrs::new())
    }

    pub fn new_dict_with(&mut self, attrs: Attrs) -> u64 {
        let id = self.alloc_id();
        self.dicts.insert(id, attrs);
        id
    }

    /// Allocates a counted dict holding one reference.
    pub fn new_owned_dict(&mut self, attrs: Attrs) -> u64 {
        let id = self.new_dict_with(attrs);
        self.refs.insert(id, 1);
        id
    }

    /// Adds a reference to a dict; `None` when the dict no longer exists.
    pub fn retain(&mut self, id: u64) -> Option<u64> {
        if !self.dicts.contains_key(&id) {
            return None;
        }
        let count = self.refs.entry(id).or_insert(0);
        *count += 1;
        Some(*count)
    }

    /// Drops one reference. Returns `true` when that was the last one and the dict is gone.
    pub fn release(&mut self, id: u64) -> bool {
        let Some(count) = self.refs.get_mut(&id) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count > 0 {
            return false;
        }
        self.refs.remove(&id);
        self.dicts.remove(&id);
        true
    }

    pub fn new_list(&mut self) -> u64 {
        let id = self.alloc_id();
        self.lists.insert(id, Vec::new());
        id
    }

    pub fn dict(&self, id: u64) -> Option<&Attrs> {
        self.dicts.get(&id)
    }

    pub fn dict_mut(&mut self, id: u64) -> Option<&mut Attrs> {
        self.dicts.get_mut(&id)
    }

    pub fn list(&self, id: u64) -> Option<&Vec<Value>> {
        self.lists.get(&id)
    }

    pub fn list_mut(&mut self, id: u64) -> Option<&mut Vec<Value>> {
        self.lists.get_mut(&id)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionInfo {
    pub path: PathBuf,
    pub file_size: u64,
    pub body_len: u64,
    pub created_at: String,
    pub next_id: u64,
    pub dict_count: usize,
    pub list_count: usize,
}

struct SessionFile {
    file: File,
    mmap: MmapMut,
}

/// One shared-object session backed by a file on this host.
///
/// Each `read`/`update` call takes the in-process mutex and the file lock, so a single call is
/// atomic across processes. Sequences of calls are not.
pub struct Session {
    path: PathBuf,
    owner: bool,
    inner: Mutex<SessionFile>,
}

impl Session {
    pub fn create(path: impl AsRef<Path>, initial_size: u64) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::new(io_error_kind(&err)).with_path(&path).with_source(err))?;

        let mmap = match initialize(&file, &path, initial_size) {
            Ok(mmap) => mmap,
            Err(err) => {
                drop(file);
                if let Err(remove_err) = std::fs::remove_file(&path) {
                    tracing::warn!(
                        path = %path.display(),
                        error = %remove_err,
                        "failed to remove half-created session file"
                    );
                }
                return Err(err);
            }
        };
        tracing::debug!(path = %path.display(), file_size = mmap.len(), "created session");

        Ok(Self {
            path,
            owner: true,
            inner: Mutex::new(SessionFile { file, mmap }),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::new(io_error_kind(&err)).with_path(&path).with_source(err))?;

        let lock = FileLock::shared(&file, &path)?;
        let actual_size = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
        if actual_size < HEADER_SIZE as u64 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("file too small for session header")
                .with_path(&path));
        }

        let mmap = map(&file, &path)?;
        let header = SessionHeader::decode(&mmap[..HEADER_SIZE])
            .map_err(|err| err.with_path(&path))?;
        header
            .validate(actual_size)
            .map_err(|err| err.with_path(&path))?;
        drop(lock);

        Ok(Self {
            path,
            owner: false,
            inner: Mutex::new(SessionFile { file, mmap }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn read<R>(
        &self,
        f: impl FnOnce(&SessionState) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut inner = self.lock_inner()?;
        let SessionFile { file, mmap } = &mut *inner;
        let _lock = FileLock::shared(file, &self.path)?;
        remap_if_resized(file, mmap, &self.path)?;
        let (_, state) = load_state(mmap, &self.path)?;
        f(&state)
    }

    /// Applies `f` and writes the result back; nothing is written when `f` fails.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut SessionState) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut inner = self.lock_inner()?;
        let SessionFile { file, mmap } = &mut *inner;
        let _lock = FileLock::exclusive(file, &self.path)?;
        remap_if_resized(file, mmap, &self.path)?;
        let (_, mut state) = load_state(mmap, &self.path)?;
        let out = f(&mut state)?;
        store_state(file, mmap, &state, &self.path)?;
        Ok(out)
    }

    pub fn snapshot(&self) -> Result<SessionState, Error> {
        self.read(|state| Ok(state.clone()))
    }

    pub fn info(&self) -> Result<SessionInfo, Error> {
        let mut inner = self.lock_inner()?;
        let SessionFile { file, mmap } = &mut *inner;
        let _lock = FileLock::shared(file, &self.path)?;
        remap_if_resized(file, mmap, &self.path)?;
        let (header, state) = load_state(mmap, &self.path)?;
        Ok(SessionInfo {
            path: self.path.clone(),
            file_size: header.file_size,
            body_len: header.body_len,
            created_at: state.created_at,
            next_id: state.next_id,
            dict_count: state.dicts.len(),
            list_count: state.lists.len(),
        })
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, SessionFile>, Error> {
        self.inner.lock().map_err(|_| {
            Error::new(ErrorKind::Internal)
                .with_message("session mutex poisoned")
                .with_path(&self.path)
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to remove session file");
        }
    }
}

struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File, path: &Path) -> Result<Self, Error> {
        file.lock_exclusive()
            .map_err(|err| Error::new(lock_error_kind(&err)).with_path(path).with_source(err))?;
        Ok(Self { file })
    }

    fn shared(file: &'a File, path: &Path) -> Result<Self, Error> {
        FileExt::lock_shared(file)
            .map_err(|err| Error::new(lock_error_kind(&err)).with_path(path).with_source(err))?;
        Ok(Self { file })
    }
}

impl<'a> Drop for FileLock<'a> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(self.file);
    }
}

fn initialize(file: &File, path: &Path, initial_size: u64) -> Result<MmapMut, Error> {
    let _lock = FileLock::exclusive(file, path)?;
    file.set_len(initial_size.max(MIN_FILE_SIZE))
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;

    let mut mmap = map(file, path)?;
    let state = SessionState::new(now_rfc3339());
    store_state(file, &mut mmap, &state, path)?;
    Ok(mmap)
}

fn map(file: &File, path: &Path) -> Result<MmapMut, Error> {
    unsafe {
        MmapMut::map_mut(file)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))
    }
}

// Another process may have grown the file since our last call.
fn remap_if_resized(file: &File, mmap: &mut MmapMut, path: &Path) -> Result<(), Error> {
    let actual = file
        .metadata()
        .map(|meta| meta.len())
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    if actual != mmap.len() as u64 {
        *mmap = map(file, path)?;
    }
    Ok(())
}

fn load_state(mmap: &MmapMut, path: &Path) -> Result<(SessionHeader, SessionState), Error> {
    if mmap.len() < HEADER_SIZE {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("file too small for session header")
            .with_path(path));
    }
    let header = SessionHeader::decode(&mmap[..HEADER_SIZE]).map_err(|err| err.with_path(path))?;
    header
        .validate(mmap.len() as u64)
        .map_err(|err| err.with_path(path))?;
    let body = &mmap[HEADER_SIZE..HEADER_SIZE + header.body_len as usize];
    let state = serde_json::from_slice(body).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("invalid session body")
            .with_path(path)
            .with_source(err)
    })?;
    Ok((header, state))
}

fn store_state(
    file: &File,
    mmap: &mut MmapMut,
    state: &SessionState,
    path: &Path,
) -> Result<SessionHeader, Error> {
    let body = serde_json::to_vec(state).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode session body")
            .with_path(path)
            .with_source(err)
    })?;

    let needed = (HEADER_SIZE + body.len()) as u64;
    let mut file_size = mmap.len() as u64;
    if needed > file_size {
        file_size = grown_size(file_size, needed);
        file.set_len(file_size)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
        *mmap = map(file, path)?;
        tracing::debug!(path = %path.display(), file_size, "grew session file");
    }

    let header = SessionHeader {
        file_size,
        body_len: body.len() as u64,
    };
    mmap[HEADER_SIZE..HEADER_SIZE + body.len()].copy_from_slice(&body);
    mmap[..HEADER_SIZE].copy_from_slice(&header.encode());
    Ok(header)
}

fn grown_size(current: u64, needed: u64) -> u64 {
    let mut size = current.max(MIN_FILE_SIZE);
    while size < needed {
        size *= 2;
    }
    size
}

fn now_rfc3339() -> String {
    use time::format_description::well_known::Rfc3339;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i128)
        .unwrap_or_default();
    time::OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|ts| ts.format(&Rfc3339).ok())
        .unwrap_or_default()
}

fn io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}
