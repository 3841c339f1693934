//! Purpose: Session-directory and session-file path helpers shared by the API and CLI.
//! Exports: `SESSION_DIR_ENV`, `default_session_dir`, `next_session_path`.
//! Role: Keep proxy-store session placement in one place.
//! Invariants: `$PRIVATE_ATTRS_DIR` wins over the default `<temp_dir>/private-attrs`.
//! Invariants: Generated names never repeat within a process and embed the process origin nonce.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::key::process_origin;

pub const SESSION_DIR_ENV: &str = "PRIVATE_ATTRS_DIR";
pub const SESSION_EXTENSION: &str = "pattrs";

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

pub fn default_session_dir() -> PathBuf {
    match std::env::var_os(SESSION_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir().join("private-attrs"),
    }
}

pub(crate) fn next_session_path(dir: &Path) -> PathBuf {
    let n = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(
        "session-{:016x}-{n}.{SESSION_EXTENSION}",
        process_origin()
    ))
}

#[cfg(test)]
mod tests {
    use super::{SESSION_EXTENSION, next_session_path};
    use std::path::Path;

    #[test]
    fn session_paths_are_unique_and_tagged() {
        let dir = Path::new("/tmp/sessions");
        let first = next_session_path(dir);
        let second = next_session_path(dir);
        assert_ne!(first, second);
        assert_eq!(first.parent(), Some(dir));
        assert_eq!(
            first.extension().and_then(|ext| ext.to_str()),
            Some(SESSION_EXTENSION)
        );
        let name = first.file_name().and_then(|name| name.to_str()).expect("name");
        assert!(name.starts_with("session-"));
    }
}
