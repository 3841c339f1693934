// Instance keys: per-process origin nonce plus a monotonic sequence, never reused.
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use getrandom::fill as fill_random;
use serde::{Deserialize, Serialize};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);
static ORIGIN: OnceLock<u64> = OnceLock::new();

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct InstanceKey {
    origin: u64,
    seq: u64,
}

impl InstanceKey {
    /// Mints a key that no other live or dead instance in any process has held.
    pub fn mint() -> Self {
        Self {
            origin: process_origin(),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn as_table_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{}", self.origin, self.seq)
    }
}

pub(crate) fn process_origin() -> u64 {
    *ORIGIN.get_or_init(|| {
        let mut buf = [0u8; 8];
        if fill_random(&mut buf).is_ok() {
            return u64::from_le_bytes(buf);
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        nanos ^ ((std::process::id() as u64) << 32)
    })
}

/// Anything that owns private attributes in a store.
pub trait Instance {
    fn instance_key(&self) -> InstanceKey;

    /// Type label used in NotFound messages.
    fn type_name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl Instance for InstanceKey {
    fn instance_key(&self) -> InstanceKey {
        *self
    }

    fn type_name(&self) -> &str {
        "instance"
    }
}
