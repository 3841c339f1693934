// Handles to session objects and the state snapshot carried across process boundaries.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::error::{Error, ErrorKind};
use crate::core::key::InstanceKey;
use crate::core::session::Attrs;

const LIST_MARKER: &str = "$shared_list";

/// A dict living in some session file, addressable from any process on the host.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DictRef {
    pub session: PathBuf,
    pub id: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ListRef {
    pub session: PathBuf,
    pub id: u64,
}

impl ListRef {
    pub fn to_value(&self) -> Value {
        json!({ "$shared_list": { "session": self.session, "id": self.id } })
    }

    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let inner = value
            .as_object()
            .filter(|object| object.len() == 1)
            .and_then(|object| object.get(LIST_MARKER))
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage).with_message("value is not a shared list handle")
            })?;
        serde_json::from_value(inner.clone()).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("malformed shared list handle")
                .with_source(err)
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PrivateState {
    /// By-value snapshot; later changes on either side stay local.
    Inline(Attrs),
    Shared(DictRef),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StaticState {
    Inline(Attrs),
    Shared(DictRef),
}

/// Everything `setstate` needs to rebuild an instance's private view on the receiving side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferState {
    pub key: InstanceKey,
    pub private: PrivateState,
    pub statics: StaticState,
}

impl TransferState {
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode transfer state")
                .with_source(err)
        })
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("invalid transfer state")
                .with_source(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{DictRef, ListRef, PrivateState, StaticState, TransferState};
    use crate::core::error::ErrorKind;
    use crate::core::key::InstanceKey;
    use crate::core::session::Attrs;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn list_handle_is_recognized_inside_values() {
        let handle = ListRef {
            session: PathBuf::from("/tmp/s.pattrs"),
            id: 7,
        };
        let value = handle.to_value();
        assert_eq!(value["$shared_list"]["id"], json!(7));
        assert_eq!(ListRef::from_value(&value).expect("handle"), handle);
    }

    #[test]
    fn plain_values_are_not_list_handles() {
        for value in [json!([1, 2]), json!({"id": 1}), json!(null)] {
            let err = ListRef::from_value(&value).expect_err("not a handle");
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
    }

    #[test]
    fn transfer_state_survives_json() {
        let mut attrs = Attrs::new();
        attrs.insert("ssn".to_string(), json!(123));
        let state = TransferState {
            key: InstanceKey::mint(),
            private: PrivateState::Inline(attrs),
            statics: StaticState::Shared(DictRef {
                session: PathBuf::from("/tmp/s.pattrs"),
                id: 2,
            }),
        };
        let text = state.to_json().expect("encode");
        assert_eq!(TransferState::from_json(&text).expect("decode"), state);
    }

    #[test]
    fn garbage_transfer_state_is_corrupt() {
        let err = TransferState::from_json("{\"key\":1}").expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
