use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

pub type Key = String;
pub type KeyRef<'a> = &'a str;
pub type Value = Bytes;

/// A key mapped to its opaque payload, as handed back by [`super::Backend::list`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KVPair {
    pub key: Key,
    pub value: Value,
}

pub type KVPairs = Vec<KVPair>;

/// Receiving end of a watch; closes once the watch stops.
pub type Responses<E> = mpsc::Receiver<Result<Value, E>>;

impl KVPair {
    pub fn new(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Builds a pair out of the raw bytes a store returns. Keys that are not
    /// valid UTF-8 are converted lossily.
    pub fn from_raw(key: &[u8], value: &[u8]) -> Self {
        Self {
            key: String::from_utf8_lossy(key).into_owned(),
            value: Bytes::copy_from_slice(value),
        }
    }
}

#[derive(Debug)]
pub(super) enum Command {
    Get {
        key: Key,
        cb: oneshot::Sender<Option<Value>>,
    },
    List {
        prefix: Key,
        cb: oneshot::Sender<KVPairs>,
    },
    Set {
        key: Key,
        value: Value,
    },
    Watch {
        prefix: Key,
        events: mpsc::UnboundedSender<Value>,
    },
}
