//! Uniform backend interface through which remote configuration is fetched
//! and observed.

use self::types::{Key, KeyRef, Responses, Value};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub mod etcd;
pub mod inmemory;
pub mod types;

pub use self::types::{KVPair, KVPairs};

/// Capacity of the channel handed out by [`Backend::watch`].
pub const WATCH_CAPACITY: usize = 1;

#[async_trait]
pub trait Backend {
    type Err;

    async fn get<'k>(&self, key: KeyRef<'k>) -> Result<Option<Value>, Self::Err>;

    /// Lists every pair under `prefix`, ordered by key descending.
    async fn list<'k>(&self, prefix: KeyRef<'k>) -> Result<KVPairs, Self::Err>;

    async fn set(&mut self, key: Key, value: Value) -> Result<(), Self::Err>;

    /// Streams the value of every change under `prefix` until `stop` is
    /// cancelled or the receiver is dropped.
    fn watch<'k>(&self, prefix: KeyRef<'k>, stop: CancellationToken) -> Responses<Self::Err>;
}
