//! etcd v3 backend.
//!
//! Every call is forwarded to the etcd client and bounded by a timeout; the
//! watch forwards the native event stream into a [`Responses`] channel.

use super::{
    types::{KVPair, KVPairs, Key, KeyRef, Responses, Value},
    WATCH_CAPACITY,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::{Client, GetOptions, SortOrder, SortTarget, WatchOptions, WatchResponse};
use futures::{Stream, StreamExt};
use std::{fmt::Display, future::Future, time::Duration};
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, span, Level};
use tracing_futures::Instrument;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// Upper bound for connecting and for every get/list/set.
    pub timeout: Duration,
}

impl EtcdConfig {
    pub fn new<I, E>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Clone)]
pub struct EtcdBackend {
    client: Client,
    timeout: Duration,
}

impl EtcdBackend {
    /// Connects to `endpoints` using [`DEFAULT_TIMEOUT`].
    pub async fn new<I, E>(endpoints: I) -> Result<Self>
    where
        I: IntoIterator<Item = E>,
        E: Into<String>,
    {
        Self::connect(EtcdConfig::new(endpoints)).await
    }

    pub async fn connect(config: EtcdConfig) -> Result<Self> {
        info!(endpoints = ?config.endpoints, "connecting to etcd");

        let client = within(
            config.timeout,
            "connect",
            Client::connect(&config.endpoints, None),
        )
        .await
        .context("creating new etcdv3 client for backend")?;

        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn get_within(&self, key: KeyRef<'_>, timeout: Duration) -> Result<Option<Value>> {
        debug!(key, "get");
        let mut client = self.client.clone();
        let what = format!("get {}", key);
        let resp = within(timeout, what, client.get(key, None)).await?;

        Ok(resp
            .kvs()
            .first()
            .map(|kv| Bytes::copy_from_slice(kv.value())))
    }

    pub async fn list_within(&self, prefix: KeyRef<'_>, timeout: Duration) -> Result<KVPairs> {
        debug!(prefix, "list");
        let mut client = self.client.clone();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Descend);
        let what = format!("list {}", prefix);
        let resp = within(timeout, what, client.get(prefix, Some(options))).await?;

        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KVPair::from_raw(kv.key(), kv.value()))
            .collect())
    }

    pub async fn set_within(&self, key: Key, value: Value, timeout: Duration) -> Result<()> {
        debug!(key = %key, len = value.len(), "set");
        let mut client = self.client.clone();
        let what = format!("set {}", key);
        within(timeout, what, client.put(key, value.to_vec(), None)).await?;
        Ok(())
    }

    /// Watches `prefix` until `stop` is cancelled, the returned receiver is
    /// dropped or etcd ends the stream. A failure is delivered as the last item.
    pub fn watch_with(&self, prefix: KeyRef<'_>, stop: CancellationToken) -> Responses<anyhow::Error> {
        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        let client = self.client.clone();
        let prefix = prefix.to_owned();
        let span = span!(Level::INFO, "watch", prefix = %prefix);

        tokio::spawn(
            async move {
                let outcome = forward(client, &prefix, &tx, &stop).await;
                finish(outcome, &tx, &stop).await
            }
            .instrument(span),
        );

        rx
    }
}

#[async_trait]
impl super::Backend for EtcdBackend {
    type Err = anyhow::Error;

    async fn get<'k>(&self, key: KeyRef<'k>) -> Result<Option<Value>, Self::Err> {
        self.get_within(key, self.timeout).await
    }

    async fn list<'k>(&self, prefix: KeyRef<'k>) -> Result<KVPairs, Self::Err> {
        self.list_within(prefix, self.timeout).await
    }

    async fn set(&mut self, key: Key, value: Value) -> Result<(), Self::Err> {
        self.set_within(key, value, self.timeout).await
    }

    fn watch<'k>(&self, prefix: KeyRef<'k>, stop: CancellationToken) -> Responses<Self::Err> {
        self.watch_with(prefix, stop)
    }
}

async fn forward(
    mut client: Client,
    prefix: &str,
    tx: &mpsc::Sender<Result<Value>>,
    stop: &CancellationToken,
) -> Result<()> {
    let options = WatchOptions::new().with_prefix();
    let (mut watcher, stream) = tokio::select! {
        _ = stop.cancelled() => return Ok(()),
        _ = tx.closed() => return Ok(()),
        watch = client.watch(prefix, Some(options)) => {
            watch.with_context(|| format!("unable to watch prefix {}", prefix))?
        }
    };
    debug!(watch_id = watcher.watch_id(), "watch established");

    let batches = stream.map(|message| message.context("watch stream failed").and_then(values));
    let outcome = relay(Box::pin(batches), tx, stop).await;

    if let Err(e) = watcher.cancel().await {
        debug!(reason = %e, "unable to cancel watcher");
    }
    outcome
}

/// Values carried by one watch response. Deletions carry an empty value.
fn values(resp: WatchResponse) -> Result<Vec<Value>> {
    if resp.canceled() {
        bail!("watch canceled by etcd: {}", resp.cancel_reason());
    }

    Ok(resp
        .events()
        .iter()
        .map(|event| {
            event
                .kv()
                .map(|kv| Bytes::copy_from_slice(kv.value()))
                .unwrap_or_default()
        })
        .collect())
}

/// Pushes every batch into `tx` until `stop` is cancelled, the receiver is
/// dropped or the batches run out.
async fn relay<S>(mut batches: S, tx: &mpsc::Sender<Result<Value>>, stop: &CancellationToken) -> Result<()>
where
    S: Stream<Item = Result<Vec<Value>>> + Unpin,
{
    loop {
        let batch = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            _ = tx.closed() => return Ok(()),
            next = batches.next() => match next {
                Some(batch) => batch?,
                None => return Ok(()),
            },
        };

        for value in batch {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                sent = tx.send(Ok(value)) => if sent.is_err() { return Ok(()) },
            }
        }
    }
}

/// Reports how the watch ended; a failure becomes the last item on `tx`.
async fn finish(outcome: Result<()>, tx: &mpsc::Sender<Result<Value>>, stop: &CancellationToken) {
    match outcome {
        Ok(()) => info!("watch stopped"),
        Err(e) => {
            error!(reason = %e, "watch failed");
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tx.send(Err(e)) => {}
            }
        }
    }
}

async fn within<F, T, E, W>(timeout: Duration, what: W, fut: F) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
    W: Display,
{
    match time::timeout(timeout, fut).await {
        Ok(res) => res.with_context(|| format!("{} failed", what)),
        Err(_) => bail!("{} timed out after {:?}", what, timeout),
    }
}
