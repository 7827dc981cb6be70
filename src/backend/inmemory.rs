//! In-memory key-value backend.
//!
//! Behaves like the etcd backend (exact get, descending prefix list, prefix
//! watch) so that code written against [`Backend`](super::Backend) can run
//! without a live cluster.

use super::{
    types::{Command, KVPair, KVPairs, Key, KeyRef, Responses, Value},
    WATCH_CAPACITY,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
pub struct Actor {
    data: BTreeMap<Key, Value>,
    watchers: Vec<(Key, mpsc::UnboundedSender<Value>)>,
    commands: mpsc::Receiver<Command>,
}

#[derive(Debug, Clone)]
pub struct Store {
    commands: mpsc::Sender<Command>,
}

pub fn start() -> Store {
    let (tx, rx) = mpsc::channel(32);

    let actor = Actor {
        data: BTreeMap::new(),
        watchers: Vec::new(),
        commands: rx,
    };

    tokio::spawn(actor.start());

    Store { commands: tx }
}

#[async_trait]
impl super::Backend for Store {
    type Err = anyhow::Error;

    async fn get<'k>(&self, key: KeyRef<'k>) -> Result<Option<Value>, Self::Err> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Get {
                key: key.to_owned(),
                cb: tx,
            })
            .await
            .context("unable to send get command")?;
        rx.await.context("unable to access result of get command")
    }

    async fn list<'k>(&self, prefix: KeyRef<'k>) -> Result<KVPairs, Self::Err> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::List {
                prefix: prefix.to_owned(),
                cb: tx,
            })
            .await
            .context("unable to send list command")?;
        rx.await.context("unable to access result of list command")
    }

    async fn set(&mut self, key: Key, value: Value) -> Result<(), Self::Err> {
        self.commands
            .send(Command::Set { key, value })
            .await
            .context("unable to send set command")
    }

    fn watch<'k>(&self, prefix: KeyRef<'k>, stop: CancellationToken) -> Responses<Self::Err> {
        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        let (events_tx, events) = mpsc::unbounded_channel();

        // Registering eagerly keeps the watch ordered before any later set.
        let pending = match self.commands.try_send(Command::Watch {
            prefix: prefix.to_owned(),
            events: events_tx,
        }) {
            Ok(()) => None,
            Err(TrySendError::Full(command)) => Some(command),
            Err(TrySendError::Closed(_)) => {
                let _ = tx.try_send(Err(anyhow!("unable to send watch command")));
                return rx;
            }
        };

        let commands = self.commands.clone();
        tokio::spawn(async move {
            if let Some(command) = pending {
                if commands.send(command).await.is_err() {
                    let _ = tx.send(Err(anyhow!("unable to send watch command"))).await;
                    return;
                }
            }
            forward(events, tx, stop).await
        });

        rx
    }
}

async fn forward(
    mut events: mpsc::UnboundedReceiver<Value>,
    tx: mpsc::Sender<Result<Value>>,
    stop: CancellationToken,
) {
    loop {
        let value = tokio::select! {
            _ = stop.cancelled() => break,
            _ = tx.closed() => break,
            event = events.recv() => match event {
                Some(value) => value,
                None => break,
            },
        };

        tokio::select! {
            _ = stop.cancelled() => break,
            sent = tx.send(Ok(value)) => if sent.is_err() { break },
        }
    }
    debug!("in-memory watch stopped");
}

impl Actor {
    pub async fn start(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Get { key, cb } => {
                    let value = self.data.get(&key).map(Value::clone);
                    let _ = cb.send(value);
                }
                Command::List { prefix, cb } => {
                    let _ = cb.send(self.list(&prefix));
                }
                Command::Set { key, value } => {
                    self.notify(&key, &value);
                    self.data.insert(key, value);
                }
                Command::Watch { prefix, events } => {
                    self.watchers.push((prefix, events));
                }
            }
        }
    }

    fn list(&self, prefix: KeyRef<'_>) -> KVPairs {
        let mut pairs: KVPairs = self
            .data
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KVPair::new(key.clone(), value.clone()))
            .collect();
        pairs.reverse();
        pairs
    }

    fn notify(&mut self, key: KeyRef<'_>, value: &Value) {
        self.watchers.retain(|(prefix, events)| {
            if events.is_closed() {
                false
            } else if key.starts_with(prefix.as_str()) {
                events.send(value.clone()).is_ok()
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn value(v: &'static str) -> Value {
        Bytes::from_static(v.as_bytes())
    }

    #[tokio::test]
    async fn get_returns_none_for_missing_key() {
        // Pre-condition.
        let store = start();

        // Action.
        let got = store.get("/missing").await.unwrap();

        // Post-condition.
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn get_returns_value_previously_set() {
        // Pre-condition.
        let mut store = start();
        store.set("/app/port".into(), value("8080")).await.unwrap();

        // Action.
        let got = store.get("/app/port").await.unwrap();

        // Post-condition.
        assert_eq!(got, Some(value("8080")));
    }

    #[tokio::test]
    async fn list_returns_prefixed_pairs_in_descending_order() {
        // Pre-condition.
        let mut store = start();
        for key in &["/app/a", "/app/c", "/other/x", "/app/b", "/ap"] {
            store.set((*key).into(), value("v")).await.unwrap();
        }

        // Action.
        let pairs = store.list("/app/").await.unwrap();

        // Post-condition.
        let keys: Vec<_> = pairs.iter().map(|pair| pair.key.as_str()).collect();
        assert_eq!(keys, vec!["/app/c", "/app/b", "/app/a"]);
    }

    #[tokio::test]
    async fn list_is_empty_when_nothing_matches() {
        // Pre-condition.
        let mut store = start();
        store.set("/other".into(), value("v")).await.unwrap();

        // Action.
        let pairs = store.list("/app").await.unwrap();

        // Post-condition.
        assert!(pairs.is_empty());
    }

    #[tokio::test]
    async fn watch_forwards_changes_under_prefix() {
        // Pre-condition.
        let mut store = start();
        let stop = CancellationToken::new();
        let mut responses = store.watch("/app", stop.clone());

        // Action.
        store.set("/other".into(), value("ignored")).await.unwrap();
        store.set("/app/a".into(), value("1")).await.unwrap();
        store.set("/app/b".into(), value("2")).await.unwrap();

        // Post-condition.
        let first = responses.recv().await.unwrap().unwrap();
        let second = responses.recv().await.unwrap().unwrap();
        assert_eq!(first, value("1"));
        assert_eq!(second, value("2"));
        stop.cancel();
    }

    #[tokio::test]
    async fn watch_closes_channel_once_stopped() {
        // Pre-condition.
        let store = start();
        let stop = CancellationToken::new();
        let mut responses = store.watch("/app", stop.clone());

        // Action.
        stop.cancel();

        // Post-condition.
        let next = timeout(Duration::from_secs(1), responses.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn watch_ends_once_receiver_is_dropped_on_quiet_prefix() {
        // Pre-condition.
        let (events_tx, events) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        let task = tokio::spawn(forward(events, tx, CancellationToken::new()));

        // Action.
        drop(rx);

        // Post-condition.
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(events_tx.is_closed(), "watcher is pruned on the next set");
    }

    #[tokio::test]
    async fn dropped_watch_does_not_affect_others() {
        // Pre-condition.
        let mut store = start();
        let dropped = store.watch("/app", CancellationToken::new());
        let stop = CancellationToken::new();
        let mut responses = store.watch("/app", stop.clone());
        drop(dropped);

        // Action.
        store.set("/app/a".into(), value("1")).await.unwrap();

        // Post-condition.
        let next = timeout(Duration::from_secs(1), responses.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(next, value("1"));
        stop.cancel();
    }

    proptest! {
        #[test]
        fn list_only_returns_prefixed_keys_descending(
            keys in proptest::collection::vec("[a-c]{1,4}", 0..16),
            prefix in "[a-c]{0,2}",
        ) {
            // Pre-condition.
            let rt = tokio::runtime::Runtime::new().unwrap();

            // Action.
            let pairs = rt.block_on(async {
                let mut store = start();
                for key in &keys {
                    store.set(key.clone(), value("v")).await.unwrap();
                }
                store.list(&prefix).await.unwrap()
            });

            // Post-condition.
            let mut expected: Vec<_> = keys
                .iter()
                .filter(|key| key.starts_with(prefix.as_str()))
                .cloned()
                .collect();
            expected.sort();
            expected.dedup();
            expected.reverse();
            let listed: Vec<_> = pairs.into_iter().map(|pair| pair.key).collect();
            prop_assert_eq!(listed, expected);
        }
    }
}
