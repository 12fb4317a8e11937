use std::{fmt::Debug, hash::Hash, sync::Arc};

use futures::{Stream, TryStreamExt};
use kube_client::Api;
use kube_core::Resource;
use kube_runtime::{
    reflector::{store::Writer, ObjectRef, Store},
    watcher, WatchStreamExt,
};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use super::ResourceEventHandler;

/// Raised once the store has received its first complete listing.
#[derive(Clone)]
pub struct SyncSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for SyncSignal {
    fn default() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }
}

impl SyncSignal {
    pub fn has_synced(&self) -> bool {
        *self.tx.borrow()
    }

    fn mark(&self) {
        self.tx.send_if_modified(|synced| !std::mem::replace(synced, true));
    }

    /// Resolves once [`has_synced`](Self::has_synced) turns true.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in `self`, so this cannot observe a closed channel
        let _ = rx.wait_for(|synced| *synced).await;
    }
}

/// Watches all objects of type `K` visible to `api`, mirroring them into `writer`.
pub fn objects<K, H>(
    api: Api<K>,
    watcher_config: watcher::Config,
    writer: Writer<K>,
    handler: H,
    synced: SyncSignal,
) -> impl Stream<Item = Result<watcher::Event<K>, watcher::Error>>
where
    K: Resource + 'static + Debug + Clone + DeserializeOwned + Send + Sync,
    K::DynamicType: Clone + Default + Eq + Hash,
    H: ResourceEventHandler<K>,
{
    observe(
        writer,
        watcher(api, watcher_config).default_backoff(),
        handler,
        synced,
    )
}

/// Applies every watch event to `writer` and notifies `handler` about objects
/// the store did not know before the event.
///
/// The store is updated before the handler runs, so a handler that schedules a
/// cache lookup will always find the object it was told about.
pub fn observe<K, S, H>(
    mut writer: Writer<K>,
    events: S,
    handler: H,
    synced: SyncSignal,
) -> impl Stream<Item = Result<watcher::Event<K>, watcher::Error>>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Default + Eq + Hash,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
    H: ResourceEventHandler<K>,
{
    let store = writer.as_reader();

    events.map_ok(move |event| {
        let added: Vec<&K> = match &event {
            watcher::Event::Applied(obj) => {
                Some(obj).filter(|obj| !is_known(&store, obj)).into_iter().collect()
            }
            watcher::Event::Restarted(objs) => {
                objs.iter().filter(|obj| !is_known(&store, obj)).collect()
            }
            watcher::Event::Deleted(_) => Vec::new(),
        };

        writer.apply_watcher_event(&event);
        for obj in added {
            handler.on_add(obj);
        }

        if let watcher::Event::Restarted(_) = &event {
            synced.mark();
        }

        event
    })
}

fn is_known<K>(store: &Store<K>, obj: &K) -> bool
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Default + Eq + Hash,
{
    store.get(&ObjectRef::from_obj(obj)).is_some()
}
