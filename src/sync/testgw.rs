// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Scripted in-memory gateway for exercising the sync core without a
//! cluster. Pages are slices over a fixed object list addressed by numeric
//! continuation tokens; watches are unbounded channels the tests push into.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::gateway::{
    GatewayError, KindDescriptor, ResourceGateway, ResourceObject, ResourcePage, WatchEvent,
    WatchEventKind, WatchStream,
};

type Key = (String, String);
type WatchSender = mpsc::UnboundedSender<Result<WatchEvent, GatewayError>>;

#[derive(Default)]
struct Inner {
    kinds: Vec<KindDescriptor>,
    objects: HashMap<Key, Vec<ResourceObject>>,
    watchers: HashMap<Key, Vec<WatchSender>>,
    /// Pending injected failures per kind; each fetch consumes one.
    fail_fetches: HashMap<Key, u32>,
    fail_discovery: bool,
    fail_probe: bool,
    fetch_calls: HashMap<Key, u32>,
    /// Uids served per page, per kind, in call order.
    served: HashMap<Key, Vec<Vec<String>>>,
    page_delay: Option<Duration>,
    marker_seq: u64,
}

#[derive(Default)]
pub struct TestGateway {
    inner: Mutex<Inner>,
}

fn key(kind: &str, group: &str) -> Key {
    (kind.to_string(), group.to_string())
}

/// Descriptor with sensible defaults for tests.
pub fn test_kind(kind: &str, group: &str) -> KindDescriptor {
    KindDescriptor {
        kind: kind.to_string(),
        group: group.to_string(),
        version: "v1".to_string(),
        plural: format!("{}s", kind.to_lowercase()),
        namespaced: true,
        watchable: true,
    }
}

/// `n` objects with uids `{prefix}-0 .. {prefix}-{n-1}`.
pub fn objects(prefix: &str, n: usize) -> Vec<ResourceObject> {
    (0..n)
        .map(|i| ResourceObject {
            uid: format!("{prefix}-{i}"),
            kind: prefix.to_string(),
            name: format!("{prefix}-{i}"),
            namespace: Some("default".to_string()),
            resource_version: format!("{i}"),
            payload: serde_json::Value::Null,
        })
        .collect()
}

/// A CustomResourceDefinition object whose payload names a dependent kind.
pub fn crd_object(uid: &str, names_kind: &str, group: &str) -> ResourceObject {
    ResourceObject {
        uid: uid.to_string(),
        kind: "CustomResourceDefinition".to_string(),
        name: format!("{}.{group}", names_kind.to_lowercase()),
        namespace: None,
        resource_version: "1".to_string(),
        payload: serde_json::json!({
            "spec": { "group": group, "names": { "kind": names_kind } }
        }),
    }
}

impl TestGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_kind(&self, descriptor: KindDescriptor) {
        self.inner.lock().unwrap().kinds.push(descriptor);
    }

    pub fn set_objects(&self, kind: &str, group: &str, objects: Vec<ResourceObject>) {
        self.inner
            .lock()
            .unwrap()
            .objects
            .insert(key(kind, group), objects);
    }

    pub fn set_page_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().page_delay = Some(delay);
    }

    /// Inject one transport failure for the next fetch of this kind.
    pub fn fail_next_fetch(&self, kind: &str, group: &str) {
        *self
            .inner
            .lock()
            .unwrap()
            .fail_fetches
            .entry(key(kind, group))
            .or_insert(0) += 1;
    }

    pub fn set_fail_discovery(&self, fail: bool) {
        self.inner.lock().unwrap().fail_discovery = fail;
    }

    pub fn set_fail_probe(&self, fail: bool) {
        self.inner.lock().unwrap().fail_probe = fail;
    }

    pub fn fetch_count(&self, kind: &str, group: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .fetch_calls
            .get(&key(kind, group))
            .copied()
            .unwrap_or(0)
    }

    /// How many watches have ever been opened for this kind.
    pub fn watch_count(&self, kind: &str, group: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .watchers
            .get(&key(kind, group))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Uids served per page, in call order.
    pub fn served_pages(&self, kind: &str, group: &str) -> Vec<Vec<String>> {
        self.inner
            .lock()
            .unwrap()
            .served
            .get(&key(kind, group))
            .cloned()
            .unwrap_or_default()
    }

    /// Deliver an event through the most recently opened watch for the kind.
    pub fn push_event(&self, kind: &str, group: &str, ev: WatchEventKind, uid: &str, rv: &str) {
        let object = ResourceObject {
            uid: uid.to_string(),
            kind: kind.to_string(),
            name: uid.to_string(),
            namespace: Some("default".to_string()),
            resource_version: rv.to_string(),
            payload: serde_json::Value::Null,
        };
        self.push_event_object(kind, group, ev, object);
    }

    pub fn push_event_object(
        &self,
        kind: &str,
        group: &str,
        ev: WatchEventKind,
        object: ResourceObject,
    ) {
        let inner = self.inner.lock().unwrap();
        if let Some(senders) = inner.watchers.get(&key(kind, group))
            && let Some(sender) = senders.last()
        {
            let _ = sender.send(Ok(WatchEvent { kind: ev, object }));
        }
    }

    /// Deliver an event through a specific (possibly released) watch.
    pub fn push_event_to_watch(
        &self,
        kind: &str,
        group: &str,
        watch_index: usize,
        ev: WatchEventKind,
        uid: &str,
        rv: &str,
    ) {
        let object = ResourceObject {
            uid: uid.to_string(),
            kind: kind.to_string(),
            name: uid.to_string(),
            namespace: Some("default".to_string()),
            resource_version: rv.to_string(),
            payload: serde_json::Value::Null,
        };
        let inner = self.inner.lock().unwrap();
        if let Some(senders) = inner.watchers.get(&key(kind, group))
            && let Some(sender) = senders.get(watch_index)
        {
            let _ = sender.send(Ok(WatchEvent { kind: ev, object }));
        }
    }
}

#[async_trait]
impl ResourceGateway for TestGateway {
    async fn probe(&self) -> Result<(), GatewayError> {
        if self.inner.lock().unwrap().fail_probe {
            return Err(GatewayError::Transport("probe refused".to_string()));
        }
        Ok(())
    }

    async fn discover_kinds(&self) -> Result<Vec<KindDescriptor>, GatewayError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_discovery {
            return Err(GatewayError::Transport("discovery refused".to_string()));
        }
        Ok(inner.kinds.clone())
    }

    async fn fetch_page(
        &self,
        kind: &KindDescriptor,
        limit: u32,
        token: Option<&str>,
    ) -> Result<ResourcePage, GatewayError> {
        let delay = self.inner.lock().unwrap().page_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().unwrap();
        let k = key(&kind.kind, &kind.group);
        *inner.fetch_calls.entry(k.clone()).or_insert(0) += 1;

        if let Some(pending) = inner.fail_fetches.get_mut(&k)
            && *pending > 0
        {
            *pending -= 1;
            return Err(GatewayError::Transport("injected fetch failure".to_string()));
        }

        let Some(all) = inner.objects.get(&k) else {
            return Err(GatewayError::NotFound {
                kind: kind.kind.clone(),
                group: kind.group.clone(),
            });
        };

        let offset: usize = token.map(|t| t.parse().unwrap_or(0)).unwrap_or(0);
        let end = (offset + limit as usize).min(all.len());
        let items: Vec<ResourceObject> = all[offset.min(all.len())..end].to_vec();
        let next_token = if end < all.len() {
            Some(end.to_string())
        } else {
            None
        };

        inner.marker_seq += 1;
        let snapshot_marker = format!("list-{}", inner.marker_seq);
        inner
            .served
            .entry(k)
            .or_default()
            .push(items.iter().map(|o| o.uid.clone()).collect());

        Ok(ResourcePage {
            items,
            next_token,
            snapshot_marker,
        })
    }

    async fn open_watch(
        &self,
        kind: &KindDescriptor,
        _marker: &str,
    ) -> Result<WatchStream, GatewayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .watchers
            .entry(key(&kind.kind, &kind.group))
            .or_default()
            .push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
