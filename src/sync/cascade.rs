// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Dependent-kind cascade.
//!
//! The CustomResourceDefinition catalog declares which custom kinds the
//! cluster serves. The cascade keeps one page reflector per declared kind:
//! it fully lists the catalog through a reflector of its own, then reacts to
//! catalog watch events: a new CRD starts a reflector for the kind it
//! declares, a deleted CRD stops that reflector and discards its cache.
//!
//! One kind failing to list never blocks the others; a kind the registry
//! cannot resolve yet is skipped, not failed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::gateway::{ResourceGateway, ResourceObject, WatchEventKind};
use crate::progress::ProgressHandle;
use crate::sync::kinds::KindRegistry;
use crate::sync::reflector::PageReflector;
use crate::sync::store::Snapshot;
use crate::sync::subscriptions::SubscriptionRegistry;

/// The meta-kind whose objects make up the catalog.
pub const CATALOG_KIND: &str = "CustomResourceDefinition";
pub const CATALOG_GROUP: &str = "apiextensions.k8s.io";

/// Self-describing/introspection-only kinds; reflecting them is meaningless.
const EXCLUDED_KINDS: &[&str] = &["SelfSubjectReview"];

enum Command {
    Start { kind: String, group: String },
    Stop { kind: String, group: String },
}

type ChildMap = Arc<Mutex<HashMap<(String, String), Arc<PageReflector>>>>;

pub struct KindCascade {
    catalog: Option<Arc<PageReflector>>,
    children: ChildMap,
    worker: Option<JoinHandle<()>>,
}

/// Derive the (kind, group) a catalog object declares.
fn cascade_entry(object: &ResourceObject) -> Option<(String, String)> {
    let kind = object.payload.pointer("/spec/names/kind")?.as_str()?;
    let group = object.payload.pointer("/spec/group")?.as_str()?;
    Some((kind.to_string(), group.to_string()))
}

impl KindCascade {
    /// List the catalog fully, start reflectors for every declared kind, and
    /// keep following catalog changes until [`shutdown`](Self::shutdown).
    ///
    /// A cluster without the catalog kind gets an inert cascade: nothing to
    /// follow, nothing reflected.
    pub async fn start(
        gateway: Arc<dyn ResourceGateway>,
        subscriptions: Arc<SubscriptionRegistry>,
        kinds: Arc<KindRegistry>,
        page_size: u32,
        progress: ProgressHandle,
        owner: &str,
    ) -> Result<Self, crate::gateway::GatewayError> {
        let Some(catalog_kind) = kinds.resolve(CATALOG_KIND, CATALOG_GROUP).cloned() else {
            debug!("cluster serves no CustomResourceDefinition kind; cascade inert");
            return Ok(Self {
                catalog: None,
                children: Arc::new(Mutex::new(HashMap::new())),
                worker: None,
            });
        };

        let children: ChildMap = Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(Self::run_worker(
            cmd_rx,
            Arc::clone(&gateway),
            Arc::clone(&subscriptions),
            Arc::clone(&kinds),
            Arc::clone(&children),
            page_size,
            progress,
            owner.to_string(),
        ));

        let tap_tx = cmd_tx.clone();
        let catalog = Arc::new(
            PageReflector::new(
                catalog_kind,
                page_size,
                gateway,
                subscriptions,
                owner,
            )
            .with_event_tap(Arc::new(move |event| {
                let Some((kind, group)) = cascade_entry(&event.object) else {
                    return;
                };
                let command = match event.kind {
                    WatchEventKind::Added | WatchEventKind::Updated => {
                        Command::Start { kind, group }
                    }
                    WatchEventKind::Deleted => Command::Stop { kind, group },
                };
                let _ = tap_tx.send(command);
            })),
        );

        if let Err(e) = catalog.sync_full().await {
            worker.abort();
            catalog.stop();
            return Err(e);
        }

        // Seed reflectors for everything the full listing found.
        for object in catalog.snapshot().values() {
            if let Some((kind, group)) = cascade_entry(object) {
                let _ = cmd_tx.send(Command::Start { kind, group });
            }
        }

        Ok(Self {
            catalog: Some(catalog),
            children,
            worker: Some(worker),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_worker(
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        gateway: Arc<dyn ResourceGateway>,
        subscriptions: Arc<SubscriptionRegistry>,
        kinds: Arc<KindRegistry>,
        children: ChildMap,
        page_size: u32,
        progress: ProgressHandle,
        owner: String,
    ) {
        while let Some(command) = cmd_rx.recv().await {
            match command {
                Command::Start { kind, group } => {
                    if EXCLUDED_KINDS.contains(&kind.as_str()) {
                        debug!(kind = %kind, group = %group, "excluded kind; not reflecting");
                        continue;
                    }
                    let key = (kind.clone(), group.clone());
                    if children.lock().unwrap().contains_key(&key) {
                        continue;
                    }
                    let Some(descriptor) = kinds.resolve(&kind, &group).cloned() else {
                        debug!(
                            kind = %kind,
                            group = %group,
                            "kind not in catalog registry yet; skipping"
                        );
                        continue;
                    };
                    let reflector = Arc::new(PageReflector::new(
                        descriptor,
                        page_size,
                        Arc::clone(&gateway),
                        Arc::clone(&subscriptions),
                        owner.as_str(),
                    ));
                    children.lock().unwrap().insert(key, Arc::clone(&reflector));
                    // Initial sync runs detached so one slow or failing kind
                    // does not hold up the rest of the catalog.
                    let progress = Arc::clone(&progress);
                    tokio::spawn(async move {
                        let kd = reflector.kind().clone();
                        match reflector.sync_full().await {
                            Ok(items) => progress.reflector_started(&kd.kind, &kd.group, items),
                            Err(e) => {
                                warn!(
                                    kind = %kd.kind,
                                    group = %kd.group,
                                    error = %e,
                                    "dependent kind failed to list; left paused"
                                );
                                progress.reflector_failed(&kd.kind, &kd.group, &e.to_string());
                            }
                        }
                    });
                }
                Command::Stop { kind, group } => {
                    let removed = children.lock().unwrap().remove(&(kind.clone(), group.clone()));
                    if let Some(reflector) = removed {
                        reflector.stop();
                        progress.kind_dropped(&kind, &group);
                        debug!(kind = %kind, group = %group, "dependent kind removed");
                    }
                }
            }
        }
    }

    /// Current catalog contents (the CRD objects themselves).
    #[allow(dead_code)]
    pub fn catalog_snapshot(&self) -> Option<Snapshot<ResourceObject>> {
        self.catalog.as_ref().map(|c| c.snapshot())
    }

    /// (kind, group) pairs currently reflected.
    pub fn tracked(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.children.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn child(&self, kind: &str, group: &str) -> Option<Arc<PageReflector>> {
        self.children
            .lock()
            .unwrap()
            .get(&(kind.to_string(), group.to_string()))
            .cloned()
    }

    /// Stop following the catalog and tear down every dependent reflector.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        if let Some(catalog) = self.catalog.take() {
            catalog.stop();
        }
        let drained: Vec<_> = {
            let mut children = self.children.lock().unwrap();
            children.drain().map(|(_, r)| r).collect()
        };
        for reflector in drained {
            reflector.stop();
        }
    }
}

impl Drop for KindCascade {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testgw::{TestGateway, crd_object, objects, test_kind};
    use std::time::Duration;

    const SETTLE: Duration = Duration::from_millis(50);

    fn catalog_kind() -> crate::gateway::KindDescriptor {
        let mut kd = test_kind(CATALOG_KIND, CATALOG_GROUP);
        kd.namespaced = false;
        kd
    }

    /// Gateway with the catalog kind plus two dependent kinds.
    fn seeded() -> (Arc<TestGateway>, Arc<KindRegistry>) {
        let gateway = Arc::new(TestGateway::new());
        gateway.add_kind(catalog_kind());
        gateway.add_kind(test_kind("Widget", "example.io"));
        gateway.add_kind(test_kind("Gadget", "example.io"));
        gateway.set_objects("Widget", "example.io", objects("widget", 3));
        gateway.set_objects("Gadget", "example.io", objects("gadget", 2));

        let kinds = Arc::new(KindRegistry::new(vec![
            catalog_kind(),
            test_kind("Widget", "example.io"),
            test_kind("Gadget", "example.io"),
        ]));
        (gateway, kinds)
    }

    async fn start_cascade(
        gateway: &Arc<TestGateway>,
        subscriptions: &Arc<SubscriptionRegistry>,
        kinds: &Arc<KindRegistry>,
    ) -> KindCascade {
        KindCascade::start(
            Arc::clone(gateway) as Arc<dyn ResourceGateway>,
            Arc::clone(subscriptions),
            Arc::clone(kinds),
            50,
            crate::progress::create_progress_handle(),
            "cascade-test",
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn initial_listing_starts_one_reflector_per_catalog_entry() {
        let (gateway, kinds) = seeded();
        gateway.set_objects(
            CATALOG_KIND,
            CATALOG_GROUP,
            vec![
                crd_object("crd-1", "Widget", "example.io"),
                crd_object("crd-2", "Gadget", "example.io"),
            ],
        );
        let subscriptions = Arc::new(SubscriptionRegistry::new());

        let cascade = start_cascade(&gateway, &subscriptions, &kinds).await;
        tokio::time::sleep(SETTLE).await;

        assert_eq!(
            cascade.tracked(),
            vec![
                ("Gadget".to_string(), "example.io".to_string()),
                ("Widget".to_string(), "example.io".to_string()),
            ]
        );
        assert_eq!(cascade.child("Widget", "example.io").unwrap().len(), 3);
        assert_eq!(cascade.child("Gadget", "example.io").unwrap().len(), 2);
        // Catalog watch + one per child.
        assert_eq!(subscriptions.len(), 3);
    }

    #[tokio::test]
    async fn excluded_kind_is_never_reflected() {
        let (gateway, _) = seeded();
        gateway.set_objects(
            CATALOG_KIND,
            CATALOG_GROUP,
            vec![
                crd_object("crd-1", "Widget", "example.io"),
                crd_object("crd-2", "SelfSubjectReview", "authentication.k8s.io"),
            ],
        );
        let kinds = Arc::new(KindRegistry::new(vec![
            catalog_kind(),
            test_kind("Widget", "example.io"),
            test_kind("SelfSubjectReview", "authentication.k8s.io"),
        ]));
        let subscriptions = Arc::new(SubscriptionRegistry::new());

        let cascade = start_cascade(&gateway, &subscriptions, &kinds).await;
        tokio::time::sleep(SETTLE).await;

        assert_eq!(
            cascade.tracked(),
            vec![("Widget".to_string(), "example.io".to_string())]
        );
    }

    #[tokio::test]
    async fn catalog_added_event_starts_exactly_one_reflector() {
        let (gateway, kinds) = seeded();
        gateway.set_objects(CATALOG_KIND, CATALOG_GROUP, vec![]);
        let subscriptions = Arc::new(SubscriptionRegistry::new());

        let cascade = start_cascade(&gateway, &subscriptions, &kinds).await;
        assert!(cascade.tracked().is_empty());

        gateway.push_event_object(
            CATALOG_KIND,
            CATALOG_GROUP,
            WatchEventKind::Added,
            crd_object("crd-1", "Widget", "example.io"),
        );
        // Duplicate announcement must not start a second reflector.
        gateway.push_event_object(
            CATALOG_KIND,
            CATALOG_GROUP,
            WatchEventKind::Added,
            crd_object("crd-1", "Widget", "example.io"),
        );
        tokio::time::sleep(SETTLE).await;

        assert_eq!(
            cascade.tracked(),
            vec![("Widget".to_string(), "example.io".to_string())]
        );
        assert_eq!(cascade.child("Widget", "example.io").unwrap().len(), 3);
        assert_eq!(gateway.watch_count("Widget", "example.io"), 1);
    }

    #[tokio::test]
    async fn catalog_deleted_event_stops_reflector_and_clears_cache() {
        let (gateway, kinds) = seeded();
        gateway.set_objects(
            CATALOG_KIND,
            CATALOG_GROUP,
            vec![crd_object("crd-1", "Widget", "example.io")],
        );
        let subscriptions = Arc::new(SubscriptionRegistry::new());

        let cascade = start_cascade(&gateway, &subscriptions, &kinds).await;
        tokio::time::sleep(SETTLE).await;
        let widget = cascade.child("Widget", "example.io").unwrap();
        assert_eq!(widget.len(), 3);

        gateway.push_event_object(
            CATALOG_KIND,
            CATALOG_GROUP,
            WatchEventKind::Deleted,
            crd_object("crd-1", "Widget", "example.io"),
        );
        tokio::time::sleep(SETTLE).await;

        assert!(cascade.tracked().is_empty());
        assert!(widget.is_empty());
        // Only the catalog watch remains.
        assert_eq!(subscriptions.len(), 1);
    }

    #[tokio::test]
    async fn readded_kind_gets_a_fresh_cache() {
        let (gateway, kinds) = seeded();
        gateway.set_objects(
            CATALOG_KIND,
            CATALOG_GROUP,
            vec![crd_object("crd-1", "Widget", "example.io")],
        );
        let subscriptions = Arc::new(SubscriptionRegistry::new());

        let cascade = start_cascade(&gateway, &subscriptions, &kinds).await;
        tokio::time::sleep(SETTLE).await;
        let first = cascade.child("Widget", "example.io").unwrap();

        gateway.push_event_object(
            CATALOG_KIND,
            CATALOG_GROUP,
            WatchEventKind::Deleted,
            crd_object("crd-1", "Widget", "example.io"),
        );
        tokio::time::sleep(SETTLE).await;

        // Remote set changed while the kind was untracked.
        gateway.set_objects("Widget", "example.io", objects("widget2", 5));
        gateway.push_event_object(
            CATALOG_KIND,
            CATALOG_GROUP,
            WatchEventKind::Added,
            crd_object("crd-1b", "Widget", "example.io"),
        );
        tokio::time::sleep(SETTLE).await;

        let second = cascade.child("Widget", "example.io").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_empty());
        assert_eq!(second.len(), 5);
        assert!(second.snapshot().contains_key("widget2-0"));
        assert!(!second.snapshot().contains_key("widget-0"));
    }

    #[tokio::test]
    async fn unresolvable_kind_is_skipped_not_fatal() {
        let (gateway, _) = seeded();
        gateway.set_objects(
            CATALOG_KIND,
            CATALOG_GROUP,
            vec![
                crd_object("crd-1", "Unregistered", "example.io"),
                crd_object("crd-2", "Widget", "example.io"),
            ],
        );
        // Registry knows the catalog and Widget, not Unregistered.
        let kinds = Arc::new(KindRegistry::new(vec![
            catalog_kind(),
            test_kind("Widget", "example.io"),
        ]));
        let subscriptions = Arc::new(SubscriptionRegistry::new());

        let cascade = start_cascade(&gateway, &subscriptions, &kinds).await;
        tokio::time::sleep(SETTLE).await;

        assert_eq!(
            cascade.tracked(),
            vec![("Widget".to_string(), "example.io".to_string())]
        );
    }

    #[tokio::test]
    async fn one_failing_kind_does_not_block_the_others() {
        let (gateway, kinds) = seeded();
        gateway.set_objects(
            CATALOG_KIND,
            CATALOG_GROUP,
            vec![
                crd_object("crd-1", "Widget", "example.io"),
                crd_object("crd-2", "Gadget", "example.io"),
            ],
        );
        gateway.fail_next_fetch("Widget", "example.io");
        let subscriptions = Arc::new(SubscriptionRegistry::new());

        let cascade = start_cascade(&gateway, &subscriptions, &kinds).await;
        tokio::time::sleep(SETTLE).await;

        // Gadget reflected fine; Widget is tracked but paused with nothing
        // merged, awaiting a caller-initiated retry.
        assert_eq!(cascade.child("Gadget", "example.io").unwrap().len(), 2);
        let widget = cascade.child("Widget", "example.io").unwrap();
        assert!(widget.is_empty());
        assert!(widget.has_more());
    }

    #[tokio::test]
    async fn cluster_without_catalog_kind_yields_inert_cascade() {
        let gateway = Arc::new(TestGateway::new());
        let kinds = Arc::new(KindRegistry::new(vec![test_kind("Namespace", "")]));
        let subscriptions = Arc::new(SubscriptionRegistry::new());

        let cascade = start_cascade(&gateway, &subscriptions, &kinds).await;
        assert!(cascade.catalog_snapshot().is_none());
        assert!(cascade.tracked().is_empty());
        assert!(subscriptions.is_empty());
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let (gateway, kinds) = seeded();
        gateway.set_objects(
            CATALOG_KIND,
            CATALOG_GROUP,
            vec![
                crd_object("crd-1", "Widget", "example.io"),
                crd_object("crd-2", "Gadget", "example.io"),
            ],
        );
        let subscriptions = Arc::new(SubscriptionRegistry::new());

        let mut cascade = start_cascade(&gateway, &subscriptions, &kinds).await;
        tokio::time::sleep(SETTLE).await;
        assert_eq!(subscriptions.len(), 3);

        cascade.shutdown();
        assert!(subscriptions.is_empty());
        assert!(cascade.tracked().is_empty());
    }
}
