// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Cluster session controller.
//!
//! Owns everything that exists for one connected cluster: the kind registry,
//! the built-in reflectors, the dependent-kind cascade, and (through owner
//! tags) every subscription any of them installed. Connect, switch, and
//! disconnect move the session through
//! Disconnected → Connecting → Ready → (Switching → Connecting) → Disconnected;
//! a switch tears the old cluster fully down before the new one starts, so
//! no cache entry or subscription ever crosses clusters.
//!
//! A `loading` gate is up for the whole Connecting phase: reads fail with
//! `NotReady` until the session reaches Ready, so consumers never observe a
//! half-initialized cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gateway::{ResourceGateway, ResourceObject};
use crate::progress::ProgressHandle;
use crate::sync::cascade::KindCascade;
use crate::sync::kinds::KindRegistry;
use crate::sync::reflector::PageReflector;
use crate::sync::store::Snapshot;
use crate::sync::subscriptions::SubscriptionRegistry;

/// Kinds reflected for every session, independent of the catalog.
const BUILTIN_KINDS: &[(&str, &str)] = &[("Namespace", "")];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Switching,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Liveness probe or catalog fetch failed during Connecting; the session
    /// stayed Disconnected and no cache was populated.
    #[error("failed to initialize session for cluster '{cluster}': {reason}")]
    Initialization { cluster: String, reason: String },
    /// Read attempted while no cluster is connected or Connecting is still
    /// in progress.
    #[error("session is not ready")]
    NotReady,
}

struct Active {
    cluster: String,
    owner: String,
    gateway: Arc<dyn ResourceGateway>,
    kinds: Arc<KindRegistry>,
    reflectors: HashMap<(String, String), Arc<PageReflector>>,
    cascade: Option<KindCascade>,
}

pub struct ClusterSession {
    page_size: u32,
    subscriptions: Arc<SubscriptionRegistry>,
    progress: ProgressHandle,
    state: Mutex<SessionState>,
    loading: AtomicBool,
    generation: AtomicU64,
    active: Mutex<Option<Active>>,
    /// Serializes connect/switch/disconnect; reads never take this.
    transition: tokio::sync::Mutex<()>,
}

impl ClusterSession {
    pub fn new(
        page_size: u32,
        subscriptions: Arc<SubscriptionRegistry>,
        progress: ProgressHandle,
    ) -> Self {
        Self {
            page_size,
            subscriptions,
            progress,
            state: Mutex::new(SessionState::Disconnected),
            loading: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn cluster(&self) -> Option<String> {
        self.active.lock().unwrap().as_ref().map(|a| a.cluster.clone())
    }

    pub fn progress(&self) -> &ProgressHandle {
        &self.progress
    }

    /// Connect to a cluster, tearing down any currently connected one first.
    pub async fn connect(
        &self,
        cluster: &str,
        gateway: Arc<dyn ResourceGateway>,
    ) -> Result<(), SessionError> {
        let _guard = self.transition.lock().await;

        if let Some(previous) = self.cluster() {
            self.set_state(SessionState::Switching);
            self.progress.switching(&previous, cluster);
            self.teardown_active();
        }

        self.set_state(SessionState::Connecting);
        self.loading.store(true, Ordering::SeqCst);
        self.progress.connecting(cluster);
        let started = Instant::now();

        if let Err(e) = gateway.probe().await {
            return Err(self.fail_connect(cluster, &e.to_string()));
        }

        let descriptors = match gateway.discover_kinds().await {
            Ok(descriptors) => descriptors,
            Err(e) => return Err(self.fail_connect(cluster, &e.to_string())),
        };
        let kinds = Arc::new(KindRegistry::new(descriptors));
        self.progress.catalog_loaded(
            cluster,
            kinds.len(),
            started.elapsed().as_millis() as u64,
        );

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let owner = format!("{cluster}#{generation}");

        // Built-in kinds first, then the cascade. Neither is allowed to fail
        // the connect: a kind that cannot list stays paused and is reported.
        let mut reflectors = HashMap::new();
        for (kind, group) in BUILTIN_KINDS {
            let Some(descriptor) = kinds.resolve(kind, group).cloned() else {
                debug!(kind, group, "built-in kind not served; skipping");
                continue;
            };
            let reflector = Arc::new(PageReflector::new(
                descriptor,
                self.page_size,
                Arc::clone(&gateway),
                Arc::clone(&self.subscriptions),
                owner.as_str(),
            ));
            match reflector.sync_full().await {
                Ok(items) => self.progress.reflector_started(kind, group, items),
                Err(e) => {
                    warn!(kind, group, error = %e, "built-in kind failed to list");
                    self.progress.reflector_failed(kind, group, &e.to_string());
                }
            }
            reflectors.insert((kind.to_string(), group.to_string()), reflector);
        }

        let cascade = match KindCascade::start(
            Arc::clone(&gateway),
            Arc::clone(&self.subscriptions),
            Arc::clone(&kinds),
            self.page_size,
            Arc::clone(&self.progress),
            &owner,
        )
        .await
        {
            Ok(cascade) => Some(cascade),
            Err(e) => {
                warn!(error = %e, "dependent-kind cascade failed to start");
                self.progress.reflector_failed(
                    crate::sync::cascade::CATALOG_KIND,
                    crate::sync::cascade::CATALOG_GROUP,
                    &e.to_string(),
                );
                None
            }
        };

        *self.active.lock().unwrap() = Some(Active {
            cluster: cluster.to_string(),
            owner,
            gateway,
            kinds,
            reflectors,
            cascade,
        });
        self.loading.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Ready);
        self.progress.ready(cluster);
        info!(cluster, "session ready");
        Ok(())
    }

    /// Tear everything down and return to Disconnected.
    pub async fn disconnect(&self) {
        let _guard = self.transition.lock().await;
        let previous = self.cluster();
        self.teardown_active();
        self.set_state(SessionState::Disconnected);
        self.loading.store(false, Ordering::SeqCst);
        if let Some(previous) = previous {
            self.progress.disconnected(&previous);
            info!(cluster = %previous, "session disconnected");
        }
    }

    /// Start reflecting an additional kind on consumer demand. `Ok(None)`
    /// means the kind is not served by the cluster; skip, don't fail.
    pub async fn track(
        &self,
        kind: &str,
        group: &str,
    ) -> Result<Option<Arc<PageReflector>>, SessionError> {
        self.ensure_ready()?;
        let (descriptor, gateway, owner) = {
            let active = self.active.lock().unwrap();
            let active = active.as_ref().ok_or(SessionError::NotReady)?;
            if let Some(existing) = active.reflectors.get(&(kind.to_string(), group.to_string())) {
                return Ok(Some(Arc::clone(existing)));
            }
            let Some(descriptor) = active.kinds.resolve(kind, group).cloned() else {
                return Ok(None);
            };
            (descriptor, Arc::clone(&active.gateway), active.owner.clone())
        };

        let reflector = Arc::new(PageReflector::new(
            descriptor,
            self.page_size,
            gateway,
            Arc::clone(&self.subscriptions),
            owner,
        ));
        // First page only; the consumer drives further pagination.
        if let Err(e) = reflector.load_more().await {
            warn!(kind, group, error = %e, "tracked kind failed to list");
            self.progress.reflector_failed(kind, group, &e.to_string());
        } else {
            self.progress.reflector_started(kind, group, reflector.len());
        }

        let mut active = self.active.lock().unwrap();
        match active.as_mut() {
            Some(active) => {
                let entry = active
                    .reflectors
                    .entry((kind.to_string(), group.to_string()))
                    .or_insert_with(|| Arc::clone(&reflector));
                Ok(Some(Arc::clone(entry)))
            }
            // Torn down while the first page was in flight.
            None => {
                reflector.stop();
                Err(SessionError::NotReady)
            }
        }
    }

    /// Snapshot of one kind's cache. `Ok(None)` when the kind is not being
    /// reflected.
    pub fn resources(
        &self,
        kind: &str,
        group: &str,
    ) -> Result<Option<Snapshot<ResourceObject>>, SessionError> {
        Ok(self.reflector(kind, group)?.map(|r| r.snapshot()))
    }

    /// The live reflector for one kind, if any (built-in, tracked, or
    /// cascade-derived).
    pub fn reflector(
        &self,
        kind: &str,
        group: &str,
    ) -> Result<Option<Arc<PageReflector>>, SessionError> {
        self.ensure_ready()?;
        let active = self.active.lock().unwrap();
        let active = active.as_ref().ok_or(SessionError::NotReady)?;
        if let Some(r) = active.reflectors.get(&(kind.to_string(), group.to_string())) {
            return Ok(Some(Arc::clone(r)));
        }
        Ok(active
            .cascade
            .as_ref()
            .and_then(|c| c.child(kind, group)))
    }

    /// Every (kind, group) currently reflected, sorted.
    pub fn tracked_kinds(&self) -> Result<Vec<(String, String)>, SessionError> {
        self.ensure_ready()?;
        let active = self.active.lock().unwrap();
        let active = active.as_ref().ok_or(SessionError::NotReady)?;
        let mut keys: Vec<_> = active.reflectors.keys().cloned().collect();
        if let Some(cascade) = &active.cascade {
            keys.extend(cascade.tracked());
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    pub fn kind_registry(&self) -> Result<Arc<KindRegistry>, SessionError> {
        self.ensure_ready()?;
        let active = self.active.lock().unwrap();
        active
            .as_ref()
            .map(|a| Arc::clone(&a.kinds))
            .ok_or(SessionError::NotReady)
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        if self.is_loading() || self.state() != SessionState::Ready {
            return Err(SessionError::NotReady);
        }
        Ok(())
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap() = next;
    }

    fn fail_connect(&self, cluster: &str, reason: &str) -> SessionError {
        self.loading.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Disconnected);
        warn!(cluster, reason, "session initialization failed");
        SessionError::Initialization {
            cluster: cluster.to_string(),
            reason: reason.to_string(),
        }
    }

    fn teardown_active(&self) {
        let Some(mut active) = self.active.lock().unwrap().take() else {
            return;
        };
        if let Some(mut cascade) = active.cascade.take() {
            cascade.shutdown();
        }
        for reflector in active.reflectors.values() {
            reflector.stop();
        }
        // Sweep: nothing of this owner's may survive, reflector-tracked or not.
        let swept = self.subscriptions.release_owner(&active.owner);
        debug!(
            cluster = %active.cluster,
            owner = %active.owner,
            swept,
            "session torn down"
        );
    }
}
