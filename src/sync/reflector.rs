// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Page reflector: bounded listing plus anchored watch for one kind.
//!
//! A reflector owns exactly one [`KeyedStore`] and every subscription it
//! installs. Paging is caller-driven: `load_more` fetches one page, merges
//! it, and re-anchors the watch at that page's snapshot marker, releasing
//! the previous subscription first so no event is delivered twice. A paging
//! request in flight suppresses further requests for the same reflector.
//!
//! A failed fetch leaves the reflector paused: the continuation cursor and
//! any installed watch are kept, and the caller decides whether to retry.
//! There is no automatic retry here.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::gateway::{
    GatewayError, KindDescriptor, ResourceGateway, ResourceObject, WatchEvent,
};
use crate::sync::store::{KeyedStore, Snapshot};
use crate::sync::subscriptions::{SubscriptionId, SubscriptionRegistry};

/// Fixed page size used when the caller does not override it.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Observer invoked after a watch event has been applied to the cache.
/// Used by the cascade to track catalog membership.
pub type EventTap = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

/// Result of one `load_more` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was fetched and merged.
    Loaded { added: usize, has_more: bool },
    /// A fetch for this reflector is already in flight; nothing was done.
    AlreadyLoading,
    /// The enumeration is complete; nothing was done.
    Exhausted,
    /// The reflector was stopped (or stopped mid-fetch); the cache was not
    /// touched by this call.
    Stopped,
}

#[derive(Default)]
struct PagingState {
    started: bool,
    in_flight: bool,
    stopped: bool,
    next_token: Option<String>,
    subscription: Option<SubscriptionId>,
    /// Bumped by `stop`; a fetch that resumes under a different epoch
    /// discards its result instead of merging.
    epoch: u64,
}

pub struct PageReflector {
    kind: KindDescriptor,
    owner: String,
    page_size: u32,
    gateway: Arc<dyn ResourceGateway>,
    subscriptions: Arc<SubscriptionRegistry>,
    store: KeyedStore<ResourceObject>,
    state: Mutex<PagingState>,
    tap: Option<EventTap>,
}

impl PageReflector {
    pub fn new(
        kind: KindDescriptor,
        page_size: u32,
        gateway: Arc<dyn ResourceGateway>,
        subscriptions: Arc<SubscriptionRegistry>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            owner: owner.into(),
            page_size,
            gateway,
            subscriptions,
            store: KeyedStore::new(),
            state: Mutex::new(PagingState::default()),
            tap: None,
        }
    }

    /// Attach an observer that sees every applied watch event.
    pub fn with_event_tap(mut self, tap: EventTap) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn kind(&self) -> &KindDescriptor {
        &self.kind
    }

    pub fn snapshot(&self) -> Snapshot<ResourceObject> {
        self.store.snapshot()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// True while a continuation token is outstanding (or before the first
    /// page has been fetched).
    pub fn has_more(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.stopped && (!state.started || state.next_token.is_some())
    }

    #[allow(dead_code)]
    pub fn is_loading(&self) -> bool {
        self.state.lock().unwrap().in_flight
    }

    /// Fetch and merge the next page, then re-anchor the watch at the page's
    /// snapshot marker. Redundant calls are safe: with no token outstanding
    /// or a fetch already in flight this is a no-op.
    pub async fn load_more(&self) -> Result<LoadOutcome, GatewayError> {
        let (token, epoch) = {
            let mut state = self.state.lock().unwrap();
            if state.stopped {
                return Ok(LoadOutcome::Stopped);
            }
            if state.in_flight {
                return Ok(LoadOutcome::AlreadyLoading);
            }
            if state.started && state.next_token.is_none() {
                return Ok(LoadOutcome::Exhausted);
            }
            state.in_flight = true;
            (state.next_token.clone(), state.epoch)
        };

        let fetched = self
            .gateway
            .fetch_page(&self.kind, self.page_size, token.as_deref())
            .await;

        let page = match fetched {
            Ok(page) => page,
            Err(e) => {
                // Paused, not dead: cursor and watch stay as they were so the
                // owner can retry the same page.
                self.state.lock().unwrap().in_flight = false;
                warn!(
                    kind = %self.kind.kind,
                    group = %self.kind.group,
                    error = %e,
                    "page fetch failed; reflector paused"
                );
                return Err(e);
            }
        };

        let (added, has_more, marker, previous) = {
            let mut state = self.state.lock().unwrap();
            if state.epoch != epoch || state.stopped {
                state.in_flight = false;
                return Ok(LoadOutcome::Stopped);
            }
            self.store.merge_items(&page.items);
            state.started = true;
            state.next_token = page.next_token.clone();
            // in_flight stays set until re-anchoring completes, so a
            // concurrent load_more cannot start a duplicate page.
            (
                page.items.len(),
                page.next_token.is_some(),
                page.snapshot_marker,
                state.subscription.take(),
            )
        };

        if let Some(previous) = previous {
            self.subscriptions.release(previous);
        }

        if self.kind.watchable {
            match self.anchor_watch(&marker, epoch).await {
                Ok(true) => {}
                Ok(false) => {
                    // Torn down while the watch was being opened.
                    self.state.lock().unwrap().in_flight = false;
                    return Ok(LoadOutcome::Stopped);
                }
                Err(e) => {
                    self.state.lock().unwrap().in_flight = false;
                    return Err(e);
                }
            }
        }

        self.state.lock().unwrap().in_flight = false;
        debug!(
            kind = %self.kind.kind,
            group = %self.kind.group,
            added,
            total = self.store.len(),
            has_more,
            "merged page"
        );
        Ok(LoadOutcome::Loaded { added, has_more })
    }

    /// Drive `load_more` until the enumeration is exhausted. Used where the
    /// reflector's owner (not a consumer) is responsible for completeness,
    /// e.g. the catalog listing. Returns the number of items merged.
    pub async fn sync_full(&self) -> Result<usize, GatewayError> {
        let mut total = 0;
        loop {
            match self.load_more().await? {
                LoadOutcome::Loaded { added, has_more } => {
                    total += added;
                    if !has_more {
                        return Ok(total);
                    }
                }
                LoadOutcome::AlreadyLoading | LoadOutcome::Exhausted | LoadOutcome::Stopped => {
                    return Ok(total);
                }
            }
        }
    }

    /// Returns `Ok(false)` if the reflector was stopped while the watch was
    /// being opened; the stream is dropped uninstalled.
    async fn anchor_watch(&self, marker: &str, epoch: u64) -> Result<bool, GatewayError> {
        let stream = self.gateway.open_watch(&self.kind, marker).await?;

        let mut state = self.state.lock().unwrap();
        if state.epoch != epoch || state.stopped {
            return Ok(false);
        }
        let store = self.store.clone();
        let tap = self.tap.clone();
        let channel = format!("{}:{}", self.kind.api_version(), self.kind.plural);
        let id = self
            .subscriptions
            .install(&self.owner, &channel, stream, move |event| {
                store.apply(&event);
                if let Some(tap) = &tap {
                    tap(&event);
                }
            });
        state.subscription = Some(id);
        Ok(true)
    }

    /// Tear down: release the watch, discard the cache, and invalidate any
    /// in-flight fetch so its result is never merged.
    pub fn stop(&self) {
        let subscription = {
            let mut state = self.state.lock().unwrap();
            state.stopped = true;
            state.epoch += 1;
            state.next_token = None;
            state.subscription.take()
        };
        if let Some(subscription) = subscription {
            self.subscriptions.release(subscription);
        }
        self.store.clear();
        debug!(kind = %self.kind.kind, group = %self.kind.group, "reflector stopped");
    }
}
