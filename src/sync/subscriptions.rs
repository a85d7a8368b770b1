// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Event-channel subscription registry.
//!
//! Every installed watch is tracked here as an explicit handle attributed to
//! one logical owner. Releasing a handle is idempotent and guarantees the
//! handler sees no further events; teardown paths bulk-release by owner so
//! nothing leaks when a reflector, cascade entry, or whole session goes away.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gateway::{WatchEvent, WatchStream};

/// Opaque handle to one installed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Entry {
    owner: String,
    channel: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Process-wide registry of live subscriptions.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a drain task for `stream` and register it under `owner`.
    ///
    /// `on_event` runs for each successful event until the stream ends, the
    /// stream yields an error, or the subscription is released. A release
    /// that races an in-flight event wins: the handler is skipped once the
    /// cancellation token is set.
    pub fn install<F>(
        &self,
        owner: &str,
        channel: &str,
        mut stream: WatchStream,
        mut on_event: F,
    ) -> SubscriptionId
    where
        F: FnMut(WatchEvent) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let channel = channel.to_string();
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        next = stream.next() => match next {
                            Some(Ok(event)) => {
                                if cancel.is_cancelled() {
                                    break;
                                }
                                on_event(event);
                            }
                            Some(Err(e)) => {
                                warn!(channel = %channel, error = %e, "watch channel failed");
                                break;
                            }
                            None => {
                                debug!(channel = %channel, "watch channel closed");
                                break;
                            }
                        },
                    }
                }
            }
        });

        self.entries.lock().unwrap().insert(
            id,
            Entry {
                owner: owner.to_string(),
                channel: channel.to_string(),
                cancel,
                task,
            },
        );
        SubscriptionId(id)
    }

    /// Release one subscription. Safe to call twice; the second call is a
    /// no-op. After return the handler will not run again.
    pub fn release(&self, id: SubscriptionId) {
        let entry = self.entries.lock().unwrap().remove(&id.0);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            entry.task.abort();
            debug!(owner = %entry.owner, channel = %entry.channel, "released subscription");
        }
    }

    /// Release every subscription attributed to `owner`. Returns how many
    /// were released.
    pub fn release_owner(&self, owner: &str) -> usize {
        let drained: Vec<Entry> = {
            let mut entries = self.entries.lock().unwrap();
            let ids: Vec<u64> = entries
                .iter()
                .filter(|(_, e)| e.owner == owner)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| entries.remove(&id)).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.cancel.cancel();
            entry.task.abort();
        }
        if count > 0 {
            debug!(owner = %owner, count, "released subscriptions for owner");
        }
        count
    }

    /// Total live subscriptions.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live subscriptions attributed to `owner`.
    #[allow(dead_code)]
    pub fn count_for_owner(&self, owner: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.owner == owner)
            .count()
    }
}
