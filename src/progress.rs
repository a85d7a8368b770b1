// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Progress reporting for session lifecycle and reflector health.
//!
//! The sync core reports what it is doing on a broadcast channel so a CLI or
//! UI can display it. Failures that leave data stale (a kind that failed to
//! list, a watch that dropped) are reported here as well; the core itself
//! never retries.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Create a spinner with consistent styling
pub fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .template("{spinner:.cyan} {msg} {elapsed:.dim}")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

/// Progress update message
#[derive(Clone, Debug)]
pub enum ProgressUpdate {
    // === Session lifecycle ===
    /// Connecting to a cluster
    Connecting { cluster: String },
    /// Kind catalog discovered
    CatalogLoaded {
        cluster: String,
        kind_count: usize,
        elapsed_ms: u64,
    },
    /// Session is ready; caches are readable
    Ready { cluster: String },
    /// Tearing down one cluster to connect to another
    Switching { from: String, to: String },
    /// Session torn down
    Disconnected { cluster: String },

    // === Reflector health ===
    /// First listing merged for a kind
    ReflectorStarted {
        kind: String,
        group: String,
        items: usize,
    },
    /// A kind's listing failed; its data is stale until retried
    ReflectorFailed {
        kind: String,
        group: String,
        error: String,
    },
    /// A dependent kind disappeared from the catalog and was dropped
    KindDropped { kind: String, group: String },
}

/// Global progress reporter
pub struct ProgressReporter {
    sender: broadcast::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    /// Subscribe to progress updates
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.sender.subscribe()
    }

    pub fn connecting(&self, cluster: &str) {
        let _ = self.sender.send(ProgressUpdate::Connecting {
            cluster: cluster.to_string(),
        });
    }

    pub fn catalog_loaded(&self, cluster: &str, kind_count: usize, elapsed_ms: u64) {
        let _ = self.sender.send(ProgressUpdate::CatalogLoaded {
            cluster: cluster.to_string(),
            kind_count,
            elapsed_ms,
        });
    }

    pub fn ready(&self, cluster: &str) {
        let _ = self.sender.send(ProgressUpdate::Ready {
            cluster: cluster.to_string(),
        });
    }

    pub fn switching(&self, from: &str, to: &str) {
        let _ = self.sender.send(ProgressUpdate::Switching {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    pub fn disconnected(&self, cluster: &str) {
        let _ = self.sender.send(ProgressUpdate::Disconnected {
            cluster: cluster.to_string(),
        });
    }

    pub fn reflector_started(&self, kind: &str, group: &str, items: usize) {
        let _ = self.sender.send(ProgressUpdate::ReflectorStarted {
            kind: kind.to_string(),
            group: group.to_string(),
            items,
        });
    }

    pub fn reflector_failed(&self, kind: &str, group: &str, error: &str) {
        let _ = self.sender.send(ProgressUpdate::ReflectorFailed {
            kind: kind.to_string(),
            group: group.to_string(),
            error: error.to_string(),
        });
    }

    pub fn kind_dropped(&self, kind: &str, group: &str) {
        let _ = self.sender.send(ProgressUpdate::KindDropped {
            kind: kind.to_string(),
            group: group.to_string(),
        });
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to progress reporter
pub type ProgressHandle = Arc<ProgressReporter>;

/// Create a new progress reporter handle
pub fn create_progress_handle() -> ProgressHandle {
    Arc::new(ProgressReporter::new())
}
