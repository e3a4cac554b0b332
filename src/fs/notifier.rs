//! Per-inode debouncing
//!
//! Each inode that sees writes gets a lightweight task fed through an
//! unbounded channel. The task fires the callback once the inode has been
//! quiet for the configured window, carrying the most recent value sent.
//! Dropping an inode's slot closes the channel and discards any pending
//! notification.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::trace;

use super::registry::Inum;

/// Sender side of one inode's debounce task
pub struct Debounced<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Debounced<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Debounced<T> {
    /// Record a new value and restart the quiet window
    pub fn call(&self, value: T) {
        // A closed channel means the slot was forgotten concurrently
        let _ = self.tx.send(value);
    }
}

/// Debounced notifications keyed by inode
pub struct Debouncer<T> {
    slots: DashMap<Inum, Debounced<T>>,
    quiet: Duration,
    runtime: Handle,
    callback: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new<F>(quiet: Duration, runtime: Handle, callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            slots: DashMap::new(),
            quiet,
            runtime,
            callback: Arc::new(callback),
        }
    }

    /// Debounced function for `inum`, creating it on first use
    pub fn get_or_create(&self, inum: Inum) -> Debounced<T> {
        self.slots
            .entry(inum)
            .or_insert_with(|| self.spawn(inum))
            .clone()
    }

    /// Drop the slot for `inum`, discarding a pending notification
    pub fn forget(&self, inum: Inum) {
        if self.slots.remove(&inum).is_some() {
            trace!("forgot debounce slot for inode {}", inum);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn spawn(&self, inum: Inum) -> Debounced<T> {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let quiet = self.quiet;
        let callback = self.callback.clone();

        self.runtime.spawn(async move {
            while let Some(mut latest) = rx.recv().await {
                loop {
                    tokio::select! {
                        next = rx.recv() => match next {
                            Some(value) => latest = value,
                            None => return,
                        },
                        _ = tokio::time::sleep(quiet) => {
                            trace!("inode {} quiet for {:?}, firing", inum, quiet);
                            callback(latest);
                            break;
                        }
                    }
                }
            }
        });

        Debounced { tx }
    }
}
