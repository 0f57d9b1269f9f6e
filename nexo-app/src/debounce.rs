//! Per-(tenant, end-user) message coalescing.
//!
//! Every inbound slow-path message lands in a keyed buffer with a single
//! cancellable timer. New messages restart the timer (sliding window); expiry
//! removes the buffer atomically and hands the joined text to the flush
//! handler, so a message arriving during a flush starts a disjoint new window.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use nexo_platform::{SenderId, TenantId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub type ConversationKey = (TenantId, SenderId);

/// Receives one joined logical message per expired window.
#[async_trait]
pub trait FlushHandler: Send + Sync {
    async fn flush(&self, tenant: &TenantId, sender: &SenderId, text: String);
}

struct Window {
    texts: Vec<String>,
    // Bumped on every enqueue; a timer only flushes the window it was armed
    // for, so an aborted timer that already passed its sleep cannot steal a
    // refreshed buffer.
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Clone)]
pub struct DebounceAggregator {
    inner: Arc<AggregatorInner>,
}

struct AggregatorInner {
    window: Duration,
    buffers: DashMap<ConversationKey, Window>,
    handler: Arc<dyn FlushHandler>,
}

impl DebounceAggregator {
    pub fn new(window: Duration, handler: Arc<dyn FlushHandler>) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                window,
                buffers: DashMap::new(),
                handler,
            }),
        }
    }

    /// Append `text` to the key's buffer and restart its timer.
    pub fn enqueue(&self, tenant: &TenantId, sender: &SenderId, text: String) {
        let key = (tenant.clone(), sender.clone());
        match self.inner.buffers.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let window = occupied.get_mut();
                window.texts.push(text);
                window.generation += 1;
                window.timer.abort();
                window.timer = self.arm_timer(key, window.generation);
            }
            Entry::Vacant(vacant) => {
                let generation = 0;
                vacant.insert(Window {
                    texts: vec![text],
                    generation,
                    timer: self.arm_timer(key, generation),
                });
            }
        }
    }

    fn arm_timer(&self, key: ConversationKey, generation: u64) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        // Capture the deadline now so the window starts at enqueue time, not
        // at the spawned task's first poll.
        let sleep = tokio::time::sleep(inner.window);
        tokio::spawn(async move {
            sleep.await;
            inner.fire(key, generation).await;
        })
    }

    #[cfg(test)]
    fn active_windows(&self) -> usize {
        self.inner.buffers.len()
    }
}

impl AggregatorInner {
    async fn fire(&self, key: ConversationKey, generation: u64) {
        // Remove-if keeps expiry atomic: either this timer owns the buffer
        // (generations match) or a newer message already restarted the window.
        let Some((_, window)) = self
            .buffers
            .remove_if(&key, |_, window| window.generation == generation)
        else {
            return;
        };
        let (tenant, sender) = key;
        let text = window.texts.join("\n");
        tracing::debug!(%tenant, %sender, messages = window.texts.len(), "debounce window expired");
        self.handler.flush(&tenant, &sender, text).await;
    }
}
