//! Per-key serialization of prompt handling.
//!
//! [`KeyedSerializer`] guarantees at most one in-flight operation per opaque
//! string key (the bridge keys by `"{chat_id}:{user_id}"`), FIFO per key,
//! with unrelated keys progressing in parallel. Each caller chains onto the
//! previous caller's completion signal; the map entry self-removes when the
//! last waiter for a key finishes, so bookkeeping never grows past the set
//! of currently-busy conversations.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// The caller was canceled while waiting for its turn on the lane.
///
/// The queued operation was never started.
#[derive(Debug, Error)]
#[error("canceled while waiting for the conversation lane")]
pub struct LaneCanceled;

struct Lane {
    /// Completion signal of the most recently enqueued operation. The next
    /// caller takes it and installs its own.
    tail: Option<oneshot::Receiver<()>>,
    /// Enqueued-but-unfinished operations, including the running one.
    waiters: usize,
}

/// FIFO execution lanes keyed by opaque strings.
#[derive(Default)]
pub struct KeyedSerializer {
    lanes: Mutex<HashMap<String, Lane>>,
}

impl KeyedSerializer {
    /// Create an empty serializer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` once every earlier operation enqueued under `key` has
    /// completed. Operations under distinct keys do not wait on each other.
    ///
    /// If `cancel` fires while waiting, `op` is never polled and
    /// [`LaneCanceled`] is returned. Once `op` is running, cancellation is
    /// its own responsibility; the serializer does not interrupt it.
    pub async fn run<F, T>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, LaneCanceled>
    where
        F: Future<Output = T>,
    {
        let (tx, rx) = oneshot::channel();
        let predecessor = {
            let mut lanes = self.lanes.lock().unwrap();
            let lane = lanes.entry(key.to_string()).or_insert(Lane {
                tail: None,
                waiters: 0,
            });
            lane.waiters += 1;
            lane.tail.replace(rx)
        };

        // Signals the successor (by dropping tx) and releases the lane entry
        // no matter how this call exits.
        let mut guard = LaneGuard {
            serializer: self,
            key,
            tx: Some(tx),
        };

        if let Some(mut prev) = predecessor {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // The successor chained onto us must still wait for the
                    // predecessor, so the completion signal is handed to a
                    // forwarder instead of firing now.
                    if let Some(tx) = guard.tx.take() {
                        tokio::spawn(async move {
                            let _ = prev.await;
                            drop(tx);
                        });
                    }
                    return Err(LaneCanceled);
                }
                // A dropped sender also counts as completion.
                _ = &mut prev => {}
            }
        }

        Ok(op.await)
    }

    /// Number of keys with in-flight or queued operations.
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().unwrap().len()
    }
}

struct LaneGuard<'a> {
    serializer: &'a KeyedSerializer,
    key: &'a str,
    tx: Option<oneshot::Sender<()>>,
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        let mut lanes = self.serializer.lanes.lock().unwrap();
        if let Some(lane) = lanes.get_mut(self.key) {
            lane.waiters -= 1;
            if lane.waiters == 0 {
                lanes.remove(self.key);
            }
        }
    }
}
