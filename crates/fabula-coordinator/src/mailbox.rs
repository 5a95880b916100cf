//! Per-key mailboxes: one bounded queue and one worker task per key, so
//! messages for the same key are handled strictly FIFO while different keys
//! run concurrently.

use dashmap::DashMap;
use tokio::sync::mpsc;

/// Registry of per-key senders. Workers are created lazily on the first
/// message for a key.
///
/// `dispatch` must be called from a single task (the bus hands the
/// coordinator events through one subscription worker), which is what makes
/// lazy worker creation race-free.
pub struct Mailboxes<M: Send + 'static> {
    senders: DashMap<String, mpsc::Sender<M>>,
    capacity: usize,
}

impl<M: Send + 'static> Mailboxes<M> {
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: DashMap::new(),
            capacity,
        }
    }

    /// Enqueue `msg` for `key`, creating the worker on first contact.
    ///
    /// Backpressure: a full mailbox suspends the caller instead of dropping,
    /// so a slow user stalls only their own lane.
    pub async fn dispatch(
        &self,
        key: &str,
        msg: M,
        spawn_worker: impl FnOnce(String, mpsc::Receiver<M>),
    ) {
        let existing = self.senders.get(key).map(|entry| entry.value().clone());
        if let Some(tx) = existing {
            match tx.send(msg).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // Worker died (shutdown or panic); rebuild the lane.
                    self.senders.remove(key);
                    let (tx, rx) = mpsc::channel(self.capacity);
                    spawn_worker(key.to_string(), rx);
                    let _ = tx.send(returned).await;
                    self.senders.insert(key.to_string(), tx);
                    return;
                }
            }
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        spawn_worker(key.to_string(), rx);
        let _ = tx.send(msg).await;
        self.senders.insert(key.to_string(), tx);
    }

    /// Keys with a live mailbox.
    pub fn active(&self) -> Vec<String> {
        self.senders.iter().map(|e| e.key().clone()).collect()
    }

    pub fn remove(&self, key: &str) {
        self.senders.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn per_key_fifo_with_cross_key_concurrency() {
        let mailboxes: Mailboxes<u32> = Mailboxes::new(16);
        let log: Arc<Mutex<Vec<(String, u32)>>> = Arc::new(Mutex::new(Vec::new()));

        for n in 0..5u32 {
            for key in ["a", "b"] {
                let log2 = Arc::clone(&log);
                mailboxes
                    .dispatch(key, n, move |key, mut rx| {
                        let log = log2;
                        tokio::spawn(async move {
                            while let Some(v) = rx.recv().await {
                                log.lock().unwrap().push((key.clone(), v));
                            }
                        });
                    })
                    .await;
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let entries = log.lock().unwrap().clone();
        for key in ["a", "b"] {
            let seq: Vec<u32> = entries
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| *v)
                .collect();
            assert_eq!(seq, vec![0, 1, 2, 3, 4], "order broken for {}", key);
        }
        assert_eq!(mailboxes.active().len(), 2);
    }
}
